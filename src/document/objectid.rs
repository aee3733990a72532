//! 12-byte document identifiers.
//!
//! Layout: 4-byte big-endian unix seconds, 5 random bytes fixed per process,
//! 3-byte big-endian counter that increments for every generated id. The
//! counter wraps at 2^24 and is seeded randomly at first use.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

struct GeneratorState {
    random: [u8; 5],
    counter: u32,
}

static GENERATOR: Mutex<Option<GeneratorState>> = Mutex::new(None);

impl ObjectId {
    pub fn generate() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as u32;

        let mut guard = GENERATOR.lock();
        let state = guard.get_or_insert_with(|| GeneratorState {
            random: rand::random::<[u8; 5]>(),
            counter: rand::random::<u32>() & 0x00FF_FFFF,
        });

        state.counter = state.counter.wrapping_add(1) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(&state.random);
        bytes[9..12].copy_from_slice(&state.counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(24);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        let c = ObjectId::generate();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn counter_increments_monotonically() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();

        let counter = |id: &ObjectId| {
            let b = id.bytes();
            u32::from_be_bytes([0, b[9], b[10], b[11]])
        };

        // Other tests generate ids concurrently, so allow a small gap;
        // the counter still only moves forward (mod 2^24).
        let advance = counter(&b).wrapping_sub(counter(&a)) & 0x00FF_FFFF;
        assert!(
            (1..=64).contains(&advance),
            "counter advanced by {}",
            advance
        );
    }

    #[test]
    fn random_block_is_stable_within_process() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();

        assert_eq!(&a.bytes()[4..9], &b.bytes()[4..9]);
    }

    #[test]
    fn timestamp_is_plausible() {
        let id = ObjectId::generate();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;

        assert!(id.timestamp_secs() <= now);
        assert!(id.timestamp_secs() >= now - 5);
    }

    #[test]
    fn hex_rendering_is_24_chars() {
        let id = ObjectId::from_bytes([0xAB; 12]);
        assert_eq!(id.to_hex(), "abababababababababababab");
    }
}
