//! # Write-Ahead Log
//!
//! Append-only redo log backing crash recovery. Every structural or page
//! mutation writes a log record before the data file is touched; on reopen,
//! records past the last checkpoint are replayed.
//!
//! ## File Layout
//!
//! ```text
//! +------------------+
//! | Header (32 bytes)|
//! +------------------+
//! | Record           |  <- 8-byte aligned
//! | Record           |
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Header Layout (32 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  -----------------------------------
//! 0       4     magic           0x57414C4D ("WALM")
//! 4       2     version         Format version, currently 1
//! 6       2     reserved
//! 8       8     checkpoint_lsn  All records <= this are durable
//! 16      8     file_size       Logical end of the record area
//! 24      4     crc             CRC-32 of the first 24 bytes
//! 28      4     reserved
//! ```
//!
//! ## Record Layout (20-byte header + payload, padded to 8)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  -----------------------------------
//! 0       8     lsn        Monotonic sequence number, from 1
//! 8       1     type       Record type (see below)
//! 9       1     flags
//! 10      2     data_len   Payload length
//! 12      4     page_id    Affected page (0 when n/a)
//! 16      4     crc        CRC-32 of bytes 0..16 plus payload
//! ```
//!
//! Record types: page-write (1, full page image), alloc-page (2, one-byte
//! page type), free-page (3), commit (4), checkpoint (5, u64 LSN),
//! meta-update (6, subtype u8 + old u32 + new u32). Meta subtypes:
//! free-list head (1), page count (2), catalog page id (3).
//!
//! ## Torn Tail Handling
//!
//! A crash can leave a half-written record at the end of the log. The
//! opening scan validates each record's CRC and stops at the first failure;
//! everything from that offset on is discarded and the file is truncated
//! back to the last valid record. Corruption in the 32-byte header itself
//! is not recoverable and surfaces as `CorruptWal`.
//!
//! ## Checkpoints
//!
//! `checkpoint(lsn)` appends a checkpoint record, advances the header's
//! checkpoint LSN, and fsyncs. When auto-truncate is on and the body has
//! grown past 64 MiB, the record area is dropped entirely; the LSN sequence
//! continues from the header.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result, WrapErr};
use tracing::warn;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::PAGE_SIZE;
use crate::error::DbError;

pub const WAL_MAGIC: u32 = 0x5741_4C4D;
pub const WAL_VERSION: u16 = 1;
pub const WAL_HEADER_SIZE: usize = 32;
pub const WAL_RECORD_HEADER_SIZE: usize = 20;
pub const WAL_AUTO_TRUNCATE_THRESHOLD: u64 = 64 * 1024 * 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    PageWrite = 1,
    AllocPage = 2,
    FreePage = 3,
    Commit = 4,
    Checkpoint = 5,
    MetaUpdate = 6,
}

impl RecordType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordType::PageWrite),
            2 => Some(RecordType::AllocPage),
            3 => Some(RecordType::FreePage),
            4 => Some(RecordType::Commit),
            5 => Some(RecordType::Checkpoint),
            6 => Some(RecordType::MetaUpdate),
            _ => None,
        }
    }
}

/// Header field addressed by a meta-update record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaField {
    FreeListHead = 1,
    PageCount = 2,
    CatalogPageId = 3,
}

impl MetaField {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(MetaField::FreeListHead),
            2 => Some(MetaField::PageCount),
            3 => Some(MetaField::CatalogPageId),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WalFileHeader {
    magic: U32,
    version: U16,
    reserved: [u8; 2],
    checkpoint_lsn: U64,
    file_size: U64,
    crc: U32,
    reserved2: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<WalFileHeader>() == WAL_HEADER_SIZE);

impl WalFileHeader {
    fn new(checkpoint_lsn: u64, file_size: u64) -> Self {
        let mut header = Self {
            magic: U32::new(WAL_MAGIC),
            version: U16::new(WAL_VERSION),
            reserved: [0; 2],
            checkpoint_lsn: U64::new(checkpoint_lsn),
            file_size: U64::new(file_size),
            crc: U32::new(0),
            reserved2: [0; 4],
        };
        header.crc = U32::new(header.compute_crc());
        header
    }

    fn compute_crc(&self) -> u32 {
        CRC32.checksum(&self.as_bytes()[..24])
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WalRecordHeader {
    lsn: U64,
    record_type: u8,
    flags: u8,
    data_len: U16,
    page_id: U32,
    crc: U32,
}

const _: () = assert!(std::mem::size_of::<WalRecordHeader>() == WAL_RECORD_HEADER_SIZE);

fn record_crc(header: &WalRecordHeader, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&header.as_bytes()[..16]);
    digest.update(payload);
    digest.finalize()
}

fn padded_len(data_len: usize) -> usize {
    let raw = WAL_RECORD_HEADER_SIZE + data_len;
    (raw + 7) & !7
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: u64,
    pub record_type: RecordType,
    pub page_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct Wal {
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
    current_lsn: u64,
    checkpoint_lsn: u64,
    write_offset: u64,
    auto_truncate: bool,
    /// True when `open` found an existing log, meaning recovery may apply.
    pre_existing: bool,
}

impl Wal {
    pub fn open(path: &Path, auto_truncate: bool) -> Result<Self> {
        let pre_existing = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;

        if !pre_existing || file.metadata()?.len() < WAL_HEADER_SIZE as u64 {
            let header = WalFileHeader::new(0, WAL_HEADER_SIZE as u64);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(header.as_bytes())
                .wrap_err("failed to write fresh WAL header")?;
            file.sync_all().wrap_err("failed to sync fresh WAL header")?;
            return Ok(Self {
                file,
                path: path.to_path_buf(),
                current_lsn: 1,
                checkpoint_lsn: 0,
                write_offset: WAL_HEADER_SIZE as u64,
                auto_truncate,
                pre_existing: false,
            });
        }

        let mut header_bytes = [0u8; WAL_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)
            .wrap_err("failed to read WAL header")?;

        let header = WalFileHeader::ref_from_bytes(&header_bytes)
            .map_err(|e| eyre::eyre!("failed to parse WAL header: {:?}", e))?;
        ensure!(
            header.magic.get() == WAL_MAGIC,
            DbError::CorruptWal(format!("bad magic 0x{:08X}", header.magic.get()))
        );
        ensure!(
            header.version.get() == WAL_VERSION,
            DbError::CorruptWal(format!("unsupported version {}", header.version.get()))
        );
        ensure!(
            header.crc.get() == header.compute_crc(),
            DbError::CorruptWal("header CRC mismatch".to_string())
        );

        let checkpoint_lsn = header.checkpoint_lsn.get();
        let mut wal = Self {
            file,
            path: path.to_path_buf(),
            current_lsn: checkpoint_lsn + 1,
            checkpoint_lsn,
            write_offset: WAL_HEADER_SIZE as u64,
            auto_truncate,
            pre_existing: true,
        };

        // Forward scan: raise the LSN past every valid record, stop at the
        // first bad one and drop the tail.
        let body = wal.read_body()?;
        let mut offset = 0usize;
        let mut valid_end = 0usize;
        while let Some((record, consumed)) = scan_one(&body[offset..]) {
            wal.current_lsn = wal.current_lsn.max(record.lsn + 1);
            offset += consumed;
            valid_end = offset;
        }
        if valid_end < body.len() {
            warn!(
                dropped = body.len() - valid_end,
                "truncating torn WAL tail"
            );
        }
        wal.write_offset = (WAL_HEADER_SIZE + valid_end) as u64;
        wal.file
            .set_len(wal.write_offset)
            .wrap_err("failed to truncate WAL tail")?;
        Ok(wal)
    }

    /// Whether `open` found a log left behind by a previous process.
    pub fn pre_existing(&self) -> bool {
        self.pre_existing
    }

    pub fn current_lsn(&self) -> u64 {
        self.current_lsn
    }

    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn
    }

    pub fn body_len(&self) -> u64 {
        self.write_offset - WAL_HEADER_SIZE as u64
    }

    fn read_body(&mut self) -> Result<Vec<u8>> {
        let len = self.file.metadata()?.len().saturating_sub(WAL_HEADER_SIZE as u64);
        let mut body = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        self.file
            .read_exact(&mut body)
            .wrap_err("failed to read WAL body")?;
        Ok(body)
    }

    fn append(&mut self, record_type: RecordType, page_id: u32, payload: &[u8]) -> Result<u64> {
        ensure!(
            payload.len() <= u16::MAX as usize,
            "WAL payload of {} bytes exceeds u16 length field",
            payload.len()
        );

        let lsn = self.current_lsn;
        let mut header = WalRecordHeader {
            lsn: U64::new(lsn),
            record_type: record_type as u8,
            flags: 0,
            data_len: U16::new(payload.len() as u16),
            page_id: U32::new(page_id),
            crc: U32::new(0),
        };
        header.crc = U32::new(record_crc(&header, payload));

        let total = padded_len(payload.len());
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(payload);
        frame.resize(total, 0);

        self.file.seek(SeekFrom::Start(self.write_offset))?;
        self.file
            .write_all(&frame)
            .wrap_err("failed to append WAL record")?;

        self.write_offset += total as u64;
        self.current_lsn += 1;
        Ok(lsn)
    }

    pub fn write_page_record(&mut self, page_id: u32, image: &[u8]) -> Result<u64> {
        ensure!(
            image.len() == PAGE_SIZE,
            "page image must be {} bytes, got {}",
            PAGE_SIZE,
            image.len()
        );
        self.append(RecordType::PageWrite, page_id, image)
    }

    pub fn write_alloc_record(&mut self, page_id: u32, page_type: u8) -> Result<u64> {
        self.append(RecordType::AllocPage, page_id, &[page_type])
    }

    pub fn write_free_record(&mut self, page_id: u32) -> Result<u64> {
        self.append(RecordType::FreePage, page_id, &[])
    }

    pub fn write_meta_record(&mut self, field: MetaField, old: u32, new: u32) -> Result<u64> {
        let mut payload = [0u8; 9];
        payload[0] = field as u8;
        payload[1..5].copy_from_slice(&old.to_le_bytes());
        payload[5..9].copy_from_slice(&new.to_le_bytes());
        self.append(RecordType::MetaUpdate, 0, &payload)
    }

    pub fn write_commit_record(&mut self) -> Result<u64> {
        self.append(RecordType::Commit, 0, &[])
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().wrap_err("failed to sync WAL")
    }

    /// Records that all LSNs up to and including `lsn` are durable in the
    /// data file. Rewrites the header, fsyncs, and optionally drops an
    /// oversized body.
    pub fn checkpoint(&mut self, lsn: u64) -> Result<()> {
        self.append(RecordType::Checkpoint, 0, &lsn.to_le_bytes())?;
        self.checkpoint_lsn = lsn;

        if self.auto_truncate && self.body_len() > WAL_AUTO_TRUNCATE_THRESHOLD {
            self.file
                .set_len(WAL_HEADER_SIZE as u64)
                .wrap_err("failed to truncate WAL body at checkpoint")?;
            self.write_offset = WAL_HEADER_SIZE as u64;
        }

        self.rewrite_header()?;
        self.sync()
    }

    fn rewrite_header(&mut self) -> Result<()> {
        let header = WalFileHeader::new(self.checkpoint_lsn, self.write_offset);
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(header.as_bytes())
            .wrap_err("failed to rewrite WAL header")
    }

    /// Returns all valid records with `lsn >= start_lsn`, in log order.
    pub fn read_records_from(&mut self, start_lsn: u64) -> Result<Vec<WalRecord>> {
        let body = self.read_body()?;
        let mut records = Vec::new();
        let mut offset = 0usize;
        while let Some((record, consumed)) = scan_one(&body[offset..]) {
            offset += consumed;
            if record.lsn >= start_lsn {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Persists the header on clean shutdown so the next open starts from
    /// an accurate logical size.
    pub fn close(mut self) -> Result<()> {
        self.rewrite_header()?;
        self.sync()
    }
}

/// Decodes one record from the front of `buf`. Returns `None` at a clean
/// end, a short read, or a CRC mismatch; the caller treats all three as the
/// logical end of the log.
fn scan_one(buf: &[u8]) -> Option<(WalRecord, usize)> {
    if buf.len() < WAL_RECORD_HEADER_SIZE {
        return None;
    }
    let header = WalRecordHeader::ref_from_bytes(&buf[..WAL_RECORD_HEADER_SIZE]).ok()?;
    if header.lsn.get() == 0 {
        return None;
    }
    let record_type = RecordType::from_byte(header.record_type)?;
    let data_len = header.data_len.get() as usize;
    let total = padded_len(data_len);
    if buf.len() < total {
        return None;
    }
    let payload = &buf[WAL_RECORD_HEADER_SIZE..WAL_RECORD_HEADER_SIZE + data_len];
    if record_crc(header, payload) != header.crc.get() {
        return None;
    }
    Some((
        WalRecord {
            lsn: header.lsn.get(),
            record_type,
            page_id: header.page_id.get(),
            payload: payload.to_vec(),
        },
        total,
    ))
}
