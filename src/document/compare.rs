//! Total cross-type value ordering.
//!
//! Every value compares against every other value; the type order is
//! MinKey < Null < Number < String < Document < Array < Binary < ObjectId <
//! Bool < DateTime/Timestamp < Regex < MaxKey. Within the Number rank,
//! Int32/Int64/Double compare numerically; doubles use `total_cmp` so the
//! order stays total in the presence of NaN. Queries, `distinct`, and sorted
//! test assertions all rely on this function agreeing with itself.

use std::cmp::Ordering;

use super::{Document, Value};

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::MinKey => 0,
        Value::Null => 1,
        Value::Int32(_) | Value::Int64(_) | Value::Double(_) => 2,
        Value::String(_) => 3,
        Value::Document(_) => 4,
        Value::Array(_) => 5,
        Value::Binary(..) => 6,
        Value::ObjectId(_) => 7,
        Value::Bool(_) => 8,
        Value::DateTime(_) | Value::Timestamp(..) => 9,
        Value::Regex(..) => 10,
        Value::MaxKey => 11,
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Value::Null, Value::Null)
        | (Value::MinKey, Value::MinKey)
        | (Value::MaxKey, Value::MaxKey) => Ordering::Equal,

        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),

        (Value::Int32(x), Value::Int32(y)) => x.cmp(y),
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::Int32(x), Value::Int64(y)) => (*x as i64).cmp(y),
        (Value::Int64(x), Value::Int32(y)) => x.cmp(&(*y as i64)),
        _ if a.is_number() && b.is_number() => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }

        (Value::String(x), Value::String(y)) => x.cmp(y),

        (Value::Document(x), Value::Document(y)) => compare_documents(x, y),

        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }

        (Value::Binary(sx, dx), Value::Binary(sy, dy)) => {
            dx.cmp(dy).then(sx.cmp(sy))
        }

        (Value::ObjectId(x), Value::ObjectId(y)) => x.bytes().cmp(y.bytes()),

        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        (Value::Timestamp(ix, sx), Value::Timestamp(iy, sy)) => {
            sx.cmp(sy).then(ix.cmp(iy))
        }
        // Mixed time rank: compare on the seconds axis, timestamps after
        // equal datetimes.
        (Value::DateTime(x), Value::Timestamp(_, sy)) => {
            (x / 1000).cmp(&(*sy as i64)).then(Ordering::Less)
        }
        (Value::Timestamp(_, sx), Value::DateTime(y)) => {
            (*sx as i64).cmp(&(y / 1000)).then(Ordering::Greater)
        }

        (Value::Regex(px, ox), Value::Regex(py, oy)) => px.cmp(py).then(ox.cmp(oy)),

        _ => Ordering::Equal,
    }
}

fn compare_documents(a: &Document, b: &Document) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}
