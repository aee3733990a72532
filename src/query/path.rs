//! Dotted-path field resolution.
//!
//! A path like `address.city` descends nested documents; a numeric segment
//! addresses an array element. Lookup is non-allocating on the happy path.

use smallvec::SmallVec;

use crate::document::{Document, Value};

type Segments<'a> = SmallVec<[&'a str; 4]>;

fn split(path: &str) -> Segments<'_> {
    path.split('.').collect()
}

/// Resolves a dotted path against a document. Returns `None` when any
/// segment is missing or traverses a non-container value.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let segments = split(path);
    let (first, rest) = segments.split_first()?;
    let mut current = doc.get(first)?;
    for seg in rest {
        current = match current {
            Value::Document(inner) => inner.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets the value at a dotted path, creating intermediate documents for
/// missing segments. Returns false when the path traverses a non-document
/// value (arrays are not auto-created).
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> bool {
    let segments = split(path);
    set_in(doc, &segments, value)
}

fn set_in(doc: &mut Document, segments: &[&str], value: Value) -> bool {
    let (first, rest) = match segments.split_first() {
        Some(parts) => parts,
        None => return false,
    };

    if rest.is_empty() {
        doc.insert(first.to_string(), value);
        return true;
    }

    if !doc.contains_key(*first) {
        doc.insert(first.to_string(), Document::new());
    }
    match doc.get_mut(first) {
        Some(Value::Document(inner)) => set_in(inner, rest, value),
        _ => false,
    }
}

/// Removes the value at a dotted path. Returns the removed value.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let segments = split(path);
    remove_in(doc, &segments)
}

fn remove_in(doc: &mut Document, segments: &[&str]) -> Option<Value> {
    let (first, rest) = segments.split_first()?;
    if rest.is_empty() {
        return doc.remove(first);
    }
    match doc.get_mut(first) {
        Some(Value::Document(inner)) => remove_in(inner, rest),
        _ => None,
    }
}
