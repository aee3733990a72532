//! Update-specification interpreter.
//!
//! Supports `$set`, `$unset`, `$inc`, and `$rename`. A specification with no
//! operator keys replaces the whole document body, keeping `_id`. Returns
//! whether the document actually changed, which drives the modified count.

use eyre::{bail, ensure, Result};

use crate::document::{Document, Value};
use crate::query::path::{lookup_path, remove_path, set_path};

/// Applies an update specification to a document in place.
pub fn apply_update(doc: &mut Document, spec: &Document) -> Result<bool> {
    let has_operators = spec.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        return Ok(replace_body(doc, spec));
    }

    let before = doc.clone();
    for (op, operand) in spec.iter() {
        let fields = operand
            .as_document()
            .ok_or_else(|| eyre::eyre!("{} expects a document operand", op))?;
        match op {
            "$set" => {
                for (path, value) in fields.iter() {
                    ensure!(path != "_id", "$set cannot modify _id");
                    ensure!(
                        set_path(doc, path, value.clone()),
                        "$set path '{}' traverses a non-document value",
                        path
                    );
                }
            }
            "$unset" => {
                for (path, _) in fields.iter() {
                    ensure!(path != "_id", "$unset cannot remove _id");
                    remove_path(doc, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields.iter() {
                    apply_inc(doc, path, delta)?;
                }
            }
            "$rename" => {
                for (from, to) in fields.iter() {
                    let to = to
                        .as_str()
                        .ok_or_else(|| eyre::eyre!("$rename target must be a string"))?;
                    ensure!(from != "_id" && to != "_id", "$rename cannot touch _id");
                    if let Some(value) = remove_path(doc, from) {
                        ensure!(
                            set_path(doc, to, value),
                            "$rename target path '{}' traverses a non-document value",
                            to
                        );
                    }
                }
            }
            other => bail!("unknown update operator {}", other),
        }
    }
    Ok(*doc != before)
}

fn apply_inc(doc: &mut Document, path: &str, delta: &Value) -> Result<()> {
    ensure!(path != "_id", "$inc cannot modify _id");
    ensure!(delta.is_number(), "$inc operand must be numeric");

    let current = lookup_path(doc, path).cloned();
    let next = match current {
        None => delta.clone(),
        Some(existing) => {
            ensure!(
                existing.is_number(),
                "$inc target '{}' holds a non-numeric value",
                path
            );
            add_numbers(&existing, delta)
        }
    };
    ensure!(
        set_path(doc, path, next),
        "$inc path '{}' traverses a non-document value",
        path
    );
    Ok(())
}

fn add_numbers(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Double(_), _) | (_, Value::Double(_)) => {
            Value::Double(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
        }
        (Value::Int32(x), Value::Int32(y)) => match x.checked_add(*y) {
            Some(sum) => Value::Int32(sum),
            None => Value::Int64(*x as i64 + *y as i64),
        },
        _ => Value::Int64(
            a.as_i64()
                .unwrap_or(0)
                .wrapping_add(b.as_i64().unwrap_or(0)),
        ),
    }
}

fn replace_body(doc: &mut Document, replacement: &Document) -> bool {
    let id = doc.remove("_id");
    let mut next = replacement.clone();
    next.remove("_id");
    if let Some(id) = id {
        next.insert_front("_id", id);
    }
    let changed = *doc != next;
    *doc = next;
    changed
}

/// Extracts the plain-equality fields of a filter. Upserts seed the new
/// document from these.
pub fn equality_fields(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter.iter() {
        if key.starts_with('$') {
            continue;
        }
        if let Value::Document(inner) = value {
            if inner.keys().any(|k| k.starts_with('$')) {
                continue;
            }
        }
        if key.contains('.') {
            set_path(&mut seed, key, value.clone());
        } else {
            seed.insert(key.to_string(), value.clone());
        }
    }
    seed
}
