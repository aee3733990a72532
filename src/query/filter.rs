//! Filter interpreter.
//!
//! A filter is itself a document. Fields match by equality unless the value
//! is an operator document (`{"age": {"$gt": 30}}`). `$and` / `$or` take
//! arrays of sub-filters. An absent field compares as Null, so
//! `{"x": null}` matches documents without `x`; `$exists` tests presence.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use crate::document::{compare_values, Document, Value};
use crate::query::path::lookup_path;

/// Evaluates a filter against a document.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter.iter() {
        let hit = match key {
            "$and" => combine(doc, condition, true)?,
            "$or" => combine(doc, condition, false)?,
            "$not" => {
                let inner = condition
                    .as_document()
                    .ok_or_else(|| eyre::eyre!("$not expects a document"))?;
                !matches(doc, inner)?
            }
            _ => field_matches(doc, key, condition)?,
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

fn combine(doc: &Document, condition: &Value, all: bool) -> Result<bool> {
    let clauses = condition
        .as_array()
        .ok_or_else(|| eyre::eyre!("$and/$or expect an array of filters"))?;
    ensure!(!clauses.is_empty(), "$and/$or require at least one clause");
    for clause in clauses {
        let sub = clause
            .as_document()
            .ok_or_else(|| eyre::eyre!("$and/$or clauses must be documents"))?;
        let hit = matches(doc, sub)?;
        if all && !hit {
            return Ok(false);
        }
        if !all && hit {
            return Ok(true);
        }
    }
    Ok(all)
}

fn field_matches(doc: &Document, path: &str, condition: &Value) -> Result<bool> {
    if let Value::Document(cond_doc) = condition {
        if cond_doc.keys().any(|k| k.starts_with('$')) {
            return operators_match(doc, path, cond_doc);
        }
    }
    let actual = lookup_path(doc, path).unwrap_or(&Value::Null);
    Ok(compare_values(actual, condition) == Ordering::Equal)
}

fn operators_match(doc: &Document, path: &str, ops: &Document) -> Result<bool> {
    let field = lookup_path(doc, path);
    for (op, operand) in ops.iter() {
        let actual = field.unwrap_or(&Value::Null);
        let hit = match op {
            "$eq" => compare_values(actual, operand) == Ordering::Equal,
            "$ne" => compare_values(actual, operand) != Ordering::Equal,
            "$gt" => field.is_some() && compare_values(actual, operand) == Ordering::Greater,
            "$gte" => field.is_some() && compare_values(actual, operand) != Ordering::Less,
            "$lt" => field.is_some() && compare_values(actual, operand) == Ordering::Less,
            "$lte" => field.is_some() && compare_values(actual, operand) != Ordering::Greater,
            "$in" => in_set(actual, operand)?,
            "$nin" => !in_set(actual, operand)?,
            "$exists" => {
                let want = operand.as_bool().unwrap_or(true);
                field.is_some() == want
            }
            other => bail!("unknown filter operator {}", other),
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_set(actual: &Value, operand: &Value) -> Result<bool> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| eyre::eyre!("$in/$nin expect an array"))?;
    Ok(candidates
        .iter()
        .any(|c| compare_values(actual, c) == Ordering::Equal))
}
