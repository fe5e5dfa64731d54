//! Structural diff and patch application for JSON documents.
//!
//! Patches follow RFC 6902: an ordered list of `add`, `remove`, `replace`,
//! `move`, `copy` and `test` operations addressed by RFC 6901 JSON pointers.
//!
//! # Diff algorithm
//!
//! [`generate`] walks both documents in lockstep:
//!
//! 1. Object keys of the old document are visited in reverse order. Keys that
//!    vanished become `remove`, keys present on both sides are compared
//!    recursively.
//! 2. Keys only present in the new document become `add`, in the new
//!    document's key order.
//! 3. Arrays are compared index by index. Surplus old elements are removed
//!    from the tail first so earlier indices stay valid.
//! 4. Any change of kind (object, array, scalar) is a single `replace`.
//!
//! The output is deterministic for a given pair of inputs. `move` and `copy`
//! are never generated, only applied.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { path: String, from: String },
    Copy { path: String, from: String },
    Test { path: String, value: Value },
}

impl PatchOperation {
    /// Target path of the operation.
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Move { path, .. }
            | PatchOperation::Copy { path, .. }
            | PatchOperation::Test { path, .. } => path,
        }
    }

    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            PatchOperation::Add { .. } => "add",
            PatchOperation::Remove { .. } => "remove",
            PatchOperation::Replace { .. } => "replace",
            PatchOperation::Move { .. } => "move",
            PatchOperation::Copy { .. } => "copy",
            PatchOperation::Test { .. } => "test",
        }
    }
}

/// An ordered sequence of patch operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Vec<PatchOperation>);

impl Patch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the patch has no operations.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an operation.
    pub fn push(&mut self, op: PatchOperation) {
        self.0.push(op);
    }

    /// Iterate over the operations in application order.
    pub fn iter(&self) -> std::slice::Iter<'_, PatchOperation> {
        self.0.iter()
    }

    /// Target paths of all operations, in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(PatchOperation::path)
    }

    /// Borrow the operations as a slice.
    pub fn operations(&self) -> &[PatchOperation] {
        &self.0
    }

    /// Serialize to the wire representation (a JSON array).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Vec<PatchOperation>> for Patch {
    fn from(ops: Vec<PatchOperation>) -> Self {
        Self(ops)
    }
}

impl FromIterator<PatchOperation> for Patch {
    fn from_iter<I: IntoIterator<Item = PatchOperation>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Patch {
    type Item = PatchOperation;
    type IntoIter = std::vec::IntoIter<PatchOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Patch {
    type Item = &'a PatchOperation;
    type IntoIter = std::slice::Iter<'a, PatchOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================================================
// JSON Pointer
// ============================================================================

/// Escape a single key for use as a pointer token.
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Split a pointer into unescaped tokens. The empty pointer addresses the root.
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| Error::InvalidPointer(pointer.to_string()))?;
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Parse an array index token. Leading zeros and signs are rejected.
fn array_index(token: &str) -> Option<usize> {
    let canonical = token == "0"
        || (!token.is_empty()
            && !token.starts_with('0')
            && token.bytes().all(|b| b.is_ascii_digit()));
    if canonical {
        token.parse().ok()
    } else {
        None
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Generate
// ============================================================================

/// Compute the patch that turns `old` into `new`.
pub fn generate(old: &Value, new: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_values(old, new, "", &mut ops);
    Patch(ops)
}

fn diff_values(old: &Value, new: &Value, path: &str, ops: &mut Vec<PatchOperation>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => diff_objects(old, new, path, ops),
        (Value::Array(old), Value::Array(new)) => diff_arrays(old, new, path, ops),
        _ => ops.push(PatchOperation::Replace {
            path: path.to_string(),
            value: new.clone(),
        }),
    }
}

fn diff_objects(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    path: &str,
    ops: &mut Vec<PatchOperation>,
) {
    for (key, old_value) in old.iter().rev() {
        let child = format!("{}/{}", path, escape_token(key));
        match new.get(key) {
            Some(new_value) => diff_values(old_value, new_value, &child, ops),
            None => ops.push(PatchOperation::Remove { path: child }),
        }
    }

    for (key, new_value) in new {
        if !old.contains_key(key) {
            ops.push(PatchOperation::Add {
                path: format!("{}/{}", path, escape_token(key)),
                value: new_value.clone(),
            });
        }
    }
}

fn diff_arrays(old: &[Value], new: &[Value], path: &str, ops: &mut Vec<PatchOperation>) {
    for (i, old_value) in old.iter().enumerate().rev() {
        let child = format!("{}/{}", path, i);
        match new.get(i) {
            Some(new_value) => diff_values(old_value, new_value, &child, ops),
            None => ops.push(PatchOperation::Remove { path: child }),
        }
    }

    for (i, new_value) in new.iter().enumerate().skip(old.len()) {
        ops.push(PatchOperation::Add {
            path: format!("{}/{}", path, i),
            value: new_value.clone(),
        });
    }
}

// ============================================================================
// Apply
// ============================================================================

/// Apply a patch to `doc` in place.
///
/// Operations run strictly in order. Application is not transactional: when
/// an operation fails, the ones before it stay applied and the error names
/// the failing operation's index.
pub fn apply(doc: &mut Value, patch: &Patch) -> Result<()> {
    for (index, op) in patch.iter().enumerate() {
        apply_operation(doc, op, index)?;
    }
    Ok(())
}

/// Apply a patch to an owned document, returning the (possibly partially)
/// patched document along with the outcome.
pub fn apply_to(mut doc: Value, patch: &Patch) -> (Value, Result<()>) {
    let outcome = apply(&mut doc, patch);
    (doc, outcome)
}

fn apply_operation(doc: &mut Value, op: &PatchOperation, index: usize) -> Result<()> {
    match op {
        PatchOperation::Add { path, value } => add(doc, path, value.clone(), index),
        PatchOperation::Remove { path } => remove(doc, path, index).map(drop),
        PatchOperation::Replace { path, value } => {
            let tokens = parse_pointer(path)?;
            let target = resolve_mut(doc, &tokens, path, index)?;
            *target = value.clone();
            Ok(())
        }
        PatchOperation::Move { path, from } => {
            if path == from {
                return Ok(());
            }
            if path.starts_with(&format!("{}/", from)) {
                return Err(Error::InvalidTarget {
                    index,
                    op: "move",
                    path: path.clone(),
                    reason: format!("{} is a child of {}", path, from),
                });
            }
            let value = remove(doc, from, index)?;
            add(doc, path, value, index)
        }
        PatchOperation::Copy { path, from } => {
            let tokens = parse_pointer(from)?;
            let value = resolve(doc, &tokens, from, index)?.clone();
            add(doc, path, value, index)
        }
        PatchOperation::Test { path, value } => {
            let tokens = parse_pointer(path)?;
            if resolve(doc, &tokens, path, index)? == value {
                Ok(())
            } else {
                Err(Error::TestFailed {
                    index,
                    path: path.clone(),
                })
            }
        }
    }
}

fn resolve<'a>(doc: &'a Value, tokens: &[String], path: &str, index: usize) -> Result<&'a Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get(token),
            Value::Array(items) => array_index(token).and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| Error::PathNotFound {
            index,
            path: path.to_string(),
        })?;
    }
    Ok(current)
}

fn resolve_mut<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    path: &str,
    index: usize,
) -> Result<&'a mut Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => array_index(token).and_then(|i| items.get_mut(i)),
            _ => None,
        }
        .ok_or_else(|| Error::PathNotFound {
            index,
            path: path.to_string(),
        })?;
    }
    Ok(current)
}

fn add(doc: &mut Value, path: &str, value: Value, index: usize) -> Result<()> {
    let tokens = parse_pointer(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };

    match resolve_mut(doc, parents, path, index)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let i = array_index(last).ok_or_else(|| Error::InvalidPointer(path.to_string()))?;
            if i > items.len() {
                return Err(Error::IndexOutOfBounds {
                    index,
                    path: path.to_string(),
                });
            }
            items.insert(i, value);
            Ok(())
        }
        other => Err(Error::InvalidTarget {
            index,
            op: "add",
            path: path.to_string(),
            reason: format!("parent is {}", kind(other)),
        }),
    }
}

fn remove(doc: &mut Value, path: &str, index: usize) -> Result<Value> {
    let tokens = parse_pointer(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        return Err(Error::InvalidTarget {
            index,
            op: "remove",
            path: path.to_string(),
            reason: "the document root cannot be removed".to_string(),
        });
    };

    let not_found = || Error::PathNotFound {
        index,
        path: path.to_string(),
    };

    match resolve_mut(doc, parents, path, index)? {
        Value::Object(map) => map.remove(last).ok_or_else(not_found),
        Value::Array(items) => {
            let i = array_index(last).ok_or_else(not_found)?;
            if i >= items.len() {
                return Err(Error::IndexOutOfBounds {
                    index,
                    path: path.to_string(),
                });
            }
            Ok(items.remove(i))
        }
        _ => Err(not_found()),
    }
}
