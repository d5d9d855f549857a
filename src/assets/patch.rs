//! RFC 6902 JSON Patch application for incremental asset updates.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
  #[error("malformed patch document: {0}")]
  Malformed(String),
  #[error("invalid json pointer '{0}'")]
  InvalidPointer(String),
  #[error("path '{0}' does not exist")]
  MissingPath(String),
  #[error("test failed at '{0}'")]
  TestFailed(String),
  #[error("cannot move '{from}' into its own child '{path}'")]
  MoveIntoChild { from: String, path: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
  Add { path: String, value: Value },
  Remove { path: String },
  Replace { path: String, value: Value },
  Move { from: String, path: String },
  Copy { from: String, path: String },
  Test { path: String, value: Value },
}

/// Parse a patch document (a JSON array of operations).
pub fn parse_patch(diff: &Value) -> Result<Vec<PatchOp>, PatchError> {
  serde_json::from_value(diff.clone()).map_err(|e| PatchError::Malformed(e.to_string()))
}

/// Apply `ops` to a copy of `doc`. The input is never modified, so a failed
/// patch leaves the caller's document intact.
pub fn apply_patch(doc: &Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
  let mut out = doc.clone();
  for op in ops {
    apply_op(&mut out, op)?;
  }
  Ok(out)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
  match op {
    PatchOp::Add { path, value } => add(doc, path, value.clone()),
    PatchOp::Remove { path } => remove(doc, path).map(|_| ()),
    PatchOp::Replace { path, value } => {
      let target = pointer_mut(doc, path)?;
      *target = value.clone();
      Ok(())
    }
    PatchOp::Move { from, path } => {
      if path.starts_with(&format!("{}/", from)) {
        return Err(PatchError::MoveIntoChild {
          from: from.clone(),
          path: path.clone(),
        });
      }
      let value = remove(doc, from)?;
      add(doc, path, value)
    }
    PatchOp::Copy { from, path } => {
      let value = pointer(doc, from)?.clone();
      add(doc, path, value)
    }
    PatchOp::Test { path, value } => {
      if pointer(doc, path)? == value {
        Ok(())
      } else {
        Err(PatchError::TestFailed(path.clone()))
      }
    }
  }
}

fn parse_pointer(path: &str) -> Result<Vec<String>, PatchError> {
  if path.is_empty() {
    return Ok(Vec::new());
  }
  let rest = path
    .strip_prefix('/')
    .ok_or_else(|| PatchError::InvalidPointer(path.to_string()))?;
  Ok(
    rest
      .split('/')
      .map(|token| token.replace("~1", "/").replace("~0", "~"))
      .collect(),
  )
}

fn pointer<'a>(doc: &'a Value, path: &str) -> Result<&'a Value, PatchError> {
  let mut current = doc;
  for token in parse_pointer(path)? {
    current = match current {
      Value::Object(map) => map.get(&token),
      Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
      _ => None,
    }
    .ok_or_else(|| PatchError::MissingPath(path.to_string()))?;
  }
  Ok(current)
}

fn pointer_mut<'a>(doc: &'a mut Value, path: &str) -> Result<&'a mut Value, PatchError> {
  let mut current = doc;
  for token in parse_pointer(path)? {
    current = match current {
      Value::Object(map) => map.get_mut(&token),
      Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
      _ => None,
    }
    .ok_or_else(|| PatchError::MissingPath(path.to_string()))?;
  }
  Ok(current)
}

/// Split a pointer into its parent pointer and final token.
fn split_last(path: &str) -> Result<(String, String), PatchError> {
  let mut tokens = parse_pointer(path)?;
  let last = tokens
    .pop()
    .ok_or_else(|| PatchError::InvalidPointer(path.to_string()))?;
  let parent = tokens
    .iter()
    .map(|t| format!("/{}", t.replace('~', "~0").replace('/', "~1")))
    .collect::<String>();
  Ok((parent, last))
}

fn add(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
  if path.is_empty() {
    *doc = value;
    return Ok(());
  }
  let (parent, last) = split_last(path)?;
  match pointer_mut(doc, &parent)? {
    Value::Object(map) => {
      map.insert(last, value);
      Ok(())
    }
    Value::Array(items) => {
      if last == "-" {
        items.push(value);
        return Ok(());
      }
      let index = last
        .parse::<usize>()
        .map_err(|_| PatchError::InvalidPointer(path.to_string()))?;
      if index > items.len() {
        return Err(PatchError::MissingPath(path.to_string()));
      }
      items.insert(index, value);
      Ok(())
    }
    _ => Err(PatchError::MissingPath(path.to_string())),
  }
}

fn remove(doc: &mut Value, path: &str) -> Result<Value, PatchError> {
  let (parent, last) = split_last(path)?;
  match pointer_mut(doc, &parent)? {
    Value::Object(map) => map
      .remove(&last)
      .ok_or_else(|| PatchError::MissingPath(path.to_string())),
    Value::Array(items) => {
      let index = last
        .parse::<usize>()
        .map_err(|_| PatchError::InvalidPointer(path.to_string()))?;
      if index >= items.len() {
        return Err(PatchError::MissingPath(path.to_string()));
      }
      Ok(items.remove(index))
    }
    _ => Err(PatchError::MissingPath(path.to_string())),
  }
}
