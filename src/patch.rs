use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: impl Into<Value>) -> Self {
        PatchOp::Add {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        PatchOp::Replace {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        PatchOp::Remove { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("malformed patch op: {0}")]
    Malformed(String),
    #[error("invalid json pointer `{0}`")]
    InvalidPointer(String),
    #[error("path `{0}` does not exist")]
    PathNotFound(String),
    #[error("invalid array index `{index}` at `{path}`")]
    InvalidIndex { path: String, index: String },
    #[error("index {index} out of bounds (len {len}) at `{path}`")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },
    #[error("path `{0}` does not point into an object or array")]
    NotAContainer(String),
    #[error("cannot remove the document root")]
    RootRemoval,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamedDocument {
    root: Value,
}

impl Default for StreamedDocument {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }
}

impl StreamedDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    pub fn apply(&mut self, ops: &[PatchOp]) -> Vec<PatchError> {
        let mut failures = Vec::new();
        for op in ops {
            if let Err(err) = apply_op(&mut self.root, op) {
                tracing::warn!("skipping patch op on `{}`: {}", op.path(), err);
                failures.push(err);
            }
        }
        failures
    }

    pub fn apply_raw(&mut self, ops: &[Value]) -> Vec<PatchError> {
        let mut failures = Vec::new();
        for raw in ops {
            let result = serde_json::from_value::<PatchOp>(raw.clone())
                .map_err(|err| PatchError::Malformed(err.to_string()))
                .and_then(|op| apply_op(&mut self.root, &op));

            if let Err(err) = result {
                tracing::warn!("skipping patch op: {}", err);
                failures.push(err);
            }
        }
        failures
    }

    pub fn run_id(&self) -> Option<&str> {
        self.root.get("id").and_then(Value::as_str)
    }

    pub fn answer_text(&self) -> Option<String> {
        let fragments = self.root.get("streamed_output")?.as_array()?;
        Some(fragments.iter().filter_map(Value::as_str).collect())
    }

    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.root.pointer(pointer)
    }
}

pub fn apply_op(document: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let tokens = parse_pointer(op.path())?;

    let Some((last, parents)) = tokens.split_last() else {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *document = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(PatchError::RootRemoval),
        };
    };

    match op {
        PatchOp::Add { path, value } => {
            let parent = walk(document, parents, last, true, path)?;
            insert(parent, last, value.clone(), path)
        }
        PatchOp::Replace { path, value } => {
            let parent = walk(document, parents, last, false, path)?;
            let slot = child_mut(parent, last, path)?;
            *slot = value.clone();
            Ok(())
        }
        PatchOp::Remove { path } => {
            let parent = walk(document, parents, last, false, path)?;
            remove(parent, last, path)
        }
    }
}

pub fn parse_pointer(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PatchError::InvalidPointer(path.to_string()));
    };
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

// Creation only starts once every earlier segment resolved, so a failing
// walk never leaves partial structure behind.
fn walk<'a>(
    document: &'a mut Value,
    parents: &[String],
    last: &str,
    create: bool,
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = document;
    for (depth, token) in parents.iter().enumerate() {
        let next = parents.get(depth + 1).map(String::as_str).unwrap_or(last);
        current = match current {
            Value::Object(map) => {
                if create {
                    map.entry(token.clone())
                        .or_insert_with(|| empty_container_for(next))
                } else {
                    map.get_mut(token)
                        .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?
                }
            }
            Value::Array(items) => {
                let len = items.len();
                let index = array_index(token, len, path)?;
                if create && index == len {
                    items.push(empty_container_for(next));
                }
                items.get_mut(index).ok_or(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len,
                })?
            }
            _ => return Err(PatchError::NotAContainer(path.to_string())),
        };
    }
    Ok(current)
}

fn empty_container_for(next_token: &str) -> Value {
    if next_token == "-" || next_token == "0" {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

fn array_index(token: &str, len: usize, path: &str) -> Result<usize, PatchError> {
    if token == "-" {
        return Ok(len);
    }
    let well_formed = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !well_formed {
        return Err(PatchError::InvalidIndex {
            path: path.to_string(),
            index: token.to_string(),
        });
    }
    token.parse().map_err(|_| PatchError::InvalidIndex {
        path: path.to_string(),
        index: token.to_string(),
    })
}

fn insert(parent: &mut Value, token: &str, value: Value, path: &str) -> Result<(), PatchError> {
    match parent {
        Value::Object(map) => {
            map.insert(token.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len();
            let index = array_index(token, len, path)?;
            if index > len {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len,
                });
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::NotAContainer(path.to_string())),
    }
}

fn child_mut<'a>(parent: &'a mut Value, token: &str, path: &str) -> Result<&'a mut Value, PatchError> {
    match parent {
        Value::Object(map) => map
            .get_mut(token)
            .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Value::Array(items) => {
            let len = items.len();
            let index = array_index(token, len, path)?;
            items.get_mut(index).ok_or(PatchError::IndexOutOfBounds {
                path: path.to_string(),
                index,
                len,
            })
        }
        _ => Err(PatchError::NotAContainer(path.to_string())),
    }
}

fn remove(parent: &mut Value, token: &str, path: &str) -> Result<(), PatchError> {
    match parent {
        Value::Object(map) => map
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Value::Array(items) => {
            let len = items.len();
            let index = array_index(token, len, path)?;
            if index >= len {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len,
                });
            }
            items.remove(index);
            Ok(())
        }
        _ => Err(PatchError::NotAContainer(path.to_string())),
    }
}
