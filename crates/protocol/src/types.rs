//! Core types shared across the protocol

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reserved sender id for the automated assistant. Never assigned to a human.
pub const ASSISTANT_ID: &str = "ai";

/// Returns true if `id` is reserved for the automated assistant.
pub fn is_reserved_member_id(id: &str) -> bool {
    id == ASSISTANT_ID
}

/// A participant in a project room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_assistant: bool,
}

impl Member {
    /// Create a human member. The assistant sentinel id is rejected upstream
    /// by the gateway; this constructor just never sets the flag.
    pub fn human(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_assistant: false,
        }
    }
}

/// Errors produced while validating a file-tree payload
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("file tree payload is not a mapping of paths to descriptors")]
    NotAMapping,

    #[error("file tree descriptor is malformed: {0}")]
    Malformed(String),

    #[error("invalid path in file tree: {0:?}")]
    InvalidPath(String),
}

/// Text contents of a file leaf
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub contents: String,
}

/// A named node in the shared document: a file leaf or a directory branch.
///
/// Wire shape follows the execution environment's mount format:
/// `{"file":{"contents":"..."}}` or `{"directory":{...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileNode {
    File { file: FileContents },
    Directory { directory: FileTree },
}

impl FileNode {
    /// Convenience constructor for a file leaf.
    pub fn file(contents: impl Into<String>) -> Self {
        Self::File {
            file: FileContents {
                contents: contents.into(),
            },
        }
    }
}

/// The shared mutable document for a room: path → descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree(pub BTreeMap<String, FileNode>);

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, path: &str) -> Option<&FileNode> {
        self.0.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, node: FileNode) {
        self.0.insert(path.into(), node);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileNode)> {
        self.0.iter()
    }

    /// Merge `incoming` into this tree with per-path replace semantics:
    /// every path present in `incoming` overwrites the corresponding entry
    /// wholesale; paths absent from `incoming` are left untouched.
    pub fn merge_from(&mut self, incoming: FileTree) {
        for (path, node) in incoming.0 {
            self.0.insert(path, node);
        }
    }

    /// Structural validation. Runs before any mutation so a rejected tree
    /// never leaves partial state behind.
    pub fn validate(&self) -> Result<(), TreeError> {
        for (path, node) in &self.0 {
            validate_path(path)?;
            if let FileNode::Directory { directory } = node {
                directory.validate()?;
            }
        }
        Ok(())
    }

    /// Decode and validate a file-tree payload from raw JSON.
    pub fn from_value(value: &Value) -> Result<Self, TreeError> {
        if !value.is_object() {
            return Err(TreeError::NotAMapping);
        }
        let tree: FileTree = serde_json::from_value(value.clone())
            .map_err(|e| TreeError::Malformed(e.to_string()))?;
        tree.validate()?;
        Ok(tree)
    }
}

fn validate_path(path: &str) -> Result<(), TreeError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains('\\')
        || path.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(TreeError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// A chat payload, normalized at the boundary.
///
/// The wire tolerates two producer shapes on the same channel: plain text,
/// and a structured body (possibly double-encoded as a JSON string) that
/// carries a `fileTree` snapshot. Structured decode is attempted first;
/// anything that does not carry a `fileTree` field falls back to opaque
/// text. Downstream code matches exhaustively on this enum instead of
/// duck-typing on payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatBody {
    /// Plain conversational text, relayed opaquely.
    Text(String),
    /// Structured body carrying a file-tree snapshot.
    FileTreeUpdate {
        text: Option<String>,
        file_tree: FileTree,
    },
}

impl ChatBody {
    /// Normalize a raw chat payload.
    ///
    /// `Err` means the payload *claimed* to carry a file tree (a `fileTree`
    /// field was present) but the snapshot failed structural validation.
    /// The caller still relays the raw payload as chat in that case.
    pub fn decode(raw: &Value) -> Result<Self, TreeError> {
        match raw {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(inner) if inner.get("fileTree").is_some() => Self::decode_structured(&inner),
                _ => Ok(Self::Text(text.clone())),
            },
            Value::Object(map) if map.contains_key("fileTree") => Self::decode_structured(raw),
            other => Ok(Self::Text(other.to_string())),
        }
    }

    fn decode_structured(body: &Value) -> Result<Self, TreeError> {
        let Some(tree_value) = body.get("fileTree") else {
            return Ok(Self::Text(body.to_string()));
        };
        let file_tree = FileTree::from_value(tree_value)?;
        let text = body
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self::FileTreeUpdate { text, file_tree })
    }
}
