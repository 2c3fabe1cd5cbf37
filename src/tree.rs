//! Project tree model for generated projects.
//!
//! A [`ProjectTree`] is the validated in-memory form of the file tree
//! returned by the generation collaborator. Parsing never panics: any
//! structural problem is reported as [`Error::GenerationInput`] naming the
//! offending path.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Directory names that may legitimately be empty placeholders.
pub const EMPTY_DIR_ALLOWLIST: &[&str] = &["assets", "public", "images", "fonts", "static"];

/// A single file or directory in a generated project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    /// A file with its text content.
    File { name: String, content: String },
    /// A directory with ordered children.
    Directory { name: String, children: Vec<Node> },
}

impl Node {
    /// Creates a file node.
    pub fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        Node::File {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Creates a directory node.
    pub fn dir(name: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Directory {
            name: name.into(),
            children,
        }
    }

    /// Returns the path segment of this node.
    pub fn name(&self) -> &str {
        match self {
            Node::File { name, .. } | Node::Directory { name, .. } => name,
        }
    }

    fn validate(&self, parent: &str) -> Result<()> {
        let path = join_path(parent, self.name());
        validate_name(self.name(), &path)?;

        match self {
            Node::File { content, .. } => {
                if content.is_empty() {
                    return Err(Error::GenerationInput(format!(
                        "file '{}' has no content",
                        path
                    )));
                }
            }
            Node::Directory { name, children } => {
                if children.is_empty() && !EMPTY_DIR_ALLOWLIST.contains(&name.as_str()) {
                    return Err(Error::GenerationInput(format!(
                        "directory '{}' has no children",
                        path
                    )));
                }
                for child in children {
                    child.validate(&path)?;
                }
            }
        }

        Ok(())
    }
}

/// An ordered sequence of top-level nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProjectTree {
    nodes: Vec<Node>,
}

impl ProjectTree {
    /// Builds a tree from nodes, checking the structural invariants.
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        let tree = Self { nodes };
        tree.validate()?;
        Ok(tree)
    }

    /// Returns an empty tree.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses the generator's JSON representation.
    ///
    /// Accepts `"folder"` as an alias for `"directory"`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::GenerationInput(format!("not valid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Converts an already-decoded JSON value.
    pub fn from_value(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| Error::GenerationInput("project tree must be an array".to_string()))?;

        let nodes = items
            .iter()
            .enumerate()
            .map(|(i, item)| node_from_value(item, "", i))
            .collect::<Result<Vec<_>>>()?;

        Self::new(nodes)
    }

    /// Returns the top-level nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Returns true if the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Counts the file nodes at any depth.
    pub fn file_count(&self) -> usize {
        fn count(nodes: &[Node]) -> usize {
            nodes
                .iter()
                .map(|n| match n {
                    Node::File { .. } => 1,
                    Node::Directory { children, .. } => count(children),
                })
                .sum()
        }
        count(&self.nodes)
    }

    /// Checks every node against the tree invariants.
    pub fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            node.validate("")?;
        }
        Ok(())
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn validate_name(name: &str, path: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::GenerationInput(format!(
            "node under '{}' has an empty name",
            path
        )));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(Error::GenerationInput(format!(
            "node '{}' is not a single path segment",
            path
        )));
    }
    Ok(())
}

fn node_from_value(value: &Value, parent: &str, index: usize) -> Result<Node> {
    let obj = value.as_object().ok_or_else(|| {
        Error::GenerationInput(format!("entry {} under '{}' is not an object", index, parent))
    })?;

    let name = obj.get("name").and_then(Value::as_str).ok_or_else(|| {
        Error::GenerationInput(format!("entry {} under '{}' is missing a name", index, parent))
    })?;
    let path = join_path(parent, name);

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::GenerationInput(format!("node '{}' is missing a type", path)))?;

    match kind {
        "file" => {
            let content = obj
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::GenerationInput(format!("file '{}' has no content", path))
                })?;
            Ok(Node::file(name, content))
        }
        "directory" | "folder" => {
            let children = match obj.get("children") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| node_from_value(item, &path, i))
                    .collect::<Result<Vec<_>>>()?,
                Some(_) => {
                    return Err(Error::GenerationInput(format!(
                        "directory '{}' has non-array children",
                        path
                    )))
                }
            };
            Ok(Node::dir(name, children))
        }
        other => Err(Error::GenerationInput(format!(
            "node '{}' has unknown type '{}'",
            path, other
        ))),
    }
}
