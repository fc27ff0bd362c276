//! Neutral inspection trees.
//!
//! Components and systems describe their editable state as an
//! [`InspectNode`] tree. Drawing the tree (and writing edits back through
//! the read facade) is left to whatever front end consumes it.

use serde::Serialize;
use serde_json::Value;

/// One node of an inspection tree.
///
/// Leaves carry a value; groups carry children.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectNode {
    /// Field or component name shown to the user.
    pub label: String,
    /// Current value, for leaves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Whether tools may write this value back.
    pub editable: bool,
    /// Nested nodes, for groups.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<InspectNode>,
}

impl InspectNode {
    /// An editable leaf.
    pub fn field(label: impl Into<String>, value: Value) -> Self {
        Self {
            label: label.into(),
            value: Some(value),
            editable: true,
            children: Vec::new(),
        }
    }

    /// A read-only leaf.
    pub fn readonly(label: impl Into<String>, value: Value) -> Self {
        Self {
            editable: false,
            ..Self::field(label, value)
        }
    }

    /// A node holding `children` and no value.
    pub fn group(label: impl Into<String>, children: Vec<InspectNode>) -> Self {
        Self {
            label: label.into(),
            value: None,
            editable: false,
            children,
        }
    }

    /// Mirror a JSON value: objects and arrays become groups, everything
    /// else an editable leaf.
    pub fn from_value(label: &str, value: &Value) -> Self {
        match value {
            Value::Object(map) => Self::group(
                label,
                map.iter().map(|(k, v)| Self::from_value(k, v)).collect(),
            ),
            Value::Array(items) => Self::group(
                label,
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Self::from_value(&format!("[{i}]"), v))
                    .collect(),
            ),
            scalar => Self::field(label, scalar.clone()),
        }
    }

    /// Follow child labels from this node.
    pub fn find(&self, path: &[&str]) -> Option<&InspectNode> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter()
                .find(|child| child.label == *head)?
                .find(rest),
        }
    }
}
