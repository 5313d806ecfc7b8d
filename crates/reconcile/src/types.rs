//! Core types for declarative reconciliation

use crate::context::CancelToken;
use crate::error::{Error, Result};
use crate::expr::{self, Reference};
use crate::hooks::{Hook, HookWhen};
use crate::value::Attributes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Node identifier (its address, e.g. `aws_instance.web`)
pub type NodeId = String;

/// What a node declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A managed object with a full lifecycle
    Resource,
    /// A read-only lookup
    DataSource,
    /// A module instance
    Module,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource => write!(f, "resource"),
            Self::DataSource => write!(f, "data source"),
            Self::Module => write!(f, "module"),
        }
    }
}

/// Lifecycle flags of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lifecycle {
    /// Build the replacement before tearing down the old object
    pub create_before_destroy: bool,
    /// Refuse any plan that would destroy this node
    pub prevent_destroy: bool,
    /// Attributes whose drift is never acted upon
    pub ignore_changes: Vec<String>,
    /// Attributes that force replacement instead of an in-place update
    pub replace_on_change: Vec<String>,
}

/// A declared infrastructure unit, after variable resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Provider type (`aws_instance`, `local_file`, `module`)
    pub node_type: String,
    pub name: String,
    pub attributes: Attributes,
    /// Explicit `depends_on` entries
    pub depends_on: BTreeSet<NodeId>,
    pub lifecycle: Lifecycle,
    pub hooks: Vec<Hook>,
    /// Attributes whose value came from a sensitive variable
    pub sensitive_attributes: BTreeSet<String>,
}

impl Node {
    /// Create a resource node with no attributes
    pub fn resource(node_type: &str, name: &str) -> Self {
        Self::new(NodeKind::Resource, node_type, name)
    }

    /// Create a node of any kind; the identifier is derived from kind, type and name
    pub fn new(kind: NodeKind, node_type: &str, name: &str) -> Self {
        let id = match kind {
            NodeKind::Resource => format!("{node_type}.{name}"),
            NodeKind::DataSource => format!("data.{node_type}.{name}"),
            NodeKind::Module => format!("module.{name}"),
        };
        Self {
            id,
            kind,
            node_type: node_type.to_string(),
            name: name.to_string(),
            attributes: Attributes::new(),
            depends_on: BTreeSet::new(),
            lifecycle: Lifecycle::default(),
            hooks: Vec::new(),
            sensitive_attributes: BTreeSet::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with_attr(mut self, key: &str, value: impl Into<crate::value::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Builder-style explicit dependency
    pub fn depends_on(mut self, id: &str) -> Self {
        self.depends_on.insert(id.to_string());
        self
    }

    /// Node identifiers referenced from attributes and hooks
    pub fn referenced_nodes(&self) -> Result<BTreeSet<NodeId>> {
        let mut refs = Vec::new();
        for value in self.attributes.values() {
            expr::collect_references(value, &mut refs)?;
        }
        for hook in &self.hooks {
            refs.extend(hook.references()?);
        }

        let mut out = BTreeSet::new();
        for r in refs {
            match r {
                Reference::Node { address, .. } => {
                    out.insert(address);
                }
                Reference::SelfAttr(_) => {}
                Reference::Variable(name) => {
                    // Variables are substituted before the graph is built
                    return Err(Error::UnknownReference {
                        node: self.id.clone(),
                        reference: format!("var.{name}"),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Hooks firing at the given point, in declaration order
    pub fn hooks_for(&self, when: HookWhen) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.when == when)
    }
}

/// Result of applying one change
#[derive(Debug)]
pub enum ApplyResult {
    /// No changes needed
    NoChange,
    /// Node was created
    Created,
    /// Node was updated in place
    Modified,
    /// Node was replaced
    Replaced,
    /// Node was removed
    Removed,
    /// Data source was read
    Read,
    /// Apply failed
    Failed(Error),
    /// A dependency failed, so the change was never attempted
    Skipped { reason: String },
    /// Cancellation arrived before the change was launched
    Cancelled,
}

impl ApplyResult {
    /// Check if the result represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(
            self,
            Self::Failed(_) | Self::Skipped { .. } | Self::Cancelled
        )
    }

    /// Check if the result represents a change
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Modified | Self::Replaced | Self::Removed | Self::Read
        )
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub modified: usize,
    pub replaced: usize,
    pub removed: usize,
    pub read: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub no_change: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.modified + self.replaced + self.removed + self.read
    }

    /// Check if execution was fully successful
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.cancelled == 0
    }

    /// Total number of changes processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.skipped + self.cancelled + self.failed + self.no_change
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, result: &ApplyResult) {
        match result {
            ApplyResult::NoChange => self.no_change += 1,
            ApplyResult::Created => self.created += 1,
            ApplyResult::Modified => self.modified += 1,
            ApplyResult::Replaced => self.replaced += 1,
            ApplyResult::Removed => self.removed += 1,
            ApplyResult::Read => self.read += 1,
            ApplyResult::Failed(_) => self.failed += 1,
            ApplyResult::Skipped { .. } => self.skipped += 1,
            ApplyResult::Cancelled => self.cancelled += 1,
        }
    }
}

/// Outcome of an apply: one result per change, in change-set order
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub results: Vec<(NodeId, ApplyResult)>,
}

impl ApplyReport {
    /// Result for a node
    pub fn result(&self, id: &str) -> Option<&ApplyResult> {
        self.results.iter().find(|(n, _)| n == id).map(|(_, r)| r)
    }

    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for (_, result) in &self.results {
            summary.add_result(result);
        }
        summary
    }

    /// True when every change reached its terminal success state
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_success())
    }

    /// Errors raised by failed nodes
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.results.iter().filter_map(|(id, r)| match r {
            ApplyResult::Failed(e) => Some((id.as_str(), e)),
            _ => None,
        })
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum number of changes in flight
    pub jobs: usize,
    /// Stop launching new changes once this much time has passed
    pub timeout: Option<Duration>,
    /// Cooperative cancellation (user interrupt)
    pub cancel: CancelToken,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            timeout: None,
            cancel: CancelToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_node_ids_by_kind() {
        assert_eq!(Node::resource("aws_instance", "web").id, "aws_instance.web");
        assert_eq!(
            Node::new(NodeKind::DataSource, "aws_ami", "ubuntu").id,
            "data.aws_ami.ubuntu"
        );
        assert_eq!(Node::new(NodeKind::Module, "module", "vpc").id, "module.vpc");
    }

    #[test]
    fn test_referenced_nodes_from_attributes() {
        let node = Node::resource("aws_instance", "web")
            .with_attr("subnet", "${aws_subnet.a.id}")
            .with_attr("ami", Value::from("${data.aws_ami.ubuntu.id}"))
            .with_attr("name", "web");
        let refs = node.referenced_nodes().unwrap();
        assert_eq!(
            refs.into_iter().collect::<Vec<_>>(),
            vec!["aws_subnet.a".to_string(), "data.aws_ami.ubuntu".to_string()]
        );
    }

    #[test]
    fn test_summary_counts() {
        let report = ApplyReport {
            results: vec![
                ("a.a".into(), ApplyResult::Created),
                ("b.b".into(), ApplyResult::NoChange),
                (
                    "c.c".into(),
                    ApplyResult::Skipped {
                        reason: "a.a failed".into(),
                    },
                ),
            ],
        };
        let summary = report.summary();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.total(), 3);
        assert!(!summary.is_success());
        assert!(!report.is_success());
    }
}
