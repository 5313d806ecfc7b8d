//! Planner - diff the desired graph against the last-applied state
//!
//! The result is an ordered [`ChangeSet`]. Every change lists the changes it
//! has to wait for, so the executor can run independent changes in parallel
//! while still honouring dependency order.

use crate::diff::{
    AttributeChange, apply_ignore_changes, changed_attributes, compute_attribute_changes,
};
use crate::error::{Error, Result};
use crate::expr::{self, Reference};
use crate::graph::{Graph, matches_target};
use crate::state::{StateRecord, StateSnapshot};
use crate::types::{Node, NodeId, NodeKind};
use crate::value::{Attributes, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Order of the two halves of a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplaceOrder {
    DestroyBeforeCreate,
    CreateBeforeDestroy,
}

/// What happens to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    NoOp,
    Create,
    Update,
    Replace(ReplaceOrder),
    Delete,
    /// Data source lookup
    Read,
}

impl Action {
    /// Diff-style marker
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace(ReplaceOrder::DestroyBeforeCreate) => "-/+",
            Self::Replace(ReplaceOrder::CreateBeforeDestroy) => "+/-",
            Self::Delete => "-",
            Self::Read => "<=",
        }
    }

    /// Whether the action tears the current object down
    pub fn destroys(&self) -> bool {
        matches!(self, Self::Delete | Self::Replace(_))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace(ReplaceOrder::DestroyBeforeCreate) => "replace (destroy then create)",
            Self::Replace(ReplaceOrder::CreateBeforeDestroy) => "replace (create then destroy)",
            Self::Delete => "destroy",
            Self::Read => "read",
        };
        write!(f, "{text}")
    }
}

/// Plan everything, or tear everything down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanMode {
    #[default]
    Normal,
    Destroy,
}

/// Per-type attributes whose change forces replacement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplacePolicy {
    #[serde(default)]
    pub force_new: BTreeMap<String, BTreeSet<String>>,
}

impl ReplacePolicy {
    /// Policy covering the built-in providers
    pub fn builtin() -> Self {
        let mut policy = Self::default();
        policy.add("local_file", ["filename"]);
        policy
    }

    pub fn add<'a>(&mut self, node_type: &str, attrs: impl IntoIterator<Item = &'a str>) {
        self.force_new
            .entry(node_type.to_string())
            .or_default()
            .extend(attrs.into_iter().map(str::to_string));
    }

    /// Merge another policy into this one
    pub fn merge(&mut self, other: &ReplacePolicy) {
        for (ty, attrs) in &other.force_new {
            self.force_new
                .entry(ty.clone())
                .or_default()
                .extend(attrs.iter().cloned());
        }
    }

    fn forcing_attributes(&self, node: &Node) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = node.lifecycle.replace_on_change.iter().cloned().collect();
        if let Some(attrs) = self.force_new.get(&node.node_type) {
            out.extend(attrs.iter().cloned());
        }
        out
    }
}

/// Options for planning
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub mode: PlanMode,
    /// Restrict the plan to these targets (and their dependencies)
    pub targets: Vec<String>,
    pub policy: ReplacePolicy,
}

/// One planned action
#[derive(Debug, Clone)]
pub struct Change {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub node_type: String,
    pub action: Action,
    /// Last-applied attributes
    pub before: Option<Attributes>,
    /// Desired attributes (after the ignore filter)
    pub after: Option<Attributes>,
    /// Attributes whose change forces replacement
    pub replace_reasons: Vec<String>,
    /// Attributes that reference a dependency whose values changed, or
    /// will change in this run; their new value is known after apply
    pub recomputed: Vec<String>,
    pub sensitive: BTreeSet<String>,
    /// Indices of changes that must finish first; always earlier in the set
    pub waits_on: Vec<usize>,
    /// Desired node with effective attributes; absent for removed nodes
    pub node: Option<Node>,
    /// Record the change starts from
    pub prior: Option<StateRecord>,
    /// Dependencies to record when the change succeeds
    pub dependencies: BTreeSet<NodeId>,
}

impl Change {
    /// Attribute-level diff for display
    pub fn attribute_changes(&self) -> Vec<AttributeChange> {
        let forcing: BTreeSet<String> = self.replace_reasons.iter().cloned().collect();
        compute_attribute_changes(
            self.before.as_ref(),
            self.after.as_ref(),
            &forcing,
            &self.sensitive,
        )
    }
}

/// Counts shown at the end of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub add: usize,
    pub change: usize,
    pub destroy: usize,
    pub read: usize,
}

impl PlanSummary {
    pub fn total(&self) -> usize {
        self.add + self.change + self.destroy + self.read
    }
}

/// Ordered change set for one run; consumed once by the executor
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub mode: PlanMode,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether anything other than no-ops is planned
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != Action::NoOp)
    }

    pub fn get(&self, id: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.node_id == id)
    }

    /// Actions in order, skipping no-ops
    pub fn actions(&self) -> Vec<(&str, Action)> {
        self.changes
            .iter()
            .filter(|c| c.action != Action::NoOp)
            .map(|c| (c.node_id.as_str(), c.action))
            .collect()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                Action::NoOp => {}
                Action::Create => summary.add += 1,
                Action::Update => summary.change += 1,
                Action::Replace(_) => {
                    summary.add += 1;
                    summary.destroy += 1;
                }
                Action::Delete => summary.destroy += 1,
                Action::Read => summary.read += 1,
            }
        }
        summary
    }
}

/// Plan the changes needed to move `prior` to the desired `graph`.
///
/// Fails with `DestroyForbidden` before returning anything if a protected
/// node would be destroyed.
pub fn plan(graph: &Graph, prior: &StateSnapshot, options: &PlanOptions) -> Result<ChangeSet> {
    let changes = match options.mode {
        PlanMode::Normal => plan_normal(graph, prior, options),
        PlanMode::Destroy => plan_destroy(graph, prior, options),
    };

    for change in &changes {
        if change.action.destroys() && prevents_destroy(change, graph) {
            return Err(Error::DestroyForbidden {
                node: change.node_id.clone(),
            });
        }
    }

    let set = ChangeSet {
        mode: options.mode,
        changes,
    };
    let summary = set.summary();
    log::info!(
        "Plan: {} to add, {} to change, {} to destroy, {} to read",
        summary.add,
        summary.change,
        summary.destroy,
        summary.read
    );
    Ok(set)
}

fn prevents_destroy(change: &Change, graph: &Graph) -> bool {
    match graph.node(&change.node_id) {
        Some(node) => node.lifecycle.prevent_destroy,
        None => change.prior.as_ref().is_some_and(|r| r.prevent_destroy),
    }
}

fn plan_normal(graph: &Graph, prior: &StateSnapshot, options: &PlanOptions) -> Vec<Change> {
    let targeted = !options.targets.is_empty();
    let selected = graph.select_targets(&options.targets);

    // Records with no node in the configuration are deleted first
    let orphans: Vec<&StateRecord> = prior
        .records
        .values()
        .filter(|r| !graph.contains(&r.id))
        .filter(|r| {
            !targeted
                || options
                    .targets
                    .iter()
                    .any(|t| matches_target(t, &r.id, &r.node_type))
        })
        .collect();
    let mut changes = delete_changes(&orphans, None);
    let orphan_index: BTreeMap<NodeId, usize> = changes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.node_id.clone(), i))
        .collect();

    let mut index: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut planned: BTreeMap<NodeId, Action> = BTreeMap::new();
    for id in graph.topological_order() {
        if targeted && !selected.contains(&id) {
            continue;
        }
        let Some(node) = graph.node(&id) else {
            continue;
        };
        let dependencies = graph.dependencies_of(&id);
        let mut waits_on: Vec<usize> = dependencies
            .iter()
            .filter_map(|d| index.get(d).copied())
            .collect();

        let record = prior.get(&id);
        let mut change = plan_node(node, record, &options.policy);
        if let (Some(record), Some(effective)) = (record, change.node.clone()) {
            let stale = stale_inputs(&effective, record, prior, &planned);
            follow_dependencies(&mut change, &effective, stale, &options.policy);
        }

        // Removed dependents go before the object they depend on is torn down
        if change.action.destroys() {
            for orphan in &orphans {
                if orphan.dependencies.contains(&id) {
                    waits_on.extend(orphan_index.get(&orphan.id).copied());
                }
            }
            waits_on.sort_unstable();
        }

        change.waits_on = waits_on;
        change.dependencies = dependencies;
        planned.insert(id.clone(), change.action);
        index.insert(id, changes.len());
        changes.push(change);
    }
    changes
}

/// Attributes of `node` whose referenced values no longer match what was
/// applied: either the dependency changes in this run, or its recorded
/// value moved since `record` was written
fn stale_inputs(
    node: &Node,
    record: &StateRecord,
    prior: &StateSnapshot,
    planned: &BTreeMap<NodeId, Action>,
) -> Vec<String> {
    let mut stale = Vec::new();
    for (name, value) in &node.attributes {
        let addresses = expr::node_addresses(value);
        if addresses.is_empty() {
            continue;
        }

        let changing = addresses.iter().any(|a| {
            planned
                .get(a)
                .is_some_and(|action| !matches!(action, Action::NoOp | Action::Delete))
        });
        if changing {
            stale.push(name.clone());
            continue;
        }

        let Some(applied) = record.inputs.get(name) else {
            continue;
        };
        let mut resolve = |r: &Reference| -> Result<Option<Value>> {
            match r {
                Reference::Node { address, path } => Ok(prior.get(address).and_then(|dep| {
                    let exposed = dep.exposed_value();
                    if path.is_empty() {
                        Some(exposed)
                    } else {
                        exposed.lookup_path(path).cloned()
                    }
                })),
                _ => Ok(None),
            }
        };
        let current = expr::interpolate(value, &mut resolve).map(expr::unescape);
        if current.is_ok_and(|v| v != *applied) {
            stale.push(name.clone());
        }
    }
    stale
}

/// Escalate a change whose inputs follow a changed dependency
fn follow_dependencies(change: &mut Change, node: &Node, stale: Vec<String>, policy: &ReplacePolicy) {
    if stale.is_empty() {
        return;
    }
    match change.action {
        Action::NoOp if node.kind == NodeKind::DataSource => change.action = Action::Read,
        Action::NoOp | Action::Update => {
            let forcing = policy.forcing_attributes(node);
            let forced: Vec<String> = stale.iter().filter(|a| forcing.contains(*a)).cloned().collect();
            if forced.is_empty() {
                change.action = Action::Update;
            } else {
                change.replace_reasons.extend(forced);
                change.action = replace_action(node);
            }
        }
        _ => {}
    }
    change.recomputed = stale;
}

fn replace_action(node: &Node) -> Action {
    if node.lifecycle.create_before_destroy {
        Action::Replace(ReplaceOrder::CreateBeforeDestroy)
    } else {
        Action::Replace(ReplaceOrder::DestroyBeforeCreate)
    }
}

fn plan_node(node: &Node, record: Option<&StateRecord>, policy: &ReplacePolicy) -> Change {
    let mut change = Change {
        node_id: node.id.clone(),
        kind: node.kind,
        node_type: node.node_type.clone(),
        action: Action::Create,
        before: record.map(|r| r.attributes.clone()),
        after: Some(node.attributes.clone()),
        replace_reasons: Vec::new(),
        recomputed: Vec::new(),
        sensitive: node.sensitive_attributes.clone(),
        waits_on: Vec::new(),
        node: Some(node.clone()),
        prior: record.cloned(),
        dependencies: BTreeSet::new(),
    };

    let Some(record) = record else {
        if node.kind == NodeKind::DataSource {
            change.action = Action::Read;
        }
        return change;
    };

    change.sensitive.extend(record.sensitive_attributes.iter().cloned());
    let effective = apply_ignore_changes(
        &node.attributes,
        &record.attributes,
        &node.lifecycle.ignore_changes,
    );
    let changed = changed_attributes(&record.attributes, &effective);
    let mut effective_node = node.clone();
    effective_node.attributes = effective.clone();
    change.after = Some(effective);
    change.node = Some(effective_node);

    if changed.is_empty() {
        change.action = Action::NoOp;
        return change;
    }
    if node.kind == NodeKind::DataSource {
        change.action = Action::Read;
        return change;
    }

    let forcing = policy.forcing_attributes(node);
    change.replace_reasons = changed.into_iter().filter(|a| forcing.contains(a)).collect();
    change.action = if change.replace_reasons.is_empty() {
        Action::Update
    } else {
        replace_action(node)
    };
    change
}

fn plan_destroy(graph: &Graph, prior: &StateSnapshot, options: &PlanOptions) -> Vec<Change> {
    let records: Vec<&StateRecord> = if options.targets.is_empty() {
        prior.records.values().collect()
    } else {
        // Targeted records plus everything recorded as depending on them
        let mut wanted: BTreeSet<&str> = prior
            .records
            .values()
            .filter(|r| {
                options
                    .targets
                    .iter()
                    .any(|t| matches_target(t, &r.id, &r.node_type))
            })
            .map(|r| r.id.as_str())
            .collect();
        loop {
            let before = wanted.len();
            for r in prior.records.values() {
                if r.dependencies.iter().any(|d| wanted.contains(d.as_str())) {
                    wanted.insert(r.id.as_str());
                }
            }
            if wanted.len() == before {
                break;
            }
        }
        prior
            .records
            .values()
            .filter(|r| wanted.contains(r.id.as_str()))
            .collect()
    };
    delete_changes(&records, Some(graph))
}

/// Delete changes in reverse dependency order: a record is deleted only
/// after every record depending on it
fn delete_changes(records: &[&StateRecord], graph: Option<&Graph>) -> Vec<Change> {
    let ids: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
    let by_id: BTreeMap<&str, &StateRecord> = records.iter().map(|r| (r.id.as_str(), *r)).collect();

    // dependents within the set, per record
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for r in records {
        for dep in &r.dependencies {
            if ids.contains(dep.as_str()) {
                dependents.entry(dep.as_str()).or_default().insert(r.id.as_str());
            }
        }
    }

    let mut pending: BTreeMap<&str, usize> = ids
        .iter()
        .map(|id| (*id, dependents.get(id).map_or(0, BTreeSet::len)))
        .collect();
    let mut index: BTreeMap<&str, usize> = BTreeMap::new();
    let mut changes = Vec::with_capacity(records.len());

    while !pending.is_empty() {
        let ready: Vec<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        // A cycle in recorded dependencies should not happen; fall back to id order
        let batch = if ready.is_empty() {
            pending.keys().take(1).copied().collect()
        } else {
            ready
        };

        for id in batch {
            pending.remove(id);
            let record = by_id[id];
            for dep in &record.dependencies {
                if let Some(n) = pending.get_mut(dep.as_str()) {
                    *n = n.saturating_sub(1);
                }
            }

            let waits_on = dependents
                .get(id)
                .into_iter()
                .flatten()
                .filter_map(|d| index.get(d).copied())
                .collect();
            index.insert(id, changes.len());
            changes.push(Change {
                node_id: record.id.clone(),
                kind: record.kind,
                node_type: record.node_type.clone(),
                action: Action::Delete,
                before: Some(record.attributes.clone()),
                after: None,
                replace_reasons: Vec::new(),
                recomputed: Vec::new(),
                sensitive: record.sensitive_attributes.clone(),
                waits_on,
                node: graph.and_then(|g| g.node(id)).cloned(),
                prior: Some(record.clone()),
                dependencies: record.dependencies.clone(),
            });
        }
    }
    changes
}
