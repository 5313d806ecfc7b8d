//! Attribute-level diffs between last-applied and desired state

use crate::value::{Attributes, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Placeholder shown instead of sensitive values
pub const REDACTED: &str = "(sensitive value)";

/// Change of one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub name: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    /// The change forces the node to be replaced
    pub forces_replacement: bool,
    pub sensitive: bool,
}

impl AttributeChange {
    pub fn is_addition(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    pub fn is_removal(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }

    /// Before value as display text, redacted if sensitive
    pub fn before_display(&self) -> String {
        display(self.before.as_ref(), self.sensitive)
    }

    /// After value as display text, redacted if sensitive
    pub fn after_display(&self) -> String {
        display(self.after.as_ref(), self.sensitive)
    }
}

fn display(value: Option<&Value>, sensitive: bool) -> String {
    match value {
        None => "null".to_string(),
        Some(_) if sensitive => REDACTED.to_string(),
        Some(v) => v.to_string(),
    }
}

/// Names of attributes that differ, in before-then-after key order
pub fn changed_attributes(before: &Attributes, after: &Attributes) -> Vec<String> {
    let mut names: Vec<String> = before
        .iter()
        .filter(|(k, v)| after.get(*k) != Some(v))
        .map(|(k, _)| k.clone())
        .collect();
    names.extend(
        after
            .keys()
            .filter(|k| !before.contains_key(*k))
            .cloned(),
    );
    names
}

/// Full per-attribute diff
pub fn compute_attribute_changes(
    before: Option<&Attributes>,
    after: Option<&Attributes>,
    forcing: &BTreeSet<String>,
    sensitive: &BTreeSet<String>,
) -> Vec<AttributeChange> {
    let empty = Attributes::new();
    let b = before.unwrap_or(&empty);
    let a = after.unwrap_or(&empty);

    changed_attributes(b, a)
        .into_iter()
        .map(|name| AttributeChange {
            before: b.get(&name).cloned(),
            after: a.get(&name).cloned(),
            forces_replacement: forcing.contains(&name),
            sensitive: sensitive.contains(&name),
            name,
        })
        .collect()
}

/// Overlay prior values for ignored attributes onto the desired ones, so
/// drift in those attributes never shows up as a change
pub fn apply_ignore_changes(desired: &Attributes, prior: &Attributes, ignore: &[String]) -> Attributes {
    if ignore.is_empty() {
        return desired.clone();
    }
    let mut out = desired.clone();
    for name in ignore {
        match prior.get(name) {
            Some(v) => {
                out.insert(name.clone(), v.clone());
            }
            None => {
                out.shift_remove(name);
            }
        }
    }
    out
}
