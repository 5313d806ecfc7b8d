//! Provider trait - the side effects behind each node type
//!
//! A provider turns resolved attributes into a real object and reports the
//! values it computed. The executor owns ordering, hooks and state; a
//! provider only touches the outside world.

use crate::error::{Error, Result};
use crate::providers::{LocalFileProvider, ModuleProvider, NullProvider};
use crate::state::StateRecord;
use crate::value::Attributes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Input to a provider call: attributes with every reference resolved
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub node_id: &'a str,
    pub node_type: &'a str,
    pub attributes: &'a Attributes,
}

/// Side-effect implementation for one or more node types
///
/// Each method returns the computed outputs recorded in state. Errors are
/// `anyhow` errors; the executor wraps them as `SideEffectFailure` with the
/// node identifier.
pub trait Provider: Send + Sync + fmt::Debug {
    /// Provider name used in logs
    fn name(&self) -> &'static str;

    /// Bring a new object into existence
    fn create(&self, request: &ProviderRequest<'_>) -> anyhow::Result<Attributes>;

    /// Change an existing object in place
    ///
    /// Defaults to re-running `create`, which suits idempotent providers.
    fn update(
        &self,
        request: &ProviderRequest<'_>,
        _prior: &StateRecord,
    ) -> anyhow::Result<Attributes> {
        self.create(request)
    }

    /// Tear an object down
    fn delete(&self, record: &StateRecord) -> anyhow::Result<()>;

    /// Look up a data source
    fn read(&self, request: &ProviderRequest<'_>) -> anyhow::Result<Attributes> {
        self.create(request)
    }
}

/// Providers keyed by node type
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("null_resource", NullProvider);
        registry.register("null_data_source", NullProvider);
        registry.register("local_file", LocalFileProvider);
        registry.register("module", ModuleProvider);
        registry
    }

    /// Register a provider for a node type, or for every type sharing a
    /// prefix when `node_type` ends with `_`
    pub fn register(&mut self, node_type: &str, provider: impl Provider + 'static) {
        self.providers
            .insert(node_type.to_string(), Arc::new(provider));
    }

    /// Whether some provider handles `node_type`
    pub fn supports(&self, node_type: &str) -> bool {
        self.lookup(node_type).is_some()
    }

    fn lookup(&self, node_type: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(node_type).or_else(|| {
            // Longest registered prefix wins
            self.providers
                .iter()
                .filter(|(key, _)| key.ends_with('_') && node_type.starts_with(key.as_str()))
                .max_by_key(|(key, _)| key.len())
                .map(|(_, p)| p)
        })
    }

    /// Provider for a node, or `UnknownProvider`
    pub fn get(&self, node_id: &str, node_type: &str) -> Result<&dyn Provider> {
        self.lookup(node_type)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::UnknownProvider {
                node: node_id.to_string(),
                node_type: node_type.to_string(),
            })
    }

    /// Registered node types
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.get("null_resource.a", "null_resource").unwrap().name(), "null");
        assert_eq!(registry.get("local_file.f", "local_file").unwrap().name(), "local_file");
        assert!(registry.supports("module"));
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let registry = ProviderRegistry::with_builtins();
        let err = registry.get("aws_instance.web", "aws_instance").unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownProvider { node, node_type } if node == "aws_instance.web" && node_type == "aws_instance"
        ));
    }

    #[test]
    fn test_prefix_registration() {
        let mut registry = ProviderRegistry::new();
        registry.register("aws_", NullProvider);
        assert!(registry.supports("aws_instance"));
        assert!(registry.supports("aws_eip"));
        assert!(!registry.supports("gcp_instance"));
    }
}
