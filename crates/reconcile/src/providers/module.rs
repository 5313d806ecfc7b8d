//! `module` - pass-through provider for module instances
//!
//! A module node's inputs become its outputs, so `${module.NAME.x}`
//! resolves to whatever was passed in as `x`. Nested configurations are
//! not expanded.

use crate::provider::{Provider, ProviderRequest};
use crate::state::StateRecord;
use crate::value::Attributes;

#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleProvider;

impl Provider for ModuleProvider {
    fn name(&self) -> &'static str {
        "module"
    }

    fn create(&self, request: &ProviderRequest<'_>) -> anyhow::Result<Attributes> {
        Ok(request.attributes.clone())
    }

    fn delete(&self, _record: &StateRecord) -> anyhow::Result<()> {
        Ok(())
    }
}
