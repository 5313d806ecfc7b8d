//! `null_resource` - no side effect, just an identity for hooks to hang on

use crate::provider::{Provider, ProviderRequest};
use crate::state::StateRecord;
use crate::value::{Attributes, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct NullProvider;

impl Provider for NullProvider {
    fn name(&self) -> &'static str {
        "null"
    }

    fn create(&self, request: &ProviderRequest<'_>) -> anyhow::Result<Attributes> {
        log::debug!("{}: nothing to create", request.node_id);
        let mut outputs = Attributes::new();
        outputs.insert("id".into(), Value::from(uuid::Uuid::new_v4().simple().to_string()));
        Ok(outputs)
    }

    /// Keeps the identity of the existing object
    fn update(
        &self,
        request: &ProviderRequest<'_>,
        prior: &StateRecord,
    ) -> anyhow::Result<Attributes> {
        match prior.outputs.get("id") {
            Some(id) => Ok(Attributes::from([("id".to_string(), id.clone())])),
            None => self.create(request),
        }
    }

    fn delete(&self, record: &StateRecord) -> anyhow::Result<()> {
        log::debug!("{}: nothing to delete", record.id);
        Ok(())
    }

    /// Echo the inputs back as outputs
    fn read(&self, request: &ProviderRequest<'_>) -> anyhow::Result<Attributes> {
        let mut outputs = Attributes::new();
        outputs.insert("id".into(), Value::from(request.node_id));
        outputs.insert("outputs".into(), Value::Map(request.attributes.clone()));
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;
    use std::collections::BTreeSet;

    #[test]
    fn test_update_keeps_id() {
        let node = Node::resource("null_resource", "a").with_attr("trigger", "1");
        let request = ProviderRequest {
            node_id: &node.id,
            node_type: &node.node_type,
            attributes: &node.attributes,
        };
        let outputs = NullProvider.create(&request).unwrap();
        let record = StateRecord::from_node(&node, BTreeSet::new(), outputs.clone());
        assert_eq!(NullProvider.update(&request, &record).unwrap()["id"], outputs["id"]);
    }
}
