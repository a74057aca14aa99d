use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::debug;

use crate::{ConvoflowError, Flow, Result, ShareLock};

/// Source of flow definitions, keyed by flow id.
pub trait FlowDefinitionLocator: Send + Sync {
    fn get_flow_definition(
        &self,
        flow_id: &str,
    ) -> Result<Arc<Flow>>;

    fn contains_flow_definition(
        &self,
        flow_id: &str,
    ) -> bool;
}

/// In-memory registry of flow definitions.
pub struct FlowDefinitionRegistry {
    flows: ShareLock<HashMap<String, Arc<Flow>>>,
}

impl Default for FlowDefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowDefinitionRegistry {
    pub fn new() -> Self {
        Self {
            flows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers `flow`, replacing any definition with the same id.
    pub fn register(
        &self,
        flow: Flow,
    ) -> Arc<Flow> {
        let flow = Arc::new(flow);
        debug!("registering flow definition '{}'", flow.id());
        let mut flows = self.flows.write().unwrap_or_else(|e| e.into_inner());
        flows.insert(flow.id().to_string(), flow.clone());
        flow
    }

    pub fn unregister(
        &self,
        flow_id: &str,
    ) -> Option<Arc<Flow>> {
        let mut flows = self.flows.write().unwrap_or_else(|e| e.into_inner());
        flows.remove(flow_id)
    }

    pub fn flow_ids(&self) -> Vec<String> {
        let flows = self.flows.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = flows.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.flows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FlowDefinitionLocator for FlowDefinitionRegistry {
    fn get_flow_definition(
        &self,
        flow_id: &str,
    ) -> Result<Arc<Flow>> {
        let flows = self.flows.read().unwrap_or_else(|e| e.into_inner());
        flows.get(flow_id).cloned().ok_or_else(|| ConvoflowError::NoSuchFlowDefinition {
            flow_id: flow_id.to_string(),
        })
    }

    fn contains_flow_definition(
        &self,
        flow_id: &str,
    ) -> bool {
        self.flows.read().unwrap_or_else(|e| e.into_inner()).contains_key(flow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlowBuilder, StateBuilder};

    #[test]
    fn test_register_and_locate() {
        let registry = FlowDefinitionRegistry::new();
        registry.register(FlowBuilder::new("search").state(StateBuilder::end("done")).build().unwrap());

        assert!(registry.contains_flow_definition("search"));
        assert_eq!(registry.get_flow_definition("search").unwrap().id(), "search");
        assert_eq!(registry.flow_ids(), vec!["search".to_string()]);

        let err = registry.get_flow_definition("booking").unwrap_err();
        assert_eq!(
            err,
            ConvoflowError::NoSuchFlowDefinition {
                flow_id: "booking".to_string()
            }
        );

        assert!(registry.unregister("search").is_some());
        assert!(registry.is_empty());
    }
}
