use crate::{StoreError, StoreResult, Workflow, WorkflowFactory, WorkflowRegistry};
use std::collections::HashMap;
use std::sync::Arc;

/// Simple registry that maps workflows based on their type string.
pub struct SimpleWorkflowRegistry {
    factories: HashMap<String, Arc<dyn WorkflowFactory>>,
}

impl SimpleWorkflowRegistry {
    pub fn new(factories: HashMap<String, Arc<dyn WorkflowFactory>>) -> Self {
        Self { factories }
    }
}

impl WorkflowRegistry for SimpleWorkflowRegistry {
    fn create_workflow(&self, workflow_type: &str) -> StoreResult<Box<dyn Workflow>> {
        Ok(self
            .factories
            .get(workflow_type)
            .ok_or_else(|| StoreError::UnknownWorkflowType(workflow_type.to_string()))?
            .create())
    }
}

pub struct SimpleWorkflowRegistryBuilder {
    factories: HashMap<String, Arc<dyn WorkflowFactory>>,
}

impl Default for SimpleWorkflowRegistryBuilder {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

impl SimpleWorkflowRegistryBuilder {
    pub fn add_factory(&mut self, factory: impl WorkflowFactory + 'static) -> &mut Self {
        self.factories
            .insert(factory.workflow_type().to_string(), Arc::new(factory));
        self
    }

    pub fn build(&self) -> Arc<SimpleWorkflowRegistry> {
        Arc::new(SimpleWorkflowRegistry::new(self.factories.clone()))
    }
}
