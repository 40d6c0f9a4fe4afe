use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProcessingResult;
use crate::record::{Intent, Record, ValueType};

use super::control::CommandControl;
use super::handlers::{
    BpmnElementProcessor, CancelProcessInstanceProcessor, CreateProcessInstanceProcessor,
    CreateWithAwaitingResultProcessor, DeploymentCreateProcessor, JobCompleteProcessor,
};

/// Handles one kind of command. Handlers are synchronous and deterministic: everything
/// they produce is a function of the command and the current state.
pub trait CommandProcessor: Send + Sync {
    /// Returns `false` when the command was stale and left no trace.
    fn on_command(
        &self,
        command: &Record,
        control: &mut dyn CommandControl,
    ) -> ProcessingResult<bool>;
}

/// Immutable lookup from `(ValueType, Intent)` to its handler.
pub struct HandlerRegistry {
    handlers: HashMap<(ValueType, Intent), Arc<dyn CommandProcessor>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Registry with every built-in handler.
    pub fn engine() -> Arc<Self> {
        let bpmn: Arc<dyn CommandProcessor> = Arc::new(BpmnElementProcessor);
        Self::builder()
            .register(ValueType::Deployment, Intent::Create, DeploymentCreateProcessor)
            .register(
                ValueType::ProcessInstanceCreation,
                Intent::Create,
                CreateProcessInstanceProcessor,
            )
            .register(
                ValueType::ProcessInstanceCreation,
                Intent::CreateWithAwaitingResult,
                CreateWithAwaitingResultProcessor,
            )
            .register(ValueType::ProcessInstance, Intent::Cancel, CancelProcessInstanceProcessor)
            .register_shared(ValueType::ProcessInstance, Intent::ActivateElement, bpmn.clone())
            .register_shared(ValueType::ProcessInstance, Intent::CompleteElement, bpmn.clone())
            .register_shared(ValueType::ProcessInstance, Intent::TerminateElement, bpmn)
            .register(ValueType::Job, Intent::Complete, JobCompleteProcessor)
            .build()
    }

    pub fn get(&self, value_type: ValueType, intent: Intent) -> Option<Arc<dyn CommandProcessor>> {
        self.handlers.get(&(value_type, intent)).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<(ValueType, Intent), Arc<dyn CommandProcessor>>,
}

impl HandlerRegistryBuilder {
    pub fn register<P>(self, value_type: ValueType, intent: Intent, processor: P) -> Self
    where
        P: CommandProcessor + 'static,
    {
        self.register_shared(value_type, intent, Arc::new(processor))
    }

    /// Later registrations replace earlier ones for the same pair.
    pub fn register_shared(
        mut self,
        value_type: ValueType,
        intent: Intent,
        processor: Arc<dyn CommandProcessor>,
    ) -> Self {
        self.handlers.insert((value_type, intent), processor);
        self
    }

    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
