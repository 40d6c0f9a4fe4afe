//! Parsed process models as handed over by the model parser.
//!
//! Only linear processes are supported: flow nodes are activated one after another in
//! declaration order.

use std::collections::HashSet;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum FlowNodeKind {
    NoneStartEvent,
    MessageStartEvent,
    IntermediateEvent,
    ServiceTask { job_type: String },
    CallActivity { process_id: String },
    EndEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub kind: FlowNodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct ProcessModel {
    pub bpmn_process_id: String,
    pub elements: Vec<FlowNode>,
}

impl ProcessModel {
    pub fn new(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            elements: Vec::new(),
        }
    }

    pub fn with_node(mut self, id: impl Into<String>, kind: FlowNodeKind) -> Self {
        self.elements.push(FlowNode {
            id: id.into(),
            kind,
        });
        self
    }

    /// The entry point used by instance creation, if the model has a none start event.
    pub fn none_start_event(&self) -> Option<&FlowNode> {
        self.elements
            .first()
            .filter(|node| node.kind == FlowNodeKind::NoneStartEvent)
    }

    pub fn element(&self, id: &str) -> Option<&FlowNode> {
        self.elements.iter().find(|node| node.id == id)
    }

    /// Node reached over the outgoing sequence flow of `id`.
    pub fn next_after(&self, id: &str) -> Option<&FlowNode> {
        let pos = self.elements.iter().position(|node| node.id == id)?;
        self.elements.get(pos + 1)
    }

    pub fn called_process_ids(&self) -> impl Iterator<Item = &str> {
        self.elements.iter().filter_map(|node| match &node.kind {
            FlowNodeKind::CallActivity { process_id } => Some(process_id.as_str()),
            _ => None,
        })
    }

    /// Structural checks that do not depend on other deployed processes.
    pub fn validate(&self) -> Result<(), String> {
        if self.bpmn_process_id.is_empty() {
            return Err("process id must not be empty".to_string());
        }
        if self.elements.is_empty() {
            return Err(format!(
                "process '{}' must contain at least one element",
                self.bpmn_process_id
            ));
        }
        let mut seen = HashSet::new();
        for node in &self.elements {
            if node.id.is_empty() || node.id == self.bpmn_process_id {
                return Err(format!(
                    "element id '{}' of process '{}' is invalid",
                    node.id, self.bpmn_process_id
                ));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(format!(
                    "duplicate element id '{}' in process '{}'",
                    node.id, self.bpmn_process_id
                ));
            }
            if let FlowNodeKind::ServiceTask { job_type } = &node.kind {
                if job_type.is_empty() {
                    return Err(format!("service task '{}' has no job type", node.id));
                }
            }
        }
        Ok(())
    }
}
