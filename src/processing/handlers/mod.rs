//! Built-in command handlers.

mod await_result;
mod bpmn;
mod cancel;
mod creation;
mod deployment;
mod job;

use serde_json::{Map, Value};

use crate::error::{ProcessingError, ProcessingResult};
use crate::record::{Intent, Record, RecordValue, VariableRecord};
use crate::types::Key;

use super::control::CommandControl;

pub use await_result::{AwaitResultControl, CreateWithAwaitingResultProcessor};
pub use bpmn::BpmnElementProcessor;
pub use cancel::CancelProcessInstanceProcessor;
pub use creation::CreateProcessInstanceProcessor;
pub use deployment::DeploymentCreateProcessor;
pub use job::JobCompleteProcessor;

/// Parses a variables document. Empty input and `null` are an empty document.
pub(crate) fn parse_variables(document: &[u8]) -> Result<Map<String, Value>, String> {
    if document.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(document) {
        Ok(Value::Object(variables)) => Ok(variables),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(format!(
            "Expected document to be a root level object, but was '{}'",
            json_type(&other)
        )),
        Err(e) => Err(format!("Expected document to be valid JSON, but {}", e)),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Bool(_) => "BOOLEAN",
        Value::Number(_) => "NUMBER",
        Value::String(_) => "STRING",
        Value::Array(_) => "ARRAY",
        Value::Object(_) => "OBJECT",
    }
}

/// Writes `variables` into `scope_key`: UPDATED for names the scope already has, CREATED
/// with a fresh key otherwise. Names are visited in sorted order.
pub(crate) fn merge_variables(
    control: &mut dyn CommandControl,
    scope_key: Key,
    bpmn_process_id: &str,
    variables: impl IntoIterator<Item = (String, String)>,
) -> ProcessingResult<()> {
    for (name, value) in variables {
        let existing = control.state().variable(scope_key, &name)?;
        let record = RecordValue::Variable(VariableRecord {
            name,
            value,
            scope_key,
            process_instance_key: scope_key,
            bpmn_process_id: bpmn_process_id.to_string(),
        });
        match existing {
            Some(variable) => {
                control.append_event(variable.key, Intent::Updated, record)?;
            }
            None => {
                let key = control.next_key()?;
                control.append_event(key, Intent::Created, record)?;
            }
        }
    }
    Ok(())
}

/// Commands written by this engine always carry a key; one without is a bug.
pub(crate) fn command_key(command: &Record) -> ProcessingResult<Key> {
    command.key.ok_or_else(|| ProcessingError::Handler {
        position: command.position,
        reason: format!("{}.{} command without key", command.value_type(), command.intent),
    })
}

pub(crate) fn handler_error(command: &Record, reason: impl Into<String>) -> ProcessingError {
    ProcessingError::Handler {
        position: command.position,
        reason: reason.into(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Drives handlers against a bare state without a log.

    use std::sync::Arc;

    use crate::processing::appliers::EventAppliers;
    use crate::processing::control::{ControlResult, ProcessingControl};
    use crate::processing::registry::HandlerRegistry;
    use crate::record::{
        DeploymentRecord, FlowNodeKind, Intent, ProcessModel, ProcessRecord, Record, RecordValue,
        SourceRef,
    };
    use crate::state::ProcessingState;

    pub struct Harness {
        pub state: ProcessingState,
        pub appliers: EventAppliers,
        pub registry: Arc<HandlerRegistry>,
        position: u64,
        index: u64,
    }

    impl Harness {
        pub fn new() -> Self {
            Self {
                state: ProcessingState::new(1),
                appliers: EventAppliers::new(),
                registry: HandlerRegistry::engine(),
                position: 1,
                index: 1,
            }
        }

        /// Runs one command and commits its effects.
        pub fn run(&mut self, command: Record) -> ControlResult {
            let handler = self
                .registry
                .get(command.value_type(), command.intent)
                .expect("handler registered");
            self.state.begin();
            let mut control = ProcessingControl::new(
                &mut self.state,
                &self.appliers,
                SourceRef::new(self.index, 0),
                command.request,
                self.position,
            );
            handler.on_command(&command, &mut control).unwrap();
            let result = control.finish();
            self.state.commit();
            self.index += 1;
            self.position += result.records.len() as u64;
            result
        }

        /// Runs a command and then every follow-up command it produced, depth first.
        pub fn run_to_quiescence(&mut self, command: Record) -> Vec<ControlResult> {
            let mut queue = std::collections::VecDeque::from([command]);
            let mut results = Vec::new();
            while let Some(command) = queue.pop_front() {
                let result = self.run(command);
                queue.extend(result.records.iter().filter(|r| r.is_command()).cloned());
                results.push(result);
            }
            results
        }

        pub fn deploy(&mut self, model: ProcessModel) -> ControlResult {
            let command = Record::command(
                Intent::Create,
                RecordValue::Deployment(DeploymentRecord {
                    processes: vec![ProcessRecord {
                        key: 0,
                        bpmn_process_id: model.bpmn_process_id.clone(),
                        version: 0,
                        model,
                    }],
                }),
            )
            .with_request(1, 1);
            self.run(command)
        }
    }

    pub fn linear_process(id: &str) -> ProcessModel {
        ProcessModel::new(id)
            .with_node("start", FlowNodeKind::NoneStartEvent)
            .with_node("end", FlowNodeKind::EndEvent)
    }

    pub fn task_process(id: &str) -> ProcessModel {
        ProcessModel::new(id)
            .with_node("start", FlowNodeKind::NoneStartEvent)
            .with_node(
                "task",
                FlowNodeKind::ServiceTask {
                    job_type: "work".into(),
                },
            )
            .with_node("end", FlowNodeKind::EndEvent)
    }
}
