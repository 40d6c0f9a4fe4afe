//! Element lifecycle of linear processes.
//!
//! Every element walks ACTIVATING -> ACTIVATED -> COMPLETING -> COMPLETED, or ends in
//! TERMINATING -> TERMINATED. Transitions between elements always go through follow-up
//! commands, so each step is its own entry in the log.

use tracing::trace;

use crate::error::ProcessingResult;
use crate::processing::control::CommandControl;
use crate::processing::registry::CommandProcessor;
use crate::processing::response::Outcome;
use crate::record::{
    ElementType, FlowNode, FlowNodeKind, Intent, JobRecord, ProcessInstanceCreationRecord,
    ProcessInstanceRecord, ProcessRecord, Record, RecordType, RecordValue, RejectionType,
    VariableRecord,
};
use crate::state::{ElementInstance, ElementState};
use crate::types::Key;

use super::{command_key, handler_error, merge_variables};

/// ACTIVATE_ELEMENT, COMPLETE_ELEMENT and TERMINATE_ELEMENT for every element type.
pub struct BpmnElementProcessor;

impl CommandProcessor for BpmnElementProcessor {
    fn on_command(
        &self,
        command: &Record,
        control: &mut dyn CommandControl,
    ) -> ProcessingResult<bool> {
        let key = command_key(command)?;
        let Some(instance) = control.state().element_instance(key)? else {
            trace!("Element instance {} is gone, ignoring {}", key, command.intent);
            return Ok(false);
        };
        match command.intent {
            Intent::ActivateElement => activate(command, instance, control),
            Intent::CompleteElement => complete(command, instance, control),
            Intent::TerminateElement => terminate(instance, control),
            other => Err(handler_error(
                command,
                format!("element processor cannot handle {}", other),
            )),
        }
    }
}

fn instance_value(value: &ProcessInstanceRecord) -> RecordValue {
    RecordValue::ProcessInstance(value.clone())
}

/// A missing or terminating flow scope takes over the lifecycle of its children.
fn scope_terminating(
    instance: &ElementInstance,
    control: &dyn CommandControl,
) -> ProcessingResult<bool> {
    match instance.flow_scope_key() {
        Some(scope) => Ok(control
            .state()
            .element_instance(scope)?
            .is_none_or(|scope| scope.state == ElementState::Terminating)),
        None => Ok(false),
    }
}

fn load_process(
    command: &Record,
    control: &dyn CommandControl,
    key: Key,
) -> ProcessingResult<ProcessRecord> {
    control
        .state()
        .process_by_key(key)?
        .ok_or_else(|| handler_error(command, format!("process definition {} not found", key)))
}

fn flow_node(
    command: &Record,
    control: &dyn CommandControl,
    value: &ProcessInstanceRecord,
) -> ProcessingResult<FlowNode> {
    let process = load_process(command, control, value.process_definition_key)?;
    process.model.element(&value.element_id).cloned().ok_or_else(|| {
        handler_error(
            command,
            format!(
                "element '{}' not found in process '{}'",
                value.element_id, process.bpmn_process_id
            ),
        )
    })
}

/// Creates the instance of `node` inside the process instance `process`.
fn activate_node(
    control: &mut dyn CommandControl,
    process: &ProcessInstanceRecord,
    node: &FlowNode,
) -> ProcessingResult<()> {
    let key = control.next_key()?;
    let record = ProcessInstanceRecord {
        bpmn_process_id: process.bpmn_process_id.clone(),
        version: process.version,
        process_definition_key: process.process_definition_key,
        process_instance_key: process.process_instance_key,
        element_id: node.id.clone(),
        element_type: ElementType::from(&node.kind),
        flow_scope_key: Some(process.process_instance_key),
        parent_process_instance_key: None,
        parent_element_instance_key: None,
    };
    control.append_event(key, Intent::ElementActivating, instance_value(&record))?;
    control.append_follow_up_command(key, Intent::ActivateElement, instance_value(&record));
    Ok(())
}

fn activate(
    command: &Record,
    instance: ElementInstance,
    control: &mut dyn CommandControl,
) -> ProcessingResult<bool> {
    if instance.state != ElementState::Activating || scope_terminating(&instance, control)? {
        return Ok(false);
    }
    let key = instance.key;
    let value = instance.value;
    control.append_event(key, Intent::ElementActivated, instance_value(&value))?;

    match value.element_type {
        ElementType::Process => {
            let process = load_process(command, control, value.process_definition_key)?;
            let start = process.model.none_start_event().cloned().ok_or_else(|| {
                handler_error(
                    command,
                    format!("process '{}' has no none start event", process.bpmn_process_id),
                )
            })?;
            activate_node(control, &value, &start)?;
        }
        ElementType::StartEvent | ElementType::IntermediateEvent | ElementType::EndEvent => {
            control.append_follow_up_command(key, Intent::CompleteElement, instance_value(&value));
        }
        ElementType::ServiceTask => {
            let FlowNodeKind::ServiceTask { job_type } = flow_node(command, control, &value)?.kind
            else {
                return Err(handler_error(
                    command,
                    format!("'{}' is not a service task", value.element_id),
                ));
            };
            let job_key = control.next_key()?;
            control.append_event(
                job_key,
                Intent::Created,
                RecordValue::Job(JobRecord {
                    job_type,
                    element_instance_key: key,
                    element_id: value.element_id.clone(),
                    process_instance_key: value.process_instance_key,
                    bpmn_process_id: value.bpmn_process_id.clone(),
                    variables: Vec::new(),
                }),
            )?;
        }
        ElementType::CallActivity => {
            let FlowNodeKind::CallActivity { process_id } =
                flow_node(command, control, &value)?.kind
            else {
                return Err(handler_error(
                    command,
                    format!("'{}' is not a call activity", value.element_id),
                ));
            };
            let called = control.state().latest_process(&process_id)?.ok_or_else(|| {
                handler_error(command, format!("called process '{}' is not deployed", process_id))
            })?;
            let child_key = control.next_key()?;
            let child = ProcessInstanceRecord {
                bpmn_process_id: called.bpmn_process_id.clone(),
                version: called.version,
                process_definition_key: called.key,
                process_instance_key: child_key,
                element_id: called.bpmn_process_id.clone(),
                element_type: ElementType::Process,
                flow_scope_key: None,
                parent_process_instance_key: Some(value.process_instance_key),
                parent_element_instance_key: Some(key),
            };
            control.append_event(child_key, Intent::ElementActivating, instance_value(&child))?;

            // the child starts with a copy of the caller's variables
            let variables = control.state().variables_of(value.process_instance_key)?;
            for (name, variable) in variables {
                let variable_key = control.next_key()?;
                control.append_event(
                    variable_key,
                    Intent::Created,
                    RecordValue::Variable(VariableRecord {
                        name,
                        value: variable.value,
                        scope_key: child_key,
                        process_instance_key: child_key,
                        bpmn_process_id: called.bpmn_process_id.clone(),
                    }),
                )?;
            }
            control.append_follow_up_command(
                child_key,
                Intent::ActivateElement,
                instance_value(&child),
            );
        }
    }
    Ok(true)
}

fn complete(
    command: &Record,
    instance: ElementInstance,
    control: &mut dyn CommandControl,
) -> ProcessingResult<bool> {
    if instance.state != ElementState::Activated || scope_terminating(&instance, control)? {
        return Ok(false);
    }
    let key = instance.key;
    let value = &instance.value;
    control.append_event(key, Intent::ElementCompleting, instance_value(value))?;

    if value.element_type == ElementType::Process {
        complete_process(&instance, control)?;
        return Ok(true);
    }

    control.append_event(key, Intent::ElementCompleted, instance_value(value))?;
    let scope_key = instance
        .flow_scope_key()
        .ok_or_else(|| handler_error(command, format!("element {} has no flow scope", key)))?;
    let scope = control
        .state()
        .element_instance(scope_key)?
        .ok_or_else(|| handler_error(command, format!("flow scope {} not found", scope_key)))?;
    let process = load_process(command, control, value.process_definition_key)?;
    match process.model.next_after(&value.element_id) {
        Some(next) => activate_node(control, &scope.value, next)?,
        None => {
            control.append_follow_up_command(
                scope_key,
                Intent::CompleteElement,
                instance_value(&scope.value),
            );
        }
    }
    Ok(true)
}

fn complete_process(
    instance: &ElementInstance,
    control: &mut dyn CommandControl,
) -> ProcessingResult<()> {
    let key = instance.key;
    let value = &instance.value;

    let Some(call_activity) = value.parent_element_instance_key else {
        // read before COMPLETED drops the variables and the pending request
        let pending = control.state().pending_request(key)?;
        let fetched = match &pending {
            Some(pending) => Some(
                control
                    .state()
                    .variables_document(key, &pending.fetch_variables)?,
            ),
            None => None,
        };
        let position = control.append_event(key, Intent::ElementCompleted, instance_value(value))?;
        if let (Some(pending), Some(variables)) = (pending, fetched) {
            let result = Record {
                position,
                source: None,
                key: Some(key),
                record_type: RecordType::Event,
                intent: Intent::ElementCompleted,
                request: Some(pending.request),
                value: RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
                    bpmn_process_id: value.bpmn_process_id.clone(),
                    version: value.version as i32,
                    process_definition_key: value.process_definition_key,
                    process_instance_key: key,
                    variables,
                    fetch_variables: pending.fetch_variables,
                    await_result: None,
                }),
            };
            control.respond_to(pending.request, Outcome::Accepted(result));
        }
        return Ok(());
    };

    if let Some(parent) = value.parent_process_instance_key {
        let variables: Vec<(String, String)> = control
            .state()
            .variables_of(key)?
            .into_iter()
            .map(|(name, variable)| (name, variable.value))
            .collect();
        let parent_process_id = control
            .state()
            .element_instance(parent)?
            .map(|parent| parent.value.bpmn_process_id)
            .unwrap_or_default();
        merge_variables(control, parent, &parent_process_id, variables)?;
    }
    control.append_event(key, Intent::ElementCompleted, instance_value(value))?;
    if let Some(call) = control.state().element_instance(call_activity)? {
        if call.state == ElementState::Activated {
            control.append_follow_up_command(
                call.key,
                Intent::CompleteElement,
                instance_value(&call.value),
            );
        }
    }
    Ok(())
}

fn terminate(
    instance: ElementInstance,
    control: &mut dyn CommandControl,
) -> ProcessingResult<bool> {
    let key = instance.key;
    let value = &instance.value;
    if instance.state != ElementState::Terminating {
        control.append_event(key, Intent::ElementTerminating, instance_value(value))?;
    }
    if let Some(job_key) = instance.job_key {
        if let Some(job) = control.state().job(job_key)? {
            control.append_event(job_key, Intent::Canceled, RecordValue::Job(job.record))?;
        }
    }

    // children first; the last one to go terminates this element
    if let Some(child_key) = instance.called_child_key {
        if let Some(child) = control.state().element_instance(child_key)? {
            control.append_follow_up_command(
                child_key,
                Intent::TerminateElement,
                instance_value(&child.value),
            );
            return Ok(true);
        }
    }
    let children = control.state().children_of(key);
    if !children.is_empty() {
        for child_key in children {
            if let Some(child) = control.state().element_instance(child_key)? {
                control.append_follow_up_command(
                    child_key,
                    Intent::TerminateElement,
                    instance_value(&child.value),
                );
            }
        }
        return Ok(true);
    }

    let pending = match (value.element_type, value.parent_element_instance_key) {
        (ElementType::Process, None) => control.state().pending_request(key)?,
        _ => None,
    };
    control.append_event(key, Intent::ElementTerminated, instance_value(value))?;
    if let Some(pending) = pending {
        control.respond_to(
            pending.request,
            Outcome::rejected(
                RejectionType::InvalidState,
                format!(
                    "Expected process instance '{}' to complete, but it was terminated",
                    key
                ),
            ),
        );
    }

    if let Some(scope_key) = instance.flow_scope_key() {
        if let Some(scope) = control.state().element_instance(scope_key)? {
            if scope.state == ElementState::Terminating
                && !control.state().has_children(scope_key)
            {
                control.append_follow_up_command(
                    scope_key,
                    Intent::TerminateElement,
                    instance_value(&scope.value),
                );
            }
        }
    }
    if let Some(call_activity) = value.parent_element_instance_key {
        if let Some(call) = control.state().element_instance(call_activity)? {
            if call.state == ElementState::Terminating {
                control.append_follow_up_command(
                    call.key,
                    Intent::TerminateElement,
                    instance_value(&call.value),
                );
            }
        }
    }
    Ok(true)
}
