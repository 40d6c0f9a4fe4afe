//! Event appliers: the only code that changes domain state.
//!
//! The leader applies an event the moment a handler writes it; followers and replay
//! apply the same event when its application entry is read back. Both paths go through
//! [`EventAppliers::apply_event`], which is what keeps their state byte-identical.

use std::collections::HashMap;

use tracing::trace;

use crate::error::{StateError, StateResult};
use crate::record::{ElementType, Intent, Record, RecordValue, ValueType};
use crate::state::{ElementInstance, ElementState, Job, JobState, ProcessingState, StoredVariable};
use crate::types::Key;

type Applier = fn(&mut ProcessingState, Key, &RecordValue) -> StateResult<()>;

pub struct EventAppliers {
    appliers: HashMap<(ValueType, Intent), Applier>,
}

impl Default for EventAppliers {
    fn default() -> Self {
        Self::new()
    }
}

impl EventAppliers {
    pub fn new() -> Self {
        let mut appliers = Self {
            appliers: HashMap::new(),
        };
        // the processes of a deployment are stored by their own events
        appliers.register(ValueType::Deployment, Intent::Created, |_, _, _| Ok(()));
        appliers.register(ValueType::Process, Intent::Created, apply_process_created);
        appliers.register(
            ValueType::ProcessInstance,
            Intent::ElementActivating,
            apply_element_activating,
        );
        appliers.register(ValueType::ProcessInstance, Intent::ElementActivated, |state, key, _| {
            set_element_state(state, key, ElementState::Activated)
        });
        appliers.register(ValueType::ProcessInstance, Intent::ElementCompleting, |state, key, _| {
            set_element_state(state, key, ElementState::Completing)
        });
        appliers.register(ValueType::ProcessInstance, Intent::ElementTerminating, |state, key, _| {
            set_element_state(state, key, ElementState::Terminating)
        });
        appliers.register(
            ValueType::ProcessInstance,
            Intent::ElementCompleted,
            apply_element_finished,
        );
        appliers.register(
            ValueType::ProcessInstance,
            Intent::ElementTerminated,
            apply_element_finished,
        );
        appliers.register(
            ValueType::ProcessInstanceCreation,
            Intent::Created,
            apply_instance_created,
        );
        appliers.register(ValueType::Variable, Intent::Created, apply_variable);
        appliers.register(ValueType::Variable, Intent::Updated, apply_variable);
        appliers.register(ValueType::Job, Intent::Created, apply_job_created);
        appliers.register(ValueType::Job, Intent::Completed, apply_job_removed);
        appliers.register(ValueType::Job, Intent::Canceled, apply_job_removed);
        appliers
    }

    fn register(&mut self, value_type: ValueType, intent: Intent, applier: Applier) {
        self.appliers.insert((value_type, intent), applier);
    }

    /// Applies one event and advances the key generator and the applied position.
    pub fn apply_event(&self, state: &mut ProcessingState, record: &Record) -> StateResult<()> {
        let key = record.key.ok_or_else(|| {
            StateError::Inconsistent(format!("event at position {} has no key", record.position))
        })?;
        let applier = self
            .appliers
            .get(&(record.value_type(), record.intent))
            .ok_or_else(|| {
                StateError::Inconsistent(format!(
                    "no applier for {}.{} event at position {}",
                    record.value_type(),
                    record.intent,
                    record.position
                ))
            })?;
        trace!("Applying {}.{} for key {}", record.value_type(), record.intent, key);
        state.set_key_if_higher(key)?;
        applier(state, key, &record.value)?;
        state.set_last_applied_position(record.position)
    }
}

fn unexpected(key: Key, value: &RecordValue) -> StateError {
    StateError::Inconsistent(format!(
        "event for key {} carries an unexpected {} value",
        key,
        value.value_type()
    ))
}

fn apply_process_created(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> StateResult<()> {
    let RecordValue::Process(process) = value else {
        return Err(unexpected(key, value));
    };
    state.put_process(process)
}

fn apply_element_activating(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> StateResult<()> {
    let RecordValue::ProcessInstance(record) = value else {
        return Err(unexpected(key, value));
    };
    state.put_element_instance(&ElementInstance::new(key, record.clone()))?;
    if let Some(call_activity) = record.parent_element_instance_key {
        if state.element_instance(call_activity)?.is_some() {
            state.update_element_instance(call_activity, |instance| {
                instance.called_child_key = Some(key)
            })?;
        }
    }
    Ok(())
}

fn set_element_state(
    state: &mut ProcessingState,
    key: Key,
    element_state: ElementState,
) -> StateResult<()> {
    state.update_element_instance(key, |instance| instance.state = element_state)?;
    Ok(())
}

fn apply_element_finished(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> StateResult<()> {
    let RecordValue::ProcessInstance(record) = value else {
        return Err(unexpected(key, value));
    };
    state.remove_element_instance(key)?;
    state.remove_scope_variables(key);
    if record.element_type == ElementType::Process {
        state.remove_pending_request(key);
    }
    if let Some(call_activity) = record.parent_element_instance_key {
        if state.element_instance(call_activity)?.is_some() {
            state.update_element_instance(call_activity, |instance| {
                instance.called_child_key = None
            })?;
        }
    }
    Ok(())
}

/// Only stored while the requesting session is open, so a close that is applied before
/// or after this event leaves the same state behind.
fn apply_instance_created(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> StateResult<()> {
    let RecordValue::ProcessInstanceCreation(creation) = value else {
        return Err(unexpected(key, value));
    };
    if let Some(pending) = &creation.await_result {
        if state.session(pending.request.stream_id)?.is_some() {
            state.put_pending_request(creation.process_instance_key, pending)?;
        }
    }
    Ok(())
}

fn apply_variable(state: &mut ProcessingState, key: Key, value: &RecordValue) -> StateResult<()> {
    let RecordValue::Variable(variable) = value else {
        return Err(unexpected(key, value));
    };
    state.put_variable(
        variable.scope_key,
        &variable.name,
        &StoredVariable {
            key,
            value: variable.value.clone(),
        },
    )
}

fn apply_job_created(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> StateResult<()> {
    let RecordValue::Job(record) = value else {
        return Err(unexpected(key, value));
    };
    state.put_job(&Job {
        key,
        record: record.clone(),
        state: JobState::Activatable,
    })?;
    if state.element_instance(record.element_instance_key)?.is_some() {
        state.update_element_instance(record.element_instance_key, |instance| {
            instance.job_key = Some(key)
        })?;
    }
    Ok(())
}

fn apply_job_removed(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> StateResult<()> {
    let RecordValue::Job(record) = value else {
        return Err(unexpected(key, value));
    };
    state.remove_job(key);
    if state.element_instance(record.element_instance_key)?.is_some() {
        state.update_element_instance(record.element_instance_key, |instance| {
            instance.job_key = None
        })?;
    }
    Ok(())
}
