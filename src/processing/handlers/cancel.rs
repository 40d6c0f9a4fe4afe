use crate::error::ProcessingResult;
use crate::processing::control::CommandControl;
use crate::processing::registry::CommandProcessor;
use crate::record::{ElementType, Intent, Record, RecordValue, RejectionType};

/// ProcessInstance CANCEL. Only root instances can be canceled by a client.
pub struct CancelProcessInstanceProcessor;

impl CommandProcessor for CancelProcessInstanceProcessor {
    fn on_command(
        &self,
        command: &Record,
        control: &mut dyn CommandControl,
    ) -> ProcessingResult<bool> {
        let key = command.key.unwrap_or_default();
        let instance = control
            .state()
            .element_instance(key)?
            .filter(|instance| instance.value.element_type == ElementType::Process)
            .filter(|instance| instance.can_terminate());
        let Some(instance) = instance else {
            control.reject(
                RejectionType::NotFound,
                format!(
                    "Expected to cancel a process instance with key '{}', but no such process was found",
                    key
                ),
            );
            return Ok(true);
        };

        if instance.value.parent_process_instance_key.is_some() {
            let root = control.state().root_process_instance(key)?;
            control.reject(
                RejectionType::InvalidState,
                format!(
                    "Expected to cancel a process instance with key '{}', but it is created by a parent process instance. Cancel the root process instance '{}' instead.",
                    key, root
                ),
            );
            return Ok(true);
        }

        let value = RecordValue::ProcessInstance(instance.value);
        control.append_follow_up_command(key, Intent::TerminateElement, value.clone());
        control.accept(key, Intent::ElementTerminating, value)?;
        Ok(true)
    }
}
