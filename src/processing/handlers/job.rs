use crate::error::ProcessingResult;
use crate::processing::control::CommandControl;
use crate::processing::registry::CommandProcessor;
use crate::record::{Intent, Record, RecordValue, RejectionType};
use crate::state::ElementState;

use super::{merge_variables, parse_variables};

/// Job COMPLETE: hands the job's variables to the process instance and moves the task on.
pub struct JobCompleteProcessor;

impl CommandProcessor for JobCompleteProcessor {
    fn on_command(
        &self,
        command: &Record,
        control: &mut dyn CommandControl,
    ) -> ProcessingResult<bool> {
        let key = command.key.unwrap_or_default();
        let Some(job) = control.state().job(key)? else {
            control.reject(
                RejectionType::NotFound,
                format!("Expected to complete job with key '{}', but no such job was found", key),
            );
            return Ok(true);
        };
        let document = match &command.value {
            RecordValue::Job(completion) => completion.variables.clone(),
            _ => Vec::new(),
        };
        let variables = match parse_variables(&document) {
            Ok(variables) => variables,
            Err(reason) => {
                control.reject(
                    RejectionType::InvalidArgument,
                    format!("Expected to complete job with valid variables, but {}", reason),
                );
                return Ok(true);
            }
        };
        let element = control
            .state()
            .element_instance(job.record.element_instance_key)?
            .filter(|element| element.state == ElementState::Activated);
        let Some(element) = element else {
            control.reject(
                RejectionType::InvalidState,
                format!(
                    "Expected to complete job with key '{}', but its element instance '{}' is not active",
                    key, job.record.element_instance_key
                ),
            );
            return Ok(true);
        };

        let mut completed = job.record.clone();
        completed.variables = document;
        control.accept(key, Intent::Completed, RecordValue::Job(completed))?;
        merge_variables(
            control,
            job.record.process_instance_key,
            &job.record.bpmn_process_id,
            variables.into_iter().map(|(name, value)| (name, value.to_string())),
        )?;
        control.append_follow_up_command(
            element.key,
            Intent::CompleteElement,
            RecordValue::ProcessInstance(element.value),
        );
        Ok(true)
    }
}
