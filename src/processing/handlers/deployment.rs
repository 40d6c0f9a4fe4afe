use std::collections::HashSet;

use tracing::debug;

use crate::error::ProcessingResult;
use crate::processing::control::CommandControl;
use crate::processing::registry::CommandProcessor;
use crate::record::{DeploymentRecord, Intent, Record, RecordValue, RejectionType};

/// Deployment CREATE: versions and stores the given process models.
pub struct DeploymentCreateProcessor;

impl CommandProcessor for DeploymentCreateProcessor {
    fn on_command(
        &self,
        command: &Record,
        control: &mut dyn CommandControl,
    ) -> ProcessingResult<bool> {
        let RecordValue::Deployment(deployment) = &command.value else {
            control.reject(RejectionType::InvalidArgument, "Expected a deployment".to_string());
            return Ok(true);
        };
        if let Err(reason) = validate(deployment, control) {
            control.reject(RejectionType::InvalidArgument, reason);
            return Ok(true);
        }

        let deployment_key = control.next_key()?;
        let mut deployed = Vec::with_capacity(deployment.processes.len());
        for process in &deployment.processes {
            let model = &process.model;
            let latest = control.state().latest_process(&model.bpmn_process_id)?;
            if let Some(latest) = latest.filter(|latest| latest.model == *model) {
                debug!(
                    "Process '{}' unchanged, keeping version {}",
                    latest.bpmn_process_id, latest.version
                );
                deployed.push(latest);
                continue;
            }

            let mut created = process.clone();
            created.key = control.next_key()?;
            created.bpmn_process_id = model.bpmn_process_id.clone();
            created.version = control.state().latest_version(&model.bpmn_process_id)? + 1;
            control.append_event(
                created.key,
                Intent::Created,
                RecordValue::Process(created.clone()),
            )?;
            deployed.push(created);
        }

        control.accept(
            deployment_key,
            Intent::Created,
            RecordValue::Deployment(DeploymentRecord {
                processes: deployed,
            }),
        )?;
        Ok(true)
    }
}

fn validate(deployment: &DeploymentRecord, control: &dyn CommandControl) -> Result<(), String> {
    if deployment.processes.is_empty() {
        return Err("Expected to deploy at least one process, but none given".to_string());
    }

    let mut ids = HashSet::new();
    for process in &deployment.processes {
        process.model.validate()?;
        if !ids.insert(process.model.bpmn_process_id.as_str()) {
            return Err(format!(
                "Expected process ids to be unique within a deployment, but '{}' is deployed twice",
                process.model.bpmn_process_id
            ));
        }
    }

    for process in &deployment.processes {
        for called in process.model.called_process_ids() {
            if ids.contains(called) {
                continue;
            }
            let deployed = control
                .state()
                .latest_version(called)
                .map_err(|e| e.to_string())?;
            if deployed == 0 {
                return Err(format!(
                    "Expected to find process '{}' called by '{}', but it is not deployed",
                    called, process.model.bpmn_process_id
                ));
            }
        }
    }
    Ok(())
}
