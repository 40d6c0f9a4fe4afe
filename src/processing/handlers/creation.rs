use crate::error::ProcessingResult;
use crate::processing::control::CommandControl;
use crate::processing::registry::CommandProcessor;
use crate::record::{
    ElementType, Intent, ProcessInstanceCreationRecord, ProcessInstanceRecord, ProcessRecord,
    Record, RecordValue, RejectionType, VariableRecord,
};

use super::parse_variables;

/// ProcessInstanceCreation CREATE: starts an instance at the none start event.
pub struct CreateProcessInstanceProcessor;

impl CommandProcessor for CreateProcessInstanceProcessor {
    fn on_command(
        &self,
        command: &Record,
        control: &mut dyn CommandControl,
    ) -> ProcessingResult<bool> {
        let RecordValue::ProcessInstanceCreation(creation) = &command.value else {
            control.reject(
                RejectionType::InvalidArgument,
                "Expected a process instance creation".to_string(),
            );
            return Ok(true);
        };

        let process = match resolve_process(creation, control)? {
            Ok(process) => process,
            Err(reason) => {
                control.reject(RejectionType::NotFound, reason);
                return Ok(true);
            }
        };
        if process.model.none_start_event().is_none() {
            control.reject(
                RejectionType::InvalidState,
                format!(
                    "Expected to create instance of process with none start event, but there is no such event in process '{}'",
                    process.bpmn_process_id
                ),
            );
            return Ok(true);
        }
        let variables = match parse_variables(&creation.variables) {
            Ok(variables) => variables,
            Err(reason) => {
                control.reject(
                    RejectionType::InvalidArgument,
                    format!(
                        "Expected to set variables from document, but the document is invalid: {}",
                        reason
                    ),
                );
                return Ok(true);
            }
        };

        let instance_key = control.next_key()?;
        let instance = ProcessInstanceRecord {
            bpmn_process_id: process.bpmn_process_id.clone(),
            version: process.version,
            process_definition_key: process.key,
            process_instance_key: instance_key,
            element_id: process.bpmn_process_id.clone(),
            element_type: ElementType::Process,
            flow_scope_key: None,
            parent_process_instance_key: None,
            parent_element_instance_key: None,
        };
        control.append_event(
            instance_key,
            Intent::ElementActivating,
            RecordValue::ProcessInstance(instance.clone()),
        )?;

        for (name, value) in variables {
            let key = control.next_key()?;
            control.append_event(
                key,
                Intent::Created,
                RecordValue::Variable(VariableRecord {
                    name,
                    value: value.to_string(),
                    scope_key: instance_key,
                    process_instance_key: instance_key,
                    bpmn_process_id: process.bpmn_process_id.clone(),
                }),
            )?;
        }

        let created = ProcessInstanceCreationRecord {
            bpmn_process_id: process.bpmn_process_id.clone(),
            version: process.version as i32,
            process_definition_key: process.key,
            process_instance_key: instance_key,
            variables: creation.variables.clone(),
            fetch_variables: creation.fetch_variables.clone(),
            await_result: None,
        };
        control.accept(
            instance_key,
            Intent::Created,
            RecordValue::ProcessInstanceCreation(created),
        )?;
        control.append_follow_up_command(
            instance_key,
            Intent::ActivateElement,
            RecordValue::ProcessInstance(instance),
        );
        Ok(true)
    }
}

/// By definition key, else by id and version, else the latest version of the id.
fn resolve_process(
    creation: &ProcessInstanceCreationRecord,
    control: &dyn CommandControl,
) -> ProcessingResult<Result<ProcessRecord, String>> {
    let state = control.state();
    if creation.process_definition_key > 0 {
        return Ok(state.process_by_key(creation.process_definition_key)?.ok_or_else(|| {
            format!(
                "Expected to find process definition with key '{}', but none found",
                creation.process_definition_key
            )
        }));
    }
    if creation.bpmn_process_id.is_empty() {
        return Ok(Err(
            "Expected at least a bpmnProcessId or a key greater than -1, but none given".to_string(),
        ));
    }
    if creation.version >= 0 {
        return Ok(state
            .process_by_id_and_version(&creation.bpmn_process_id, creation.version as u32)?
            .ok_or_else(|| {
                format!(
                    "Expected to find process definition with process ID '{}' and version '{}', but none found",
                    creation.bpmn_process_id, creation.version
                )
            }));
    }
    Ok(state
        .latest_process(&creation.bpmn_process_id)?
        .ok_or_else(|| {
            format!(
                "Expected to find process definition with process ID '{}', but none found",
                creation.bpmn_process_id
            )
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::handlers::test_support::{linear_process, task_process, Harness};
    use crate::record::{FlowNodeKind, ProcessModel, RecordType};
    use crate::state::ElementState;

    fn create(id: &str, version: i32, variables: &[u8]) -> Record {
        Record::command(
            Intent::Create,
            RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
                bpmn_process_id: id.into(),
                version,
                variables: variables.to_vec(),
                ..Default::default()
            }),
        )
        .with_request(2, 1)
    }

    #[test]
    fn test_create_latest_version() {
        let mut harness = Harness::new();
        harness.deploy(linear_process("p"));
        harness.deploy(task_process("p"));

        let result = harness.run(create("p", -1, br#"{"b":2,"a":1}"#));
        let intents: Vec<_> = result.records.iter().map(|r| (r.record_type, r.intent)).collect();
        assert_eq!(
            intents,
            vec![
                (RecordType::Event, Intent::ElementActivating),
                (RecordType::Event, Intent::Created),
                (RecordType::Event, Intent::Created),
                (RecordType::Event, Intent::Created),
                (RecordType::Command, Intent::ActivateElement),
            ]
        );
        let accepted = result.responses[0].outcome.record().unwrap();
        let RecordValue::ProcessInstanceCreation(created) = &accepted.value else {
            panic!("unexpected value {:?}", accepted.value);
        };
        assert_eq!(created.version, 2);
        assert!(created.process_instance_key > 0);

        let instance = harness
            .state
            .element_instance(created.process_instance_key)
            .unwrap()
            .unwrap();
        assert_eq!(instance.state, ElementState::Activating);
        let variables = harness.state.variables_of(created.process_instance_key).unwrap();
        assert_eq!(variables.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_rejections() {
        let mut harness = Harness::new();
        let missing = harness.run(create("p", -1, b""));
        assert_eq!(
            missing.responses[0].outcome.rejection().unwrap().rejection_type,
            RejectionType::NotFound
        );

        harness.deploy(
            ProcessModel::new("msg").with_node("start", FlowNodeKind::MessageStartEvent),
        );
        let no_start = harness.run(create("msg", -1, b""));
        assert_eq!(
            no_start.responses[0].outcome.rejection().unwrap().rejection_type,
            RejectionType::InvalidState
        );

        harness.deploy(linear_process("p"));
        let bad_variables = harness.run(create("p", -1, b"[1,2]"));
        assert_eq!(
            bad_variables.responses[0].outcome.rejection().unwrap().rejection_type,
            RejectionType::InvalidArgument
        );
        assert!(bad_variables.records.is_empty());

        let wrong_version = harness.run(create("p", 7, b""));
        assert!(wrong_version.responses[0]
            .outcome
            .rejection()
            .unwrap()
            .reason
            .contains("version '7'"));
    }
}
