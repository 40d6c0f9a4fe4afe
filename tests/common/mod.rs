#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use flowraft::entry::RaftEntry;
use flowraft::processing::{CommandResponse, ResponseReceiver};
use flowraft::record::{
    DeploymentRecord, ElementType, FlowNodeKind, Intent, ProcessInstanceCreationRecord,
    ProcessInstanceRecord, ProcessModel, ProcessRecord, Record, RecordValue, decode_records,
};
use flowraft::{
    HandlerRegistry, Partition, PartitionHandle, PartitionOptions, PartitionRole,
    response_channel,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn options(dir: &Path, role: PartitionRole) -> PartitionOptions {
    let mut options = PartitionOptions::new(1, dir).with_role(role);
    options.log.sync_on_write = false;
    options.snapshot.sync_on_write = false;
    options.backpressure_retry = Duration::from_millis(10);
    options
}

/// A running partition plus the receiving end of its response channel.
pub struct TestPartition {
    pub handle: PartitionHandle,
    pub responses: ResponseReceiver,
}

impl TestPartition {
    pub async fn start(options: PartitionOptions) -> Self {
        let (tx, responses) = response_channel();
        let handle = Partition::start(options, HandlerRegistry::engine(), tx)
            .await
            .unwrap();
        Self { handle, responses }
    }

    pub async fn next_response(&mut self) -> CommandResponse {
        tokio::time::timeout(TIMEOUT, self.responses.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("response channel closed")
    }

    /// Asserts that no response arrives within `wait`.
    pub async fn assert_no_response(&mut self, wait: Duration) {
        if let Ok(Some(response)) = tokio::time::timeout(wait, self.responses.recv()).await {
            panic!("unexpected response {:?}", response);
        }
    }

    /// Waits until every committed entry is applied and nothing new gets appended.
    pub async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let health = self.handle.health().await.unwrap();
            assert!(health.is_healthy(), "partition failed: {:?}", health.failure);
            if health.last_applied_index == health.commit_index {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let again = self.handle.health().await.unwrap();
                if again.commit_index == health.commit_index
                    && again.last_applied_index == again.commit_index
                {
                    return;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "partition did not become idle"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_applied(&self, index: u64) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while self.handle.health().await.unwrap().last_applied_index < index {
            assert!(tokio::time::Instant::now() < deadline, "entry {} not applied", index);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Every record written to the log so far, in position order.
    pub fn records(&self) -> Vec<Record> {
        let store = self.handle.log().store();
        store
            .read_range(store.first_index(), store.last_index())
            .unwrap()
            .into_iter()
            .filter_map(|entry| match entry.entry.as_ref() {
                RaftEntry::Application(application) => {
                    Some(decode_records(&application.data).unwrap())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn entries(&self) -> Vec<RaftEntry> {
        let store = self.handle.log().store();
        store
            .read_range(store.first_index(), store.last_index())
            .unwrap()
            .into_iter()
            .map(|entry| entry.entry.as_ref().clone())
            .collect()
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

pub fn call_process(id: &str, child: &str) -> ProcessModel {
    ProcessModel::new(id)
        .with_node("start", FlowNodeKind::NoneStartEvent)
        .with_node(
            "call",
            FlowNodeKind::CallActivity {
                process_id: child.into(),
            },
        )
        .with_node("end", FlowNodeKind::EndEvent)
}

pub fn deploy(models: Vec<ProcessModel>) -> Record {
    Record::command(
        Intent::Create,
        RecordValue::Deployment(DeploymentRecord {
            processes: models
                .into_iter()
                .map(|model| ProcessRecord {
                    key: 0,
                    bpmn_process_id: model.bpmn_process_id.clone(),
                    version: 0,
                    model,
                })
                .collect(),
        }),
    )
}

pub fn create(bpmn_process_id: &str, version: i32) -> Record {
    Record::command(
        Intent::Create,
        RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
            bpmn_process_id: bpmn_process_id.into(),
            version,
            ..Default::default()
        }),
    )
}

/// Creation answered only once the instance completes or is terminated.
pub fn create_awaiting(bpmn_process_id: &str) -> Record {
    Record::command(
        Intent::CreateWithAwaitingResult,
        RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
            bpmn_process_id: bpmn_process_id.into(),
            version: -1,
            ..Default::default()
        }),
    )
}

pub fn cancel(key: u64) -> Record {
    Record::command(
        Intent::Cancel,
        RecordValue::ProcessInstance(ProcessInstanceRecord {
            bpmn_process_id: String::new(),
            version: 0,
            process_definition_key: 0,
            process_instance_key: key,
            element_id: String::new(),
            element_type: ElementType::Process,
            flow_scope_key: None,
            parent_process_instance_key: None,
            parent_element_instance_key: None,
        }),
    )
    .with_key(key)
}

/// Key of the process instance a creation response was accepted with.
pub fn created_instance(response: &CommandResponse) -> (u64, u32) {
    let record = response.outcome.record().expect("creation rejected");
    match &record.value {
        RecordValue::ProcessInstanceCreation(creation) => {
            (creation.process_instance_key, creation.version as u32)
        }
        other => panic!("unexpected creation response {:?}", other),
    }
}
