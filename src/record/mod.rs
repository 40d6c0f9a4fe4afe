//! Application records carried inside application entries and session commands.

pub mod model;

use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::types::{Key, LogIndex, RecordPosition};

pub use model::{FlowNode, FlowNodeKind, ProcessModel};

const RECORD_BATCH_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum RecordType {
    Command,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Deployment,
    Process,
    ProcessInstance,
    ProcessInstanceCreation,
    Variable,
    Job,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub enum Intent {
    Create,
    Created,
    CreateWithAwaitingResult,
    Cancel,
    ActivateElement,
    CompleteElement,
    TerminateElement,
    ElementActivating,
    ElementActivated,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,
    Complete,
    Completed,
    Canceled,
    Updated,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum RejectionType {
    NotFound,
    InvalidState,
    InvalidArgument,
    AlreadyExists,
}

/// The command a record was produced from: log index plus offset inside that entry.
/// Ordered, so it doubles as the processing cursor.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct SourceRef {
    pub index: LogIndex,
    pub offset: u32,
}

impl SourceRef {
    pub fn new(index: LogIndex, offset: u32) -> Self {
        Self { index, offset }
    }
}

/// Identifies the client stream a response must be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct RequestRef {
    pub request_id: u64,
    pub stream_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum ElementType {
    Process,
    StartEvent,
    IntermediateEvent,
    ServiceTask,
    CallActivity,
    EndEvent,
}

impl From<&FlowNodeKind> for ElementType {
    fn from(kind: &FlowNodeKind) -> Self {
        match kind {
            FlowNodeKind::NoneStartEvent | FlowNodeKind::MessageStartEvent => {
                ElementType::StartEvent
            }
            FlowNodeKind::IntermediateEvent => ElementType::IntermediateEvent,
            FlowNodeKind::ServiceTask { .. } => ElementType::ServiceTask,
            FlowNodeKind::CallActivity { .. } => ElementType::CallActivity,
            FlowNodeKind::EndEvent => ElementType::EndEvent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub key: Key,
    pub bpmn_process_id: String,
    pub version: u32,
    pub model: ProcessModel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub processes: Vec<ProcessRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub bpmn_process_id: String,
    pub version: u32,
    pub process_definition_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub element_type: ElementType,
    pub flow_scope_key: Option<Key>,
    pub parent_process_instance_key: Option<Key>,
    pub parent_element_instance_key: Option<Key>,
}

/// Response correlation stashed into an accepted creation when the client awaits the result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct AwaitResult {
    pub request: RequestRef,
    pub fetch_variables: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct ProcessInstanceCreationRecord {
    pub bpmn_process_id: String,
    /// -1 selects the latest deployed version.
    pub version: i32,
    pub process_definition_key: Key,
    pub process_instance_key: Key,
    /// JSON document; empty or `null` means no variables.
    pub variables: Vec<u8>,
    pub fetch_variables: Vec<String>,
    pub await_result: Option<AwaitResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    /// JSON text of the value.
    pub value: String,
    pub scope_key: Key,
    pub process_instance_key: Key,
    pub bpmn_process_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_type: String,
    pub element_instance_key: Key,
    pub element_id: String,
    pub process_instance_key: Key,
    pub bpmn_process_id: String,
    /// JSON document with the variables a worker completes the job with.
    pub variables: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum RecordValue {
    Deployment(DeploymentRecord),
    Process(ProcessRecord),
    ProcessInstance(ProcessInstanceRecord),
    ProcessInstanceCreation(ProcessInstanceCreationRecord),
    Variable(VariableRecord),
    Job(JobRecord),
}

impl RecordValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            RecordValue::Deployment(_) => ValueType::Deployment,
            RecordValue::Process(_) => ValueType::Process,
            RecordValue::ProcessInstance(_) => ValueType::ProcessInstance,
            RecordValue::ProcessInstanceCreation(_) => ValueType::ProcessInstanceCreation,
            RecordValue::Variable(_) => ValueType::Variable,
            RecordValue::Job(_) => ValueType::Job,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct Record {
    /// Position inside the application entries; 0 for commands submitted through a session.
    pub position: RecordPosition,
    pub source: Option<SourceRef>,
    pub key: Option<Key>,
    pub record_type: RecordType,
    pub intent: Intent,
    pub request: Option<RequestRef>,
    pub value: RecordValue,
}

impl Record {
    /// A client command, not yet positioned.
    pub fn command(intent: Intent, value: RecordValue) -> Self {
        Self {
            position: 0,
            source: None,
            key: None,
            record_type: RecordType::Command,
            intent,
            request: None,
            value,
        }
    }

    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_request(mut self, request_id: u64, stream_id: u64) -> Self {
        self.request = Some(RequestRef {
            request_id,
            stream_id,
        });
        self
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }
}

/// Encodes records for the `data` of an application entry or a session command payload.
pub fn encode_records(records: &[Record]) -> Result<Vec<u8>, SchemaError> {
    let mut buf = RECORD_BATCH_VERSION.to_le_bytes().to_vec();
    let body = bincode::encode_to_vec(records, bincode::config::standard())
        .map_err(|e| SchemaError::Body(e.to_string()))?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn decode_records(data: &[u8]) -> Result<Vec<Record>, SchemaError> {
    if data.len() < 2 {
        return Err(SchemaError::Truncated {
            needed: 2,
            available: data.len(),
        });
    }
    let version = u16::from_le_bytes([data[0], data[1]]);
    if version == 0 || version > RECORD_BATCH_VERSION {
        return Err(SchemaError::UnsupportedVersion { kind: 0, version });
    }
    let body = &data[2..];
    let (records, read) =
        bincode::decode_from_slice::<Vec<Record>, _>(body, bincode::config::standard())
            .map_err(|e| SchemaError::Body(e.to_string()))?;
    if read != body.len() {
        return Err(SchemaError::LengthMismatch {
            declared: body.len(),
            actual: read,
        });
    }
    Ok(records)
}

/// Decodes the single command carried by a session command entry.
pub fn decode_command(operation: &[u8]) -> Result<Record, SchemaError> {
    let mut records = decode_records(operation)?;
    if records.len() != 1 {
        return Err(SchemaError::Body(format!(
            "expected exactly one command, found {}",
            records.len()
        )));
    }
    let record = records.remove(0);
    if !record.is_command() {
        return Err(SchemaError::Body(
            "session operation does not carry a command".to_string(),
        ));
    }
    Ok(record)
}
