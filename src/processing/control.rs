//! Handler-facing side of command processing.
//!
//! A handler never touches the log. It reads state, allocates keys and queues records
//! through a [`CommandControl`]; events are applied to state as soon as they are queued,
//! the stream processor writes the queued batch and sends the responses afterwards.

use tracing::trace;

use crate::error::ProcessingResult;
use crate::record::{Intent, Record, RecordType, RecordValue, RejectionType, RequestRef, SourceRef};
use crate::state::ProcessingState;
use crate::types::{Key, RecordPosition};

use super::appliers::EventAppliers;
use super::response::{CommandResponse, Outcome};

pub trait CommandControl {
    fn state(&self) -> &ProcessingState;

    fn next_key(&mut self) -> ProcessingResult<Key>;

    /// Writes an event and makes it the response to the command's request.
    fn accept(
        &mut self,
        key: Key,
        intent: Intent,
        value: RecordValue,
    ) -> ProcessingResult<RecordPosition>;

    fn append_event(
        &mut self,
        key: Key,
        intent: Intent,
        value: RecordValue,
    ) -> ProcessingResult<RecordPosition>;

    fn append_follow_up_command(
        &mut self,
        key: Key,
        intent: Intent,
        value: RecordValue,
    ) -> RecordPosition;

    /// Rejects the command. Nothing is written to the log.
    fn reject(&mut self, rejection_type: RejectionType, reason: String);

    /// Answers a request other than the one of the current command.
    fn respond_to(&mut self, request: RequestRef, outcome: Outcome);

    fn suppress_response(&mut self);
}

/// What a handler left behind once it returned.
pub struct ControlResult {
    pub records: Vec<Record>,
    pub responses: Vec<CommandResponse>,
}

/// The control handed to handlers by the stream processor.
pub struct ProcessingControl<'a> {
    state: &'a mut ProcessingState,
    appliers: &'a EventAppliers,
    source: SourceRef,
    request: Option<RequestRef>,
    next_position: RecordPosition,
    records: Vec<Record>,
    response: Option<Outcome>,
    deferred: Vec<(RequestRef, Outcome)>,
    suppressed: bool,
}

impl<'a> ProcessingControl<'a> {
    pub fn new(
        state: &'a mut ProcessingState,
        appliers: &'a EventAppliers,
        source: SourceRef,
        request: Option<RequestRef>,
        next_position: RecordPosition,
    ) -> Self {
        Self {
            state,
            appliers,
            source,
            request,
            next_position,
            records: Vec::new(),
            response: None,
            deferred: Vec::new(),
            suppressed: false,
        }
    }

    fn push(
        &mut self,
        key: Key,
        record_type: RecordType,
        intent: Intent,
        value: RecordValue,
    ) -> Record {
        let record = Record {
            position: self.next_position,
            source: Some(self.source),
            key: Some(key),
            record_type,
            intent,
            request: None,
            value,
        };
        self.next_position += 1;
        record
    }

    fn write_event(&mut self, record: Record) -> ProcessingResult<RecordPosition> {
        self.appliers.apply_event(self.state, &record)?;
        let position = record.position;
        trace!(
            "Queued event {}.{} at position {}",
            record.value_type(),
            record.intent,
            position
        );
        self.records.push(record);
        Ok(position)
    }

    /// Hands out the queued records and the responses to send once they are durable.
    pub fn finish(self) -> ControlResult {
        let partition_id = self.state.partition_id();
        let mut responses = Vec::with_capacity(self.deferred.len() + 1);
        let answer = (self.request, self.response, self.suppressed);
        if let (Some(request), Some(outcome), false) = answer {
            responses.push(CommandResponse {
                partition_id,
                request,
                outcome,
            });
        }
        responses.extend(self.deferred.into_iter().map(|(request, outcome)| CommandResponse {
            partition_id,
            request,
            outcome,
        }));
        ControlResult {
            records: self.records,
            responses,
        }
    }
}

impl CommandControl for ProcessingControl<'_> {
    fn state(&self) -> &ProcessingState {
        self.state
    }

    fn next_key(&mut self) -> ProcessingResult<Key> {
        Ok(self.state.next_key()?)
    }

    fn accept(
        &mut self,
        key: Key,
        intent: Intent,
        value: RecordValue,
    ) -> ProcessingResult<RecordPosition> {
        let mut record = self.push(key, RecordType::Event, intent, value);
        record.request = self.request;
        self.response = Some(Outcome::Accepted(record.clone()));
        self.write_event(record)
    }

    fn append_event(
        &mut self,
        key: Key,
        intent: Intent,
        value: RecordValue,
    ) -> ProcessingResult<RecordPosition> {
        let record = self.push(key, RecordType::Event, intent, value);
        self.write_event(record)
    }

    fn append_follow_up_command(
        &mut self,
        key: Key,
        intent: Intent,
        value: RecordValue,
    ) -> RecordPosition {
        let record = self.push(key, RecordType::Command, intent, value);
        let position = record.position;
        self.records.push(record);
        position
    }

    fn reject(&mut self, rejection_type: RejectionType, reason: String) {
        self.response = Some(Outcome::rejected(rejection_type, reason));
    }

    fn respond_to(&mut self, request: RequestRef, outcome: Outcome) {
        self.deferred.push((request, outcome));
    }

    fn suppress_response(&mut self) {
        self.suppressed = true;
    }
}
