//! The per-partition state machine.
//!
//! A [`StreamProcessor`] consumes committed entries strictly in index order. Raft-level
//! entries (sessions, terms, membership) are applied as they are. Application entries
//! carry records: events are applied, commands are processed by the registered handler
//! once the partition leads and the command has not left a trace in the log yet.

use std::collections::VecDeque;
use std::sync::Arc;

use bincode::{Decode, Encode};
use tracing::{debug, info, trace, warn};

use crate::entry::{ApplicationEntry, IndexedEntry, KeepAliveEntry, OperationEntry, RaftEntry};
use crate::error::{
    ErrorHandler, ErrorSeverity, PartitionErrorHandler, ProcessingError, ProcessingResult,
    StateError, StorageError,
};
use crate::log_stream::EntryAppender;
use crate::record::{
    Record, RejectionType, RequestRef, SourceRef, decode_command, decode_records, encode_records,
};
use crate::state::{ProcessingState, Session};
use crate::types::{LogIndex, PartitionId};

use super::appliers::EventAppliers;
use super::control::{CommandControl, ProcessingControl};
use super::registry::HandlerRegistry;
use super::response::{CommandResponse, Outcome, ResponseSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Applying what is already in the log; commands are only remembered.
    Replay,
    Processing,
    /// The log refused an append; commands queue up until [`StreamProcessor::resume`].
    Paused,
    /// A fatal error was seen; nothing is applied anymore.
    Failed,
}

/// A command read during replay or while paused that no record in the log has
/// answered yet.
#[derive(Debug, Clone, Encode, Decode)]
struct PendingCommand {
    source: SourceRef,
    command: Record,
}

/// Snapshot payload: the exported state and the commands still waiting for processing.
#[derive(Encode, Decode)]
struct ProcessorSnapshot {
    state: Vec<u8>,
    pending: Vec<PendingCommand>,
}

pub struct StreamProcessor {
    state: ProcessingState,
    appliers: EventAppliers,
    registry: Arc<HandlerRegistry>,
    appender: Arc<dyn EntryAppender>,
    responses: Option<ResponseSender>,
    phase: Phase,
    pending: VecDeque<PendingCommand>,
    errors: PartitionErrorHandler,
    failed_at: Option<LogIndex>,
}

impl StreamProcessor {
    pub fn new(
        partition_id: PartitionId,
        registry: Arc<HandlerRegistry>,
        appender: Arc<dyn EntryAppender>,
    ) -> Self {
        Self {
            state: ProcessingState::new(partition_id),
            appliers: EventAppliers::new(),
            registry,
            appender,
            responses: None,
            phase: Phase::Replay,
            pending: VecDeque::new(),
            errors: PartitionErrorHandler::new(partition_id),
            failed_at: None,
        }
    }

    pub fn with_responses(mut self, responses: ResponseSender) -> Self {
        self.responses = Some(responses);
        self
    }

    pub fn partition_id(&self) -> PartitionId {
        self.state.partition_id()
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn failure(&self) -> Option<&str> {
        self.errors.failure()
    }

    /// Commands remembered during replay or a pause that still wait for processing.
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    pub fn last_applied_index(&self) -> ProcessingResult<LogIndex> {
        Ok(self.state.last_applied_index()?)
    }

    /// Encodes the state together with the pending commands; they were read from entries
    /// the snapshot covers and would be lost otherwise.
    pub fn snapshot_data(&self) -> ProcessingResult<Vec<u8>> {
        let snapshot = ProcessorSnapshot {
            state: self.state.export()?,
            pending: self.pending.iter().cloned().collect(),
        };
        bincode::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| StateError::InvalidSnapshot(e.to_string()).into())
    }

    /// Replaces state and pending commands with a snapshot blob. Only valid before the
    /// first entry.
    pub fn restore(&mut self, data: &[u8]) -> ProcessingResult<()> {
        let (snapshot, _): (ProcessorSnapshot, usize) =
            bincode::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| StateError::InvalidSnapshot(e.to_string()))?;
        self.state.import(&snapshot.state)?;
        self.pending = snapshot.pending.into();
        info!(
            "Partition {} restored state at index {} with {} pending commands",
            self.partition_id(),
            self.state.last_applied_index()?,
            self.pending.len()
        );
        Ok(())
    }

    /// Leaves replay: commands remembered so far are processed first, in log order.
    pub async fn start_processing(&mut self) -> ProcessingResult<()> {
        if let Some(index) = self.failed_at {
            return Err(ProcessingError::Failed(index));
        }
        info!(
            "Partition {} switches to processing with {} pending commands",
            self.partition_id(),
            self.pending.len()
        );
        self.phase = Phase::Processing;
        self.drain_pending().await
    }

    /// Retries the queued commands of a paused processor. Stays paused while the log
    /// keeps refusing appends.
    pub async fn resume(&mut self) -> ProcessingResult<()> {
        if self.phase != Phase::Paused {
            return Ok(());
        }
        self.phase = Phase::Processing;
        self.drain_pending().await?;
        if self.phase == Phase::Processing {
            info!("Partition {} resumes processing", self.partition_id());
        }
        Ok(())
    }

    async fn drain_pending(&mut self) -> ProcessingResult<()> {
        while let Some(pending) = self.pending.pop_front() {
            if self.is_processed(pending.source)? {
                continue;
            }
            match self.process_command(pending.source, &pending.command).await {
                Ok(true) => {}
                Ok(false) => {
                    self.pending.push_front(pending);
                    self.phase = Phase::Paused;
                    return Ok(());
                }
                Err(e) => {
                    self.latch(pending.source.index, &e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Applies one committed entry. Entries at or below the last applied index are skipped.
    pub async fn apply(&mut self, entry: &IndexedEntry) -> ProcessingResult<()> {
        if let Some(index) = self.failed_at {
            return Err(ProcessingError::Failed(index));
        }
        match self.apply_entry(entry).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.latch(entry.index, &e);
                Err(e)
            }
        }
    }

    fn latch(&mut self, index: LogIndex, err: &ProcessingError) {
        if self.errors.handle(err, "apply entry") == ErrorSeverity::Fatal {
            self.phase = Phase::Failed;
            self.failed_at = Some(index);
        }
    }

    async fn apply_entry(&mut self, entry: &IndexedEntry) -> ProcessingResult<()> {
        let index = entry.index;
        if index <= self.state.last_applied_index()? {
            trace!("Entry {} already applied", index);
            return Ok(());
        }
        debug!(
            "Partition {} applies entry {} ({})",
            self.partition_id(),
            index,
            entry.entry.kind()
        );

        match entry.entry.as_ref() {
            RaftEntry::Initial(initial) => self.state.set_term(initial.term)?,
            RaftEntry::Initialize(initialize) => {
                self.state.set_term(initialize.term)?;
                self.state.reset_session_timers(initialize.timestamp)?;
            }
            RaftEntry::Configuration(configuration) => {
                self.state.set_members(&configuration.members)?;
                self.state.reset_session_timers(configuration.timestamp)?;
            }
            RaftEntry::OpenSession(open) => {
                self.state.put_session(&Session::open(index, open))?;
            }
            RaftEntry::KeepAlive(keep_alive) => self.apply_keep_alive(keep_alive)?,
            RaftEntry::CloseSession(close) => {
                self.state.remove_session(close.session_id);
                // nobody is left to answer
                let dropped = self.state.remove_pending_requests_of_stream(close.session_id)?;
                debug!(
                    "Closed session {} (expired: {}, delete: {}), dropped {} pending requests",
                    close.session_id, close.expired, close.delete, dropped
                );
            }
            RaftEntry::Query(_) => debug!("Query entry {} has no effect on state", index),
            RaftEntry::Command(operation) => self.apply_command(index, operation).await?,
            RaftEntry::Application(application) => {
                self.apply_application(index, application).await?
            }
        }
        self.state.set_last_applied_index(index)?;
        Ok(())
    }

    fn apply_keep_alive(&mut self, keep_alive: &KeepAliveEntry) -> ProcessingResult<()> {
        for (i, session_id) in keep_alive.session_ids.iter().enumerate() {
            let Some(mut session) = self.state.session(*session_id)? else {
                continue;
            };
            session.last_updated = keep_alive.timestamp;
            if let Some(sequence) = keep_alive.command_sequences.get(i) {
                session.acknowledged_sequence = *sequence;
            }
            if let Some(event_index) = keep_alive.event_indexes.get(i) {
                session.event_index = *event_index;
            }
            self.state.put_session(&session)?;
        }
        Ok(())
    }

    /// Session commands are taken strictly in sequence order per session.
    async fn apply_command(
        &mut self,
        index: LogIndex,
        operation: &OperationEntry,
    ) -> ProcessingResult<()> {
        let request = RequestRef {
            request_id: operation.sequence,
            stream_id: operation.session_id,
        };
        let Some(mut session) = self.state.session(operation.session_id)? else {
            self.reject(
                request,
                RejectionType::NotFound,
                format!("Expected session '{}' to be open, but it is not", operation.session_id),
            );
            return Ok(());
        };

        let expected = session.last_sequence + 1;
        if operation.sequence < expected {
            debug!(
                "Duplicate command {} of session {}",
                operation.sequence, operation.session_id
            );
            return Ok(());
        }
        if operation.sequence > expected {
            self.reject(
                request,
                RejectionType::InvalidArgument,
                format!(
                    "Expected command with sequence {} for session '{}', but got {}",
                    expected, operation.session_id, operation.sequence
                ),
            );
            return Ok(());
        }
        session.last_sequence = operation.sequence;
        self.state.put_session(&session)?;

        let mut command = match decode_command(&operation.operation) {
            Ok(command) => command,
            Err(e) => {
                self.reject(
                    request,
                    RejectionType::InvalidArgument,
                    format!("Expected a well-formed command, but {}", e),
                );
                return Ok(());
            }
        };
        command.position = 0;
        command.source = None;
        command.request = Some(request);
        self.dispatch(SourceRef::new(index, 0), command).await
    }

    async fn apply_application(
        &mut self,
        index: LogIndex,
        application: &ApplicationEntry,
    ) -> ProcessingResult<()> {
        let records = decode_records(&application.data)
            .map_err(|source| ProcessingError::Schema { index, source })?;
        for (offset, record) in records.into_iter().enumerate() {
            if let Some(source) = record.source {
                self.advance_cursor(source)?;
            }
            if record.is_event() {
                // the leader applied it while processing the command
                if record.position > self.state.last_applied_position()? {
                    self.appliers.apply_event(&mut self.state, &record)?;
                }
            } else {
                self.dispatch(SourceRef::new(index, offset as u32), record).await?;
            }
        }
        Ok(())
    }

    fn is_processed(&self, source: SourceRef) -> ProcessingResult<bool> {
        Ok(self
            .state
            .last_processed()?
            .is_some_and(|cursor| source <= cursor))
    }

    fn advance_cursor(&mut self, source: SourceRef) -> ProcessingResult<()> {
        if !self.is_processed(source)? {
            self.state.set_last_processed(source)?;
        }
        self.pending.retain(|pending| pending.source > source);
        Ok(())
    }

    async fn dispatch(&mut self, source: SourceRef, command: Record) -> ProcessingResult<()> {
        if self.is_processed(source)? {
            trace!("Command at {:?} already processed", source);
            return Ok(());
        }
        match self.phase {
            Phase::Replay | Phase::Paused => {
                self.pending.push_back(PendingCommand { source, command });
                Ok(())
            }
            Phase::Processing | Phase::Failed => {
                if !self.process_command(source, &command).await? {
                    self.pending.push_back(PendingCommand { source, command });
                    self.phase = Phase::Paused;
                }
                Ok(())
            }
        }
    }

    /// Runs the handler and writes its records. Returns `false` when the log refused the
    /// append; the attempt is undone and the command has to be retried.
    async fn process_command(
        &mut self,
        source: SourceRef,
        command: &Record,
    ) -> ProcessingResult<bool> {
        let handler = self.registry.get(command.value_type(), command.intent);
        self.state.begin();
        let mut control = ProcessingControl::new(
            &mut self.state,
            &self.appliers,
            source,
            command.request,
            self.appender.next_record_position(),
        );
        let handled = match &handler {
            Some(handler) => handler.on_command(command, &mut control),
            None => {
                control.reject(
                    RejectionType::InvalidArgument,
                    format!(
                        "Expected to process command {}.{}, but no handler is registered",
                        command.value_type(),
                        command.intent
                    ),
                );
                Ok(true)
            }
        };
        let result = control.finish();
        if let Err(e) = handled {
            self.state.rollback();
            return Err(e);
        }

        if result.records.is_empty() {
            // rejected or stale; nothing to write
            self.state.rollback();
            self.send(result.responses);
            return Ok(true);
        }

        let entry = match self
            .state
            .set_last_processed(source)
            .map_err(ProcessingError::from)
            .and_then(|()| self.application_entry(&result.records))
        {
            Ok(entry) => entry,
            Err(e) => {
                self.state.rollback();
                return Err(e);
            }
        };
        match self.appender.append(entry).await {
            Ok(index) => {
                self.state.commit();
                trace!(
                    "Command at {:?} produced {} records in entry {}",
                    source,
                    result.records.len(),
                    index
                );
                self.send(result.responses);
                Ok(true)
            }
            Err(e) if e.severity() == ErrorSeverity::Recoverable => {
                self.state.rollback();
                self.errors.handle(&e, "append follow-up records");
                Ok(false)
            }
            Err(e) => {
                self.state.rollback();
                Err(e.into())
            }
        }
    }

    fn application_entry(&self, records: &[Record]) -> ProcessingResult<RaftEntry> {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Err(ProcessingError::Handler {
                position: 0,
                reason: "empty record batch".to_string(),
            });
        };
        let data = encode_records(records).map_err(StorageError::from)?;
        Ok(RaftEntry::Application(ApplicationEntry {
            term: self.state.term()?,
            lowest_position: first.position,
            highest_position: last.position,
            data,
        }))
    }

    /// Rejections of session commands are only answered by the processing leader.
    fn reject(&self, request: RequestRef, rejection_type: RejectionType, reason: String) {
        if matches!(self.phase, Phase::Replay | Phase::Failed) {
            return;
        }
        warn!("Rejected request {:?}: {}", request, reason);
        self.send(vec![CommandResponse {
            partition_id: self.partition_id(),
            request,
            outcome: Outcome::rejected(rejection_type, reason),
        }]);
    }

    fn send(&self, responses: Vec<CommandResponse>) {
        let Some(sender) = &self.responses else {
            return;
        };
        for response in responses {
            // the client may be gone
            let _ = sender.send(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::entry::{
        CloseSessionEntry, ConfigurationEntry, InitializeEntry, OpenSessionEntry, ReadConsistency,
    };
    use crate::error::StorageResult;
    use crate::processing::response::{ResponseReceiver, response_channel};
    use crate::record::{
        DeploymentRecord, FlowNodeKind, Intent, ProcessInstanceCreationRecord, ProcessModel,
        ProcessRecord, RecordValue,
    };
    use crate::types::RecordPosition;

    /// Keeps appended entries in memory; fails the first `backpressure` appends.
    #[derive(Default)]
    struct MemoryAppender {
        entries: Mutex<Vec<RaftEntry>>,
        next_position: AtomicU64,
        backpressure: AtomicUsize,
    }

    #[async_trait]
    impl EntryAppender for MemoryAppender {
        async fn append(&self, entry: RaftEntry) -> StorageResult<LogIndex> {
            if self.backpressure.load(Ordering::SeqCst) > 0 {
                self.backpressure.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Backpressure { pending: 1, limit: 1 });
            }
            if let RaftEntry::Application(application) = &entry {
                self.next_position
                    .store(application.highest_position, Ordering::SeqCst);
            }
            let mut entries = self.entries.lock();
            entries.push(entry);
            Ok(100 + entries.len() as LogIndex)
        }

        fn next_record_position(&self) -> RecordPosition {
            self.next_position.load(Ordering::SeqCst) + 1
        }
    }

    fn processor(appender: Arc<MemoryAppender>) -> (StreamProcessor, ResponseReceiver) {
        let (tx, rx) = response_channel();
        let processor =
            StreamProcessor::new(1, HandlerRegistry::engine(), appender).with_responses(tx);
        (processor, rx)
    }

    fn open_session() -> RaftEntry {
        RaftEntry::OpenSession(OpenSessionEntry {
            term: 1,
            timestamp: 0,
            member_id: "client".into(),
            service_name: "engine".into(),
            service_type: "partition".into(),
            service_config: vec![],
            read_consistency: ReadConsistency::Linearizable,
            min_timeout: 0,
            max_timeout: 10_000,
        })
    }

    fn command_entry(session_id: u64, sequence: u64, command: Record) -> RaftEntry {
        RaftEntry::Command(OperationEntry {
            term: 1,
            timestamp: 0,
            session_id,
            sequence,
            operation: encode_records(&[command]).unwrap(),
        })
    }

    fn deploy_command(session_id: u64, sequence: u64, id: &str) -> RaftEntry {
        let model = ProcessModel::new(id)
            .with_node("start", FlowNodeKind::NoneStartEvent)
            .with_node("end", FlowNodeKind::EndEvent);
        let command = Record::command(
            Intent::Create,
            RecordValue::Deployment(DeploymentRecord {
                processes: vec![ProcessRecord {
                    key: 0,
                    bpmn_process_id: id.into(),
                    version: 0,
                    model,
                }],
            }),
        );
        command_entry(session_id, sequence, command)
    }

    async fn leader(appender: Arc<MemoryAppender>) -> (StreamProcessor, ResponseReceiver) {
        let (mut processor, rx) = processor(appender);
        let initialize = RaftEntry::Initialize(InitializeEntry {
            term: 1,
            timestamp: 0,
        });
        processor.apply(&IndexedEntry::new(1, initialize)).await.unwrap();
        processor.start_processing().await.unwrap();
        processor.apply(&IndexedEntry::new(2, open_session())).await.unwrap();
        (processor, rx)
    }

    #[tokio::test]
    async fn test_commands_follow_session_sequence() {
        let appender = Arc::new(MemoryAppender::default());
        let (mut processor, mut rx) = leader(appender.clone()).await;

        processor.apply(&IndexedEntry::new(3, deploy_command(2, 2, "a"))).await.unwrap();
        processor.apply(&IndexedEntry::new(4, deploy_command(2, 1, "b"))).await.unwrap();
        processor.apply(&IndexedEntry::new(5, deploy_command(2, 3, "c"))).await.unwrap();
        processor.apply(&IndexedEntry::new(6, deploy_command(2, 1, "b"))).await.unwrap();

        let mut responses = Vec::new();
        while let Ok(response) = rx.try_recv() {
            responses.push((response.request.request_id, response.outcome.is_accepted()));
        }
        // 2 and 3 arrive out of order, the repeated 1 is a duplicate
        assert_eq!(responses, vec![(2, false), (1, true), (3, false)]);
        assert_eq!(appender.entries.lock().len(), 1);
        assert_eq!(processor.state().latest_version("b").unwrap(), 1);
        assert_eq!(processor.state().latest_version("a").unwrap(), 0);
        assert_eq!(processor.state().session(2).unwrap().unwrap().last_sequence, 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let appender = Arc::new(MemoryAppender::default());
        let (mut processor, mut rx) = leader(appender).await;
        processor.apply(&IndexedEntry::new(3, deploy_command(99, 1, "a"))).await.unwrap();
        let response = rx.try_recv().unwrap();
        assert_eq!(
            response.outcome.rejection().unwrap().rejection_type,
            RejectionType::NotFound
        );
    }

    #[tokio::test]
    async fn test_backpressure_pauses_until_resumed() {
        let appender = Arc::new(MemoryAppender::default());
        let (mut processor, mut rx) = leader(appender.clone()).await;
        appender.backpressure.store(2, Ordering::SeqCst);

        processor.apply(&IndexedEntry::new(3, deploy_command(2, 1, "a"))).await.unwrap();
        assert_eq!(processor.phase(), Phase::Paused);
        assert_eq!(processor.pending_commands(), 1);
        assert_eq!(processor.state().latest_version("a").unwrap(), 0);
        assert!(rx.try_recv().is_err());

        // later commands queue up behind the refused one
        processor.apply(&IndexedEntry::new(4, deploy_command(2, 2, "b"))).await.unwrap();
        assert_eq!(processor.pending_commands(), 2);
        assert_eq!(processor.last_applied_index().unwrap(), 4);

        processor.resume().await.unwrap();
        assert_eq!(processor.phase(), Phase::Paused);
        assert_eq!(processor.pending_commands(), 2);

        processor.resume().await.unwrap();
        assert_eq!(processor.phase(), Phase::Processing);
        assert_eq!(processor.pending_commands(), 0);
        assert_eq!(appender.entries.lock().len(), 2);
        assert_eq!(processor.state().latest_version("a").unwrap(), 1);
        let answered: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|response| response.request.request_id)
            .collect();
        assert_eq!(answered, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_snapshot_keeps_pending_commands() {
        let appender = Arc::new(MemoryAppender::default());
        let (mut original, _) = processor(appender.clone());
        original.apply(&IndexedEntry::new(1, open_session())).await.unwrap();
        original.apply(&IndexedEntry::new(2, deploy_command(1, 1, "a"))).await.unwrap();
        assert_eq!(original.pending_commands(), 1);
        let data = original.snapshot_data().unwrap();

        let (mut restored, mut rx) = processor(appender.clone());
        restored.restore(&data).unwrap();
        assert_eq!(restored.last_applied_index().unwrap(), 2);
        assert_eq!(restored.pending_commands(), 1);
        assert_eq!(restored.state().export().unwrap(), original.state().export().unwrap());

        restored.start_processing().await.unwrap();
        assert!(rx.try_recv().unwrap().outcome.is_accepted());
        assert_eq!(restored.state().latest_version("a").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_and_new_terms_refresh_sessions() {
        let appender = Arc::new(MemoryAppender::default());
        let (mut processor, _rx) = leader(appender).await;

        let keep_alive = RaftEntry::KeepAlive(KeepAliveEntry {
            term: 1,
            timestamp: 5_000,
            session_ids: vec![2, 77],
            command_sequences: vec![7, 1],
            event_indexes: vec![9, 1],
        });
        processor.apply(&IndexedEntry::new(3, keep_alive)).await.unwrap();
        let session = processor.state().session(2).unwrap().unwrap();
        assert_eq!(session.last_updated, 5_000);
        assert_eq!(session.acknowledged_sequence, 7);
        assert_eq!(session.event_index, 9);
        assert!(processor.state().session(77).unwrap().is_none());
        assert_eq!(processor.state().expired_sessions(14_000).unwrap(), Vec::<u64>::new());
        assert_eq!(processor.state().expired_sessions(15_001).unwrap(), vec![2]);

        let initialize = RaftEntry::Initialize(InitializeEntry {
            term: 2,
            timestamp: 20_000,
        });
        processor.apply(&IndexedEntry::new(4, initialize)).await.unwrap();
        assert_eq!(processor.state().session(2).unwrap().unwrap().last_updated, 20_000);
        assert_eq!(processor.state().term().unwrap(), 2);

        let configuration = RaftEntry::Configuration(ConfigurationEntry {
            term: 2,
            timestamp: 30_000,
            members: vec![],
        });
        processor.apply(&IndexedEntry::new(5, configuration)).await.unwrap();
        assert_eq!(processor.state().session(2).unwrap().unwrap().last_updated, 30_000);
    }

    #[tokio::test]
    async fn test_close_session_drops_awaited_results() {
        let appender = Arc::new(MemoryAppender::default());
        let (mut processor, mut rx) = leader(appender.clone()).await;
        processor.apply(&IndexedEntry::new(3, deploy_command(2, 1, "a"))).await.unwrap();

        let create = Record::command(
            Intent::CreateWithAwaitingResult,
            RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
                bpmn_process_id: "a".into(),
                version: -1,
                ..Default::default()
            }),
        );
        processor.apply(&IndexedEntry::new(4, command_entry(2, 2, create))).await.unwrap();
        // only the deployment is answered; the creation waits for the instance to finish
        assert!(rx.try_recv().unwrap().outcome.is_accepted());
        assert!(rx.try_recv().is_err());

        let written = appender.entries.lock().last().cloned().unwrap();
        let RaftEntry::Application(application) = written else {
            panic!("expected an application entry");
        };
        let instance = decode_records(&application.data)
            .unwrap()
            .into_iter()
            .filter(|r| r.is_event())
            .find_map(|r| match r.value {
                RecordValue::ProcessInstanceCreation(creation) => {
                    Some(creation.process_instance_key)
                }
                _ => None,
            })
            .unwrap();
        assert!(processor.state().pending_request(instance).unwrap().is_some());

        let close = RaftEntry::CloseSession(CloseSessionEntry {
            term: 1,
            timestamp: 0,
            session_id: 2,
            expired: false,
            delete: false,
        });
        processor.apply(&IndexedEntry::new(5, close)).await.unwrap();
        assert!(processor.state().session(2).unwrap().is_none());
        assert!(processor.state().pending_request(instance).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_defers_commands() {
        let appender = Arc::new(MemoryAppender::default());
        let (mut processor, mut rx) = processor(appender.clone());
        processor.apply(&IndexedEntry::new(1, open_session())).await.unwrap();
        processor.apply(&IndexedEntry::new(2, deploy_command(1, 1, "a"))).await.unwrap();
        assert_eq!(processor.pending_commands(), 1);
        assert!(appender.entries.lock().is_empty());

        processor.start_processing().await.unwrap();
        assert_eq!(processor.pending_commands(), 0);
        assert_eq!(appender.entries.lock().len(), 1);
        assert!(rx.try_recv().unwrap().outcome.is_accepted());

        // reading the written entry back does not process the command again
        let written = appender.entries.lock()[0].clone();
        processor.apply(&IndexedEntry::new(3, written)).await.unwrap();
        assert_eq!(appender.entries.lock().len(), 1);
        assert_eq!(processor.last_applied_index().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_application_entry_fails_partition() {
        let appender = Arc::new(MemoryAppender::default());
        let (mut processor, _rx) = leader(appender).await;
        let corrupt = RaftEntry::Application(ApplicationEntry {
            term: 1,
            lowest_position: 1,
            highest_position: 1,
            data: vec![9, 9, 9],
        });
        let err = processor.apply(&IndexedEntry::new(3, corrupt)).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Schema { index: 3, .. }));
        assert_eq!(processor.phase(), Phase::Failed);
        assert!(processor.failure().is_some());

        let next = processor.apply(&IndexedEntry::new(4, open_session())).await;
        assert!(matches!(next, Err(ProcessingError::Failed(3))));
    }
}
