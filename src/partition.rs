//! Partition runtime.
//!
//! One [`Partition`] owns a log, a snapshot store and a [`StreamProcessor`] and runs them
//! on a single tokio task. Clients talk to it through a cloneable [`PartitionHandle`]:
//! session entries are appended straight to the log, everything that needs the state
//! (queries, snapshots, health) goes through the task's request channel.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::entry::{
    CloseSessionEntry, IndexedEntry, InitializeEntry, KeepAliveEntry, OpenSessionEntry,
    OperationEntry, RaftEntry, ReadConsistency,
};
use crate::error::{EngineError, ErrorHandler, ErrorSeverity, StorageError};
use crate::log_stream::{CommitFeed, LocalLog};
use crate::processing::{HandlerRegistry, Phase, ResponseSender, StreamProcessor};
use crate::record::{ProcessRecord, Record, encode_records};
use crate::state::{ElementInstance, Job, ProcessingState, StoredVariable};
use crate::storage::{
    FileSnapshotStorage, LogWriterOptions, SegmentStoreOptions, Snapshot, SnapshotStorage,
    SnapshotStorageOptions,
};
use crate::types::{Key, LogIndex, PartitionId, SessionId, Term, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionRole {
    /// Appends a new term on start and processes commands.
    Leader,
    /// Only applies what is committed.
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionOptions {
    pub partition_id: PartitionId,
    pub data_dir: PathBuf,
    pub role: PartitionRole,
    /// Applied entries between two snapshots; 0 disables periodic snapshots.
    pub snapshot_period: u64,
    /// Delay before a command refused by a full log is tried again.
    pub backpressure_retry: Duration,
    /// How often the leader looks for expired sessions.
    pub session_check_interval: Duration,
    pub log: SegmentStoreOptions,
    pub writer: LogWriterOptions,
    pub snapshot: SnapshotStorageOptions,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self::new(1, "./data")
    }
}

impl PartitionOptions {
    /// Log under `{data_dir}/partition-{id}/log`, snapshots under `{data_dir}`.
    pub fn new<P: Into<PathBuf>>(partition_id: PartitionId, data_dir: P) -> Self {
        let data_dir = data_dir.into();
        Self {
            partition_id,
            log: SegmentStoreOptions::with_dir(
                data_dir.join(format!("partition-{}", partition_id)).join("log"),
            ),
            writer: LogWriterOptions::default(),
            snapshot: SnapshotStorageOptions::with_base_dir(&data_dir),
            data_dir,
            role: PartitionRole::Leader,
            snapshot_period: 1000,
            backpressure_retry: Duration::from_millis(100),
            session_check_interval: Duration::from_secs(1),
        }
    }

    pub fn with_role(mut self, role: PartitionRole) -> Self {
        self.role = role;
        self
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| {
                EngineError::Config(format!("Invalid partition options in {:?}: {}", path, e))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    ElementInstance(Key),
    Variables(Key),
    Job(Key),
    /// `None` selects the latest version.
    Process {
        bpmn_process_id: String,
        version: Option<u32>,
    },
}

/// A read served from state once the partition has applied `min_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub min_index: LogIndex,
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResponse {
    ElementInstance(Option<ElementInstance>),
    Variables(Vec<(String, StoredVariable)>),
    Job(Option<Job>),
    Process(Option<ProcessRecord>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHealth {
    pub partition_id: PartitionId,
    pub role: PartitionRole,
    pub phase: Phase,
    pub last_applied_index: LogIndex,
    pub commit_index: LogIndex,
    pub failure: Option<String>,
}

impl PartitionHealth {
    pub fn is_healthy(&self) -> bool {
        self.failure.is_none()
    }
}

enum PartitionRequest {
    Query {
        request: QueryRequest,
        reply: oneshot::Sender<Result<QueryResponse, EngineError>>,
    },
    Health {
        reply: oneshot::Sender<PartitionHealth>,
    },
    StateDigest {
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<LogIndex, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Client side of a running partition.
#[derive(Clone)]
pub struct PartitionHandle {
    partition_id: PartitionId,
    role: PartitionRole,
    log: LocalLog,
    term: Arc<AtomicU64>,
    requests: mpsc::UnboundedSender<PartitionRequest>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PartitionHandle {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn log(&self) -> &LocalLog {
        &self.log
    }

    fn leader_term(&self) -> Result<Term, EngineError> {
        match self.role {
            PartitionRole::Leader => Ok(self.term.load(Ordering::Acquire)),
            PartitionRole::Follower => Err(EngineError::Unavailable(self.partition_id)),
        }
    }

    async fn append(&self, entry: RaftEntry) -> Result<LogIndex, EngineError> {
        Ok(self.log.writer().append(entry).await?)
    }

    /// Registers a session; its id is the index of the open entry.
    pub async fn open_session(
        &self,
        member_id: impl Into<String>,
        max_timeout: Duration,
    ) -> Result<SessionId, EngineError> {
        let entry = RaftEntry::OpenSession(OpenSessionEntry {
            term: self.leader_term()?,
            timestamp: now_millis(),
            member_id: member_id.into(),
            service_name: "flowraft".to_string(),
            service_type: "partition".to_string(),
            service_config: Vec::new(),
            read_consistency: ReadConsistency::Linearizable,
            min_timeout: 0,
            max_timeout: max_timeout.as_millis() as u64,
        });
        self.append(entry).await
    }

    /// Appends a client command; the answer arrives on the response channel.
    pub async fn submit(
        &self,
        session_id: SessionId,
        sequence: u64,
        command: Record,
    ) -> Result<LogIndex, EngineError> {
        let entry = RaftEntry::Command(OperationEntry {
            term: self.leader_term()?,
            timestamp: now_millis(),
            session_id,
            sequence,
            operation: encode_records(&[command])?,
        });
        self.append(entry).await
    }

    pub async fn keep_alive(
        &self,
        session_ids: Vec<SessionId>,
        command_sequences: Vec<u64>,
        event_indexes: Vec<u64>,
    ) -> Result<LogIndex, EngineError> {
        let entry = RaftEntry::KeepAlive(KeepAliveEntry {
            term: self.leader_term()?,
            timestamp: now_millis(),
            session_ids,
            command_sequences,
            event_indexes,
        });
        self.append(entry).await
    }

    pub async fn close_session(
        &self,
        session_id: SessionId,
        delete: bool,
    ) -> Result<LogIndex, EngineError> {
        let entry = RaftEntry::CloseSession(CloseSessionEntry {
            term: self.leader_term()?,
            timestamp: now_millis(),
            session_id,
            expired: false,
            delete,
        });
        self.append(entry).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PartitionRequest,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(build(reply))
            .map_err(|_| EngineError::Unavailable(self.partition_id))?;
        rx.await.map_err(|_| EngineError::Unavailable(self.partition_id))
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, EngineError> {
        self.request(|reply| PartitionRequest::Query { request, reply })
            .await?
    }

    pub async fn health(&self) -> Result<PartitionHealth, EngineError> {
        self.request(|reply| PartitionRequest::Health { reply }).await
    }

    /// Hex sha256 of the exported state.
    pub async fn state_digest(&self) -> Result<String, EngineError> {
        self.request(|reply| PartitionRequest::StateDigest { reply })
            .await?
    }

    /// Takes a snapshot now; returns the index it covers.
    pub async fn snapshot(&self) -> Result<LogIndex, EngineError> {
        self.request(|reply| PartitionRequest::Snapshot { reply })
            .await?
    }

    /// Stops the partition task and closes its log.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        // already stopped when the task is gone
        let _ = self.request(|reply| PartitionRequest::Shutdown { reply }).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Partition {} task failed: {}", self.partition_id, e);
            }
        }
        Ok(())
    }
}

/// Issues monotonically increasing sequences for one session.
pub struct SessionClient {
    handle: PartitionHandle,
    session_id: SessionId,
    sequence: AtomicU64,
}

impl SessionClient {
    pub async fn open(
        handle: PartitionHandle,
        member_id: impl Into<String>,
        max_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let session_id = handle.open_session(member_id, max_timeout).await?;
        Ok(Self {
            handle,
            session_id,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Submits `command` with the next sequence and returns that sequence, which is also
    /// the `request_id` of the response.
    pub async fn send(&self, command: Record) -> Result<u64, EngineError> {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.handle.submit(self.session_id, sequence, command).await?;
        Ok(sequence)
    }

    pub async fn close(self, delete: bool) -> Result<(), EngineError> {
        self.handle.close_session(self.session_id, delete).await?;
        Ok(())
    }
}

pub struct Partition {
    options: PartitionOptions,
    log: LocalLog,
    snapshots: FileSnapshotStorage,
    processor: StreamProcessor,
    next_index: LogIndex,
    applied_since_snapshot: u64,
    waiting_queries: Vec<(QueryRequest, oneshot::Sender<Result<QueryResponse, EngineError>>)>,
    closing_sessions: HashSet<SessionId>,
    requests: mpsc::UnboundedReceiver<PartitionRequest>,
}

impl Partition {
    /// Opens the log, restores the latest snapshot, replays the committed entries and
    /// spawns the partition task.
    pub async fn start(
        options: PartitionOptions,
        registry: Arc<HandlerRegistry>,
        responses: ResponseSender,
    ) -> Result<PartitionHandle, EngineError> {
        let partition_id = options.partition_id;
        info!("Starting partition {} as {:?}", partition_id, options.role);

        let log = LocalLog::open(options.log.clone(), options.writer.clone())?;
        let snapshots = FileSnapshotStorage::new(options.snapshot.clone())?;
        let mut processor = StreamProcessor::new(partition_id, registry, Arc::new(log.clone()))
            .with_responses(responses);

        if let Some(snapshot) = snapshots.load_snapshot(partition_id).await? {
            processor.restore(&snapshot.data)?;
        }
        let next_index = processor.last_applied_index()? + 1;
        if next_index < log.first_index() {
            return Err(StorageError::Compacted(next_index).into());
        }

        let term = Arc::new(AtomicU64::new(log.store().last_term()));
        if options.role == PartitionRole::Leader {
            let new_term = log.store().last_term() + 1;
            log.writer()
                .append(RaftEntry::Initialize(InitializeEntry {
                    term: new_term,
                    timestamp: now_millis(),
                }))
                .await?;
            term.store(new_term, Ordering::Release);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut partition = Partition {
            options,
            log: log.clone(),
            snapshots,
            processor,
            next_index,
            applied_since_snapshot: 0,
            waiting_queries: Vec::new(),
            closing_sessions: HashSet::new(),
            requests: rx,
        };
        partition.replay().await?;
        if partition.options.role == PartitionRole::Leader {
            partition.processor.start_processing().await?;
        }

        let role = partition.options.role;
        let task = tokio::spawn(partition.run());
        Ok(PartitionHandle {
            partition_id,
            role,
            log,
            term,
            requests: tx,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    async fn replay(&mut self) -> Result<(), EngineError> {
        let commit_index = self.log.commit_index();
        let from = self.next_index;
        while self.next_index <= commit_index {
            let entry = self.log.store().read(self.next_index)?;
            self.processor.apply(&entry).await?;
            self.next_index += 1;
        }
        info!(
            "Partition {} replayed entries {}..={}, {} commands pending",
            self.options.partition_id,
            from,
            commit_index,
            self.processor.pending_commands()
        );
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.options.role == PartitionRole::Leader
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.options.session_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut retry = tokio::time::interval(self.options.backpressure_retry);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut was_paused = false;
        loop {
            let phase = self.processor.phase();
            let applying = phase != Phase::Failed;
            let expiring = applying && self.is_leader();
            let paused = phase == Phase::Paused;
            if paused && !was_paused {
                retry.reset();
            }
            was_paused = paused;
            tokio::select! {
                biased;
                request = self.requests.recv() => {
                    match request {
                        Some(PartitionRequest::Shutdown { reply }) => {
                            self.close().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(request) => self.handle_request(request).await,
                        None => {
                            self.close().await;
                            break;
                        }
                    }
                }
                next = self.log.next_committed(self.next_index), if applying => {
                    match next {
                        Ok(Some(entry)) => self.on_entry(entry).await,
                        Ok(None) => {
                            info!("Log of partition {} closed", self.options.partition_id);
                            break;
                        }
                        Err(e) => {
                            warn!("Failed to read entry {}: {}", self.next_index, e);
                            tokio::time::sleep(self.options.backpressure_retry).await;
                        }
                    }
                }
                _ = ticker.tick(), if expiring => self.expire_sessions().await,
                _ = retry.tick(), if paused => self.retry_paused().await,
            }
        }
        info!("Partition {} stopped", self.options.partition_id);
    }

    async fn on_entry(&mut self, entry: IndexedEntry) {
        if let Err(e) = self.processor.apply(&entry).await {
            if self.processor.phase() != Phase::Failed {
                tokio::time::sleep(self.options.backpressure_retry).await;
            }
            debug!("Entry {} not applied: {}", entry.index, e);
            return;
        }
        self.next_index = entry.index + 1;
        self.applied_since_snapshot += 1;
        self.serve_waiting_queries();

        let period = self.options.snapshot_period;
        if period > 0 && self.applied_since_snapshot >= period {
            if let Err(e) = self.take_snapshot().await {
                warn!(
                    "Periodic snapshot of partition {} failed: {}",
                    self.options.partition_id, e
                );
            }
        }
    }

    /// Frees log space when it can and tries the refused command again.
    async fn retry_paused(&mut self) {
        if self.applied_index() > self.log.store().snapshot_index() {
            if let Err(e) = self.take_snapshot().await {
                warn!(
                    "Snapshot of paused partition {} failed: {}",
                    self.options.partition_id, e
                );
            }
        }
        if let Err(e) = self.processor.resume().await {
            error!("Partition {} failed to resume: {}", self.options.partition_id, e);
        }
    }

    async fn handle_request(&mut self, request: PartitionRequest) {
        match request {
            PartitionRequest::Query { request, reply } => {
                if self.applied_index() >= request.min_index {
                    let _ = reply.send(serve_query(self.processor.state(), &request.query));
                } else {
                    self.waiting_queries.push((request, reply));
                }
            }
            PartitionRequest::Health { reply } => {
                let _ = reply.send(PartitionHealth {
                    partition_id: self.options.partition_id,
                    role: self.options.role,
                    phase: self.processor.phase(),
                    last_applied_index: self.applied_index(),
                    commit_index: self.log.commit_index(),
                    failure: self.processor.failure().map(str::to_string),
                });
            }
            PartitionRequest::StateDigest { reply } => {
                let digest = self.processor.state().export().map(|data| {
                    let mut hasher = Sha256::new();
                    hasher.update(&data);
                    format!("{:x}", hasher.finalize())
                });
                let _ = reply.send(digest.map_err(EngineError::from));
            }
            PartitionRequest::Snapshot { reply } => {
                let _ = reply.send(self.take_snapshot().await);
            }
            PartitionRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn applied_index(&self) -> LogIndex {
        self.processor.last_applied_index().unwrap_or_default()
    }

    fn serve_waiting_queries(&mut self) {
        if self.waiting_queries.is_empty() {
            return;
        }
        let applied = self.applied_index();
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .waiting_queries
            .drain(..)
            .partition(|(request, _)| request.min_index <= applied);
        self.waiting_queries = waiting;
        for (request, reply) in ready {
            let _ = reply.send(serve_query(self.processor.state(), &request.query));
        }
    }

    async fn take_snapshot(&mut self) -> Result<LogIndex, EngineError> {
        let state = self.processor.state();
        let index = state.last_applied_index()?;
        let snapshot = Snapshot {
            index,
            term: state.term()?,
            data: self.processor.snapshot_data()?,
        };
        self.snapshots
            .save_snapshot(self.options.partition_id, snapshot)
            .await?;
        self.applied_since_snapshot = 0;

        self.log.store().set_snapshot_index(index);
        if let Err(e) = self.log.writer().compact(index).await {
            if e.severity() == ErrorSeverity::Fatal {
                return Err(e.into());
            }
            warn!("Compaction up to {} skipped: {}", index, e);
        }
        info!(
            "Partition {} snapshot at index {}",
            self.options.partition_id, index
        );
        Ok(index)
    }

    async fn expire_sessions(&mut self) {
        let expired = match self.processor.state().expired_sessions(now_millis()) {
            Ok(expired) => expired,
            Err(e) => {
                warn!("Failed to list expired sessions: {}", e);
                return;
            }
        };
        let state = self.processor.state();
        self.closing_sessions
            .retain(|id| matches!(state.session(*id), Ok(Some(_))));

        let term = self.log.store().last_term();
        for session_id in expired {
            if !self.closing_sessions.insert(session_id) {
                continue;
            }
            info!("Session {} expired", session_id);
            let entry = RaftEntry::CloseSession(CloseSessionEntry {
                term,
                timestamp: now_millis(),
                session_id,
                expired: true,
                delete: true,
            });
            if let Err(e) = self.log.writer().append(entry).await {
                warn!("Failed to close expired session {}: {}", session_id, e);
                self.closing_sessions.remove(&session_id);
            }
        }
    }

    async fn close(&mut self) {
        for (_, reply) in self.waiting_queries.drain(..) {
            let _ = reply.send(Err(EngineError::Unavailable(self.options.partition_id)));
        }
        if let Err(e) = self.log.close().await {
            debug!("Log of partition {} already closed: {}", self.options.partition_id, e);
        }
    }
}

fn serve_query(state: &ProcessingState, query: &Query) -> Result<QueryResponse, EngineError> {
    Ok(match query {
        Query::ElementInstance(key) => {
            QueryResponse::ElementInstance(state.element_instance(*key)?)
        }
        Query::Variables(scope_key) => {
            QueryResponse::Variables(state.variables_of(*scope_key)?.into_iter().collect())
        }
        Query::Job(key) => QueryResponse::Job(state.job(*key)?),
        Query::Process {
            bpmn_process_id,
            version: Some(version),
        } => QueryResponse::Process(state.process_by_id_and_version(bpmn_process_id, *version)?),
        Query::Process {
            bpmn_process_id,
            version: None,
        } => QueryResponse::Process(state.latest_process(bpmn_process_id)?),
    })
}

/// Runs several partitions side by side; they share nothing but the handler registry
/// and the response channel.
pub struct PartitionManager {
    registry: Arc<HandlerRegistry>,
    responses: ResponseSender,
    partitions: Mutex<HashMap<PartitionId, PartitionHandle>>,
}

impl PartitionManager {
    pub fn new(registry: Arc<HandlerRegistry>, responses: ResponseSender) -> Self {
        Self {
            registry,
            responses,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start_partition(
        &self,
        options: PartitionOptions,
    ) -> Result<PartitionHandle, EngineError> {
        let partition_id = options.partition_id;
        if self.partitions.lock().contains_key(&partition_id) {
            return Err(EngineError::Config(format!(
                "partition {} is already running",
                partition_id
            )));
        }
        let handle =
            Partition::start(options, self.registry.clone(), self.responses.clone()).await?;
        self.partitions.lock().insert(partition_id, handle.clone());
        Ok(handle)
    }

    pub fn partition(&self, partition_id: PartitionId) -> Result<PartitionHandle, EngineError> {
        self.partitions
            .lock()
            .get(&partition_id)
            .cloned()
            .ok_or(EngineError::PartitionNotFound(partition_id))
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn stop_partition(&self, partition_id: PartitionId) -> Result<(), EngineError> {
        let handle = self
            .partitions
            .lock()
            .remove(&partition_id)
            .ok_or(EngineError::PartitionNotFound(partition_id))?;
        handle.shutdown().await
    }

    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.partitions.lock().drain().map(|(_, h)| h).collect();
        let stops = handles.iter().map(|handle| handle.shutdown());
        for (handle, result) in handles.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!("Failed to stop partition {}: {}", handle.partition_id(), e);
            }
        }
    }
}
