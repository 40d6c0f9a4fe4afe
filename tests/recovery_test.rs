use std::time::Duration;

use flowraft::entry::{OpenSessionEntry, OperationEntry, RaftEntry, ReadConsistency};
use flowraft::record::{Intent, RecordType, ValueType, encode_records};
use flowraft::{LocalLog, PartitionRole, SessionClient};
use tempfile::TempDir;

mod common;
use common::*;

async fn run_workload(partition: &mut TestPartition) {
    let client = SessionClient::open(partition.handle.clone(), "client", Duration::from_secs(60))
        .await
        .unwrap();
    client
        .send(deploy(vec![linear_process("p"), task_process("q")]))
        .await
        .unwrap();
    partition.next_response().await;
    for process in ["p", "q", "p"] {
        client.send(create(process, -1)).await.unwrap();
        assert!(partition.next_response().await.outcome.is_accepted());
    }
    partition.wait_idle().await;
}

#[tokio::test]
async fn test_follower_reaches_leader_state() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();

    let mut leader = TestPartition::start(options(leader_dir.path(), PartitionRole::Leader)).await;
    run_workload(&mut leader).await;
    let expected = leader.handle.state_digest().await.unwrap();
    let entries = leader.entries();
    leader.handle.shutdown().await.unwrap();

    let mut follower =
        TestPartition::start(options(follower_dir.path(), PartitionRole::Follower)).await;
    for entry in entries.iter().cloned() {
        follower.handle.log().writer().append(entry).await.unwrap();
    }
    follower.wait_applied(entries.len() as u64).await;

    assert_eq!(follower.handle.state_digest().await.unwrap(), expected);
    // replay never answers clients
    follower.assert_no_response(Duration::from_millis(100)).await;
    follower.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_from_snapshot() {
    let dir = TempDir::new().unwrap();

    let mut leader = TestPartition::start(options(dir.path(), PartitionRole::Leader)).await;
    run_workload(&mut leader).await;
    let snapshot_index = leader.handle.snapshot().await.unwrap();
    assert!(snapshot_index > 0);

    // entries after the snapshot have to be replayed on top of it
    let client = SessionClient::open(leader.handle.clone(), "late", Duration::from_secs(60))
        .await
        .unwrap();
    client.send(create("q", -1)).await.unwrap();
    leader.next_response().await;
    leader.wait_idle().await;
    let expected = leader.handle.state_digest().await.unwrap();
    leader.handle.shutdown().await.unwrap();

    let restarted = TestPartition::start(options(dir.path(), PartitionRole::Follower)).await;
    let health = restarted.handle.health().await.unwrap();
    assert!(health.last_applied_index > snapshot_index);
    assert_eq!(restarted.handle.state_digest().await.unwrap(), expected);
    restarted.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unprocessed_commands_run_once_after_restart() {
    let dir = TempDir::new().unwrap();
    let opts = options(dir.path(), PartitionRole::Leader);

    // commands that made it into the log before the leader could process them
    let log = LocalLog::open(opts.log.clone(), opts.writer.clone()).unwrap();
    let session = log
        .writer()
        .append(RaftEntry::OpenSession(OpenSessionEntry {
            term: 1,
            timestamp: flowraft::types::now_millis(),
            member_id: "client".into(),
            service_name: "flowraft".into(),
            service_type: "partition".into(),
            service_config: Vec::new(),
            read_consistency: ReadConsistency::Linearizable,
            min_timeout: 0,
            max_timeout: 60_000,
        }))
        .await
        .unwrap();
    let commands = [deploy(vec![linear_process("p")]), create("p", -1)];
    for (i, command) in commands.iter().enumerate() {
        log.writer()
            .append(RaftEntry::Command(OperationEntry {
                term: 1,
                timestamp: flowraft::types::now_millis(),
                session_id: session,
                sequence: i as u64 + 1,
                operation: encode_records(std::slice::from_ref(command)).unwrap(),
            }))
            .await
            .unwrap();
    }
    log.close().await.unwrap();

    let mut partition = TestPartition::start(opts.clone()).await;
    let first = partition.next_response().await;
    let second = partition.next_response().await;
    assert_eq!(first.request.request_id, 1);
    assert_eq!(second.request.request_id, 2);
    let (instance, _) = created_instance(&second);
    partition.wait_idle().await;
    partition.handle.shutdown().await.unwrap();

    let mut partition = TestPartition::start(opts).await;
    partition.wait_idle().await;
    partition.assert_no_response(Duration::from_millis(100)).await;
    let creations = partition
        .records()
        .into_iter()
        .filter(|r| {
            r.record_type == RecordType::Event
                && r.intent == Intent::Created
                && r.value_type() == ValueType::ProcessInstanceCreation
        })
        .count();
    assert_eq!(creations, 1);
    let completed = partition
        .records()
        .into_iter()
        .filter(|r| r.key == Some(instance) && r.intent == Intent::ElementCompleted)
        .count();
    assert_eq!(completed, 1);
    partition.handle.shutdown().await.unwrap();
}
