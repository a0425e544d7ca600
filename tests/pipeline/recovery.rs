use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    assert_each_once, init_tracing, test_config, write_journal, MockNode, RecordingStore,
};
use anyhow::Result;
use blocktally::{
    FatalErrorHandler, ProgressJournal, RecoveryCoordinator, Scheduler, Telemetry, WorkerPool,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leftover_journals_are_replayed_then_dispatch_resumes() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let left_a = write_journal(dir.path(), "worker-crashed-0", "last_block_analyzed=50\n");
    let left_b = write_journal(dir.path(), "worker-crashed-1", "last_block_analyzed=52\n");
    let empty = write_journal(dir.path(), "worker-crashed-2", "");

    let node = MockNode::with_tip(1_000);
    let store = RecordingStore::shared();
    let config = test_config(dir.path(), 2)
        .recovery(true)
        .end_height(55)
        .build()?;

    let scheduler = Scheduler::new(config, node.factory(), store.clone());
    let report = timeout(Duration::from_secs(10), scheduler.run()).await??;

    let recovery = report.recovery.expect("recovery ran");
    let mut replayed = recovery.replayed.clone();
    replayed.sort_unstable();
    assert_eq!(replayed, vec![50, 52]);
    assert_eq!(recovery.resume_at, Some(53));
    assert_eq!(recovery.removed_empty, 1);

    assert_eq!(report.dispatch.first_height, 53);
    assert_eq!(report.dispatch.next_height, 56);
    assert_each_once(&store.heights(), [50, 52, 53, 54, 55]);
    assert_eq!(report.telemetry.recovered_heights, 2);

    assert!(!left_a.exists(), "replayed journal must be removed");
    assert!(!left_b.exists(), "replayed journal must be removed");
    assert!(!empty.exists(), "empty journal must be discarded");

    let fresh: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(fresh.len(), 2, "only the new run's journals remain: {fresh:?}");
    assert!(fresh
        .iter()
        .all(|name| name.starts_with(&format!("worker-{}-", report.run_tag))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_and_legacy_journals_each_get_a_task() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    write_journal(dir.path(), "worker-old-0", "Start=10\nLast=12\nEnd=20\n");
    write_journal(dir.path(), "worker-old-1", "last_block_analyzed=12\n");
    write_journal(dir.path(), "worker-old-2", "last_block_analyzed=7\n");

    let node = MockNode::with_tip(100);
    let store = RecordingStore::shared();
    let telemetry = Arc::new(Telemetry::default());
    let config = test_config(dir.path(), 2).recovery(true).build()?;

    let mut pool = WorkerPool::setup(
        &config,
        node.factory().as_ref(),
        store.clone(),
        "fresh",
        telemetry.clone(),
    )?;
    let own_journals = pool.journal_paths().to_vec();
    let fatal = FatalErrorHandler::new(CancellationToken::new());

    let outcome = timeout(
        Duration::from_secs(10),
        RecoveryCoordinator::new(&mut pool, &config, fatal, telemetry.clone()).run(),
    )
    .await??;

    assert_eq!(outcome.replayed, vec![12, 12, 7]);
    assert_eq!(outcome.resume_at, Some(13));
    assert_eq!(store.heights(), vec![7, 12, 12]);
    assert_eq!(pool.busy_count(), 0);

    for path in &own_journals {
        assert!(path.exists(), "the new pool's journals are kept");
    }
    let journaled: Vec<u64> = own_journals
        .iter()
        .filter_map(|path| ProgressJournal::read_record(path).ok().flatten())
        .map(|record| record.height())
        .collect();
    assert!(!journaled.is_empty());
    assert!(journaled.iter().all(|height| [7, 12].contains(height)));

    pool.shutdown_all().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_journal_replays_every_unflushed_height() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let batch_journal = write_journal(
        dir.path(),
        "worker-crashed-0",
        "last_block_analyzed=20\npending=21,23\n",
    );
    write_journal(dir.path(), "worker-crashed-1", "pending=22\n");

    let node = MockNode::with_tip(1_000);
    let store = RecordingStore::shared();
    let config = test_config(dir.path(), 2)
        .recovery(true)
        .end_height(25)
        .build()?;

    let report = timeout(
        Duration::from_secs(10),
        Scheduler::new(config, node.factory(), store.clone()).run(),
    )
    .await??;

    let recovery = report.recovery.expect("recovery ran");
    assert_eq!(recovery.replayed, vec![21, 23, 22]);
    assert_eq!(recovery.resume_at, Some(24));
    assert_each_once(&store.heights(), 21..=25);
    assert!(!batch_journal.exists(), "journal removed once all its heights ran");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovery_without_leftovers_falls_back_to_configured_start() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let node = MockNode::with_tip(100);
    let store = RecordingStore::shared();
    let config = test_config(dir.path(), 2)
        .recovery(true)
        .start_height(10)
        .end_height(12)
        .build()?;

    let report = timeout(
        Duration::from_secs(10),
        Scheduler::new(config, node.factory(), store.clone()).run(),
    )
    .await??;

    let recovery = report.recovery.expect("recovery ran");
    assert!(recovery.replayed.is_empty());
    assert_eq!(recovery.resume_at, None);
    assert_eq!(report.dispatch.first_height, 10);
    assert_each_once(&store.heights(), 10..=12);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_leftover_aborts_recovery() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    write_journal(dir.path(), "worker-old-0", "last_block_analyzed=twelve\n");

    let node = MockNode::with_tip(100);
    let store = RecordingStore::shared();
    let config = test_config(dir.path(), 1)
        .recovery(true)
        .end_height(20)
        .build()?;

    let err = timeout(
        Duration::from_secs(10),
        Scheduler::new(config, node.factory(), store.clone()).run(),
    )
    .await?
    .expect_err("malformed journal must be fatal");

    assert_eq!(err.kind(), blocktally::ErrorKind::Journal);
    assert!(store.heights().is_empty());
    Ok(())
}
