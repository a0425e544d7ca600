use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    assert_each_once, init_tracing, test_config, wait_until, MockNode, RecordingStore,
};
use anyhow::Result;
use blocktally::{
    DispatchState, Dispatcher, FatalErrorHandler, ProgressJournal, Telemetry, WorkerPool,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_delivers_each_height_once_within_pool_capacity() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let node = MockNode::with_tip(1_000);
    let store = RecordingStore::shared();
    let telemetry = Arc::new(Telemetry::default());
    let config = test_config(dir.path(), 2).build()?;

    let mut pool = WorkerPool::setup(
        &config,
        node.factory().as_ref(),
        store.clone(),
        "dispatch",
        telemetry.clone(),
    )?;
    let journals = pool.journal_paths().to_vec();

    let fatal = FatalErrorHandler::new(CancellationToken::new());
    let mut dispatcher = Dispatcher::new(&mut pool, &config, fatal, telemetry.clone());
    let states = dispatcher.state_watch();
    let summary = timeout(
        Duration::from_secs(10),
        dispatcher.run(Some(100), Some(103)),
    )
    .await??;

    assert_eq!(summary.first_height, 100);
    assert_eq!(summary.next_height, 104);
    assert_eq!(summary.dispatched, 4);
    assert_eq!(summary.tip_polls, 0);
    assert_eq!(*states.borrow(), DispatchState::Done);

    assert_each_once(&store.heights(), 100..=103);
    assert_each_once(&node.stats_calls(), 100..=103);

    assert_eq!(pool.busy_count(), 0);
    assert_eq!(pool.idle_count(), 2);
    assert_eq!(node.connections(), 2);

    let snapshot = telemetry.snapshot();
    assert!(snapshot.peak_busy_workers <= 2);
    assert_eq!(snapshot.busy_workers, 0);
    assert_eq!(snapshot.dispatched_heights, 4);
    assert_eq!(snapshot.completed_heights, 4);

    let recorded: Vec<u64> = journals
        .iter()
        .filter_map(|path| ProgressJournal::read_record(path).ok().flatten())
        .map(|record| record.height())
        .collect();
    assert_eq!(recorded.iter().max(), Some(&103));
    assert!(recorded.iter().all(|height| (100..=103).contains(height)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_worker_backfill_is_serial() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let node = MockNode::with_tip(500);
    let store = RecordingStore::shared();
    let telemetry = Arc::new(Telemetry::default());
    let config = test_config(dir.path(), 1).build()?;

    let mut pool = WorkerPool::setup(
        &config,
        node.factory().as_ref(),
        store.clone(),
        "serial",
        telemetry.clone(),
    )?;
    let fatal = FatalErrorHandler::new(CancellationToken::new());
    let summary = timeout(
        Duration::from_secs(10),
        Dispatcher::new(&mut pool, &config, fatal, telemetry.clone()).run(Some(0), Some(9)),
    )
    .await??;

    assert_eq!(summary.dispatched, 10);
    assert_each_once(&store.heights(), 0..=9);
    assert_eq!(telemetry.peak_busy_workers(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn throttles_near_tip_until_tip_moves_away() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let node = MockNode::with_tip(1_000);
    let store = RecordingStore::shared();
    let telemetry = Arc::new(Telemetry::default());
    let config = test_config(dir.path(), 2).tip_distance_threshold(6).build()?;

    let mut pool = WorkerPool::setup(
        &config,
        node.factory().as_ref(),
        store.clone(),
        "throttle",
        telemetry.clone(),
    )?;
    let fatal = FatalErrorHandler::new(CancellationToken::new());
    let mut dispatcher = Dispatcher::new(&mut pool, &config, fatal, telemetry.clone());
    let mut states = dispatcher.state_watch();

    let driver = async {
        timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == DispatchState::TipThrottle),
        )
        .await
        .expect("dispatcher should throttle at distance 5")
        .expect("state channel open");

        wait_until(|| node.head_calls() >= 3, Duration::from_secs(5), "tip polls")
            .await
            .expect("throttled dispatcher keeps polling the tip");
        assert!(
            store.heights().is_empty(),
            "no height may be assigned while throttled"
        );
        assert!(node.stats_calls().is_empty());

        node.set_tip(1_010);
    };

    let (summary, ()) = timeout(
        Duration::from_secs(10),
        async { tokio::join!(dispatcher.run(Some(995), Some(996)), driver) },
    )
    .await?;
    let summary = summary?;

    assert_eq!(summary.first_height, 995);
    assert_eq!(summary.dispatched, 2);
    assert!(summary.tip_polls >= 2);
    assert_eq!(summary.last_tip, 1_010);
    assert_each_once(&store.heights(), 995..=996);
    assert!(telemetry.snapshot().throttle_transitions >= 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unbounded_end_follows_the_tip() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let node = MockNode::with_tip(200);
    let store = RecordingStore::shared();
    let telemetry = Arc::new(Telemetry::default());
    let config = test_config(dir.path(), 3).tip_distance_threshold(6).build()?;

    let mut pool = WorkerPool::setup(
        &config,
        node.factory().as_ref(),
        store.clone(),
        "live",
        telemetry.clone(),
    )?;
    let fatal = FatalErrorHandler::new(CancellationToken::new());
    let mut dispatcher = Dispatcher::new(&mut pool, &config, fatal, telemetry.clone());
    let mut states = dispatcher.state_watch();

    let driver = async {
        states
            .wait_for(|state| *state == DispatchState::TipThrottle)
            .await
            .expect("starts throttled at tip - threshold");

        node.set_tip(210);
        wait_until(
            || store.heights().len() == 10,
            Duration::from_secs(5),
            "heights 194..=203",
        )
        .await
        .expect("dispatcher backfills up to the new throttle point");

        let polls = node.head_calls();
        wait_until(
            || node.head_calls() > polls + 2,
            Duration::from_secs(5),
            "throttled tip polls",
        )
        .await
        .expect("dispatcher throttles again near the new tip");
    };

    tokio::select! {
        result = dispatcher.run(None, None) => panic!("live dispatch must not finish: {result:?}"),
        _ = timeout(Duration::from_secs(10), driver) => {}
    }

    assert_each_once(&store.heights(), 194..=203);
    Ok(())
}
