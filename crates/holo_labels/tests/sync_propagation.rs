//! Dense-block propagation: per-block ordering, dirty visibility and the
//! sync engine lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    assert_consistent, assert_dense, dense_label, fjall_engine, memory_engine, seed, volume,
    SlowKv, INSTANCE, QUIESCE_TIMEOUT,
};
use holo_labels::{EventKind, LabelEngine, MergeOp, SyncConfig, SyncEvent, SyncState};
use holo_rle::{encode_sparsevol, RunLengthSet, Span};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn merge_chain_on_one_block_applies_in_order() {
    let engine = memory_engine(32, 8);
    let iv = engine.labels.ctx(1);
    seed(&engine, &iv, 1, &[Span::new(0, 0, 0, 4)]);
    seed(&engine, &iv, 2, &[Span::new(4, 0, 0, 4), Span::new(40, 0, 0, 4)]);
    seed(&engine, &iv, 3, &[Span::new(8, 0, 0, 4)]);
    seed(&engine, &iv, 4, &[Span::new(12, 0, 0, 4)]);
    engine.start().expect("start");

    // No waiting in between: 1 -> 4 must see the relabels of 2 and 3 first.
    for (target, merged) in [(1, 2), (1, 3), (4, 1)] {
        engine
            .labels
            .merge_labels(1, MergeOp::new(target, [merged]).expect("op"))
            .await
            .expect("merge");
    }
    engine.quiesce(QUIESCE_TIMEOUT).await.expect("quiesce");

    assert_eq!(engine.labels.label_size(&iv, 4).expect("size"), 20);
    for label in [1, 2, 3] {
        assert!(engine.labels.get_label_rles(&iv, label).expect("rles").is_empty());
    }
    assert_dense(
        &engine,
        &iv,
        &[Span::new(0, 0, 0, 16), Span::new(40, 0, 0, 4)],
        4,
    );
    assert_consistent(&engine, &iv, &[1, 2, 3, 4]);
    engine.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn merge_and_split_on_one_block_reach_one_serial_result() {
    let engine = memory_engine(32, 8);
    let iv = engine.labels.ctx(1);
    seed(&engine, &iv, 1, &[Span::new(0, 0, 0, 10)]);
    seed(&engine, &iv, 2, &[Span::new(10, 0, 0, 10)]);
    engine.start().expect("start");

    engine
        .labels
        .merge_labels(1, MergeOp::new(1, [2]).expect("op"))
        .await
        .expect("merge");
    let payload = encode_sparsevol(&RunLengthSet::from_spans([Span::new(0, 0, 0, 5)]));
    let new = engine
        .labels
        .split_labels(1, 1, payload.as_slice())
        .await
        .expect("split");
    engine.quiesce(QUIESCE_TIMEOUT).await.expect("quiesce");

    assert_eq!(new, 3);
    assert_dense(&engine, &iv, &[Span::new(0, 0, 0, 5)], new);
    assert_dense(&engine, &iv, &[Span::new(5, 0, 0, 15)], 1);
    assert_eq!(dense_label(&engine, &iv, 20, 0, 0), Some(0));
    assert_consistent(&engine, &iv, &[1, 2, new]);
    engine.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_then_merge_of_new_label_applies_in_order_behind_busy_worker() {
    let sync = SyncConfig {
        workers: 1,
        worker_queue: 1,
        ..SyncConfig::default()
    };
    let kv = Arc::new(SlowKv::new(Duration::from_millis(30)));
    let engine = LabelEngine::open(INSTANCE, kv, volume(8), sync).expect("open");
    let iv = engine.labels.ctx(1);
    seed(&engine, &iv, 1, &[Span::new(0, 0, 0, 80)]);
    seed(&engine, &iv, 7, &[Span::new(200, 0, 0, 2)]);
    seed(&engine, &iv, 5, &[Span::new(204, 0, 0, 4)]);
    engine.start().expect("start");

    // Ten block tasks keep the only worker busy while the next operations
    // queue up behind them.
    let whole = encode_sparsevol(&RunLengthSet::from_spans([Span::new(0, 0, 0, 80)]));
    let first = engine
        .labels
        .split_labels(1, 1, whole.as_slice())
        .await
        .expect("split 1");
    let cut = encode_sparsevol(&RunLengthSet::from_spans([Span::new(200, 0, 0, 2)]));
    let second = engine
        .labels
        .split_labels(1, 7, cut.as_slice())
        .await
        .expect("split 7");
    engine
        .labels
        .merge_labels(1, MergeOp::new(5, [second]).expect("op"))
        .await
        .expect("merge");
    engine.quiesce(QUIESCE_TIMEOUT).await.expect("quiesce");

    assert_eq!((first, second), (8, 9));
    assert_eq!(engine.labels.label_size(&iv, 5).expect("size"), 6);
    assert_eq!(engine.labels.label_size(&iv, first).expect("size"), 80);
    assert_dense(&engine, &iv, &[Span::new(0, 0, 0, 80)], first);
    assert_dense(
        &engine,
        &iv,
        &[Span::new(200, 0, 0, 2), Span::new(204, 0, 0, 4)],
        5,
    );
    assert_eq!(dense_label(&engine, &iv, 202, 0, 0), Some(0));
    assert_consistent(&engine, &iv, &[1, 5, 7, first, second]);
    engine.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn labels_stay_dirty_while_deltas_are_pending() {
    let engine = memory_engine(32, 2);
    let iv = engine.labels.ctx(1);
    seed(&engine, &iv, 5, &[Span::new(0, 0, 0, 10)]);
    seed(&engine, &iv, 7, &[Span::new(10, 0, 0, 5)]);
    // Stands in for a slow consumer; the sync engine is not started.
    let rx = engine.bus.subscribe_all(
        INSTANCE,
        &[EventKind::MergeStart, EventKind::MergeBlock],
        8,
    );

    engine
        .labels
        .merge_labels(1, MergeOp::new(5, [7]).expect("op"))
        .await
        .expect("merge");

    assert_eq!(engine.dirty.dirty_labels(&iv), vec![5, 7]);
    assert!(engine.quiesce(Duration::from_millis(20)).await.is_err());
    assert_eq!(engine.labels.label_size(&iv, 5).expect("size"), 15);

    drop(rx);
    assert!(engine.dirty.is_empty());
    engine.quiesce(QUIESCE_TIMEOUT).await.expect("quiesce");
}

#[tokio::test]
async fn merge_cache_translates_until_relabel_finishes() {
    let engine = memory_engine(32, 2);
    let iv = engine.labels.ctx(1);
    seed(&engine, &iv, 5, &[Span::new(0, 0, 0, 10)]);
    seed(&engine, &iv, 7, &[Span::new(10, 0, 0, 5)]);
    let mut held = engine.bus.subscribe_all(INSTANCE, &[EventKind::MergeBlock], 4);
    engine.start().expect("start");

    engine
        .labels
        .merge_labels(1, MergeOp::new(5, [7]).expect("op"))
        .await
        .expect("merge");

    // The held MergeBlock delta keeps the merge in flight.
    let deadline = tokio::time::Instant::now() + QUIESCE_TIMEOUT;
    while engine.merge_cache.pending(&iv) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "merge never cached");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(engine.merge_cache.translate(&iv, 7), 5);

    let msg = held.recv().await.expect("held delta");
    drop(msg);
    engine.quiesce(QUIESCE_TIMEOUT).await.expect("quiesce");
    let deadline = tokio::time::Instant::now() + QUIESCE_TIMEOUT;
    while !engine.merge_cache.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "merge never evicted");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(engine.merge_cache.translate(&iv, 7), 7);
    engine.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn sync_lifecycle_states() {
    let engine = memory_engine(32, 2);
    assert_eq!(engine.sync.state(), SyncState::Idle);
    engine.start().expect("start");
    assert_eq!(engine.sync.state(), SyncState::Running);
    assert!(engine.start().is_err());
    let merge_block = SyncEvent::new(INSTANCE, EventKind::MergeBlock);
    assert_eq!(engine.bus.subscriber_count(&merge_block), 1);

    engine.shutdown().await.expect("shutdown");
    assert_eq!(engine.sync.state(), SyncState::Closed);
    engine.shutdown().await.expect("second shutdown");
    assert_eq!(engine.sync.state(), SyncState::Closed);
    assert!(engine.start().is_err());

    let idle = memory_engine(32, 2);
    idle.shutdown().await.expect("shutdown idle");
    assert_eq!(idle.sync.state(), SyncState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_finishes_dispatched_block_tasks() {
    let engine = memory_engine(8, 3);
    let iv = engine.labels.ctx(1);
    for label in 1..=6u64 {
        let y = label as i32;
        seed(&engine, &iv, label, &[Span::new(0, y, 0, 30)]);
    }
    engine.start().expect("start");

    for merged in 2..=6u64 {
        engine
            .labels
            .merge_labels(1, MergeOp::new(1, [merged]).expect("op"))
            .await
            .expect("merge");
    }
    engine.shutdown().await.expect("shutdown");

    assert_eq!(engine.sync.state(), SyncState::Closed);
    let load = engine.sync.load();
    assert_eq!(load.in_flight(), 0);
    assert_eq!(load.dispatched, load.completed);
    assert!(engine.dirty.is_empty());
    assert!(engine.merge_cache.is_empty());
    assert_eq!(engine.labels.label_size(&iv, 1).expect("size"), 180);
}

#[tokio::test]
async fn fjall_volume_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = encode_sparsevol(&RunLengthSet::from_spans([Span::new(0, 0, 0, 3)]));
    let new = {
        let (keyspace, engine) = fjall_engine(dir.path(), 16, 2);
        let iv = engine.labels.ctx(1);
        seed(&engine, &iv, 5, &[Span::new(0, 0, 0, 10)]);
        seed(&engine, &iv, 7, &[Span::new(10, 0, 0, 10)]);
        engine.start().expect("start");

        engine
            .labels
            .merge_labels(1, MergeOp::new(5, [7]).expect("op"))
            .await
            .expect("merge");
        let new = engine
            .labels
            .split_labels(1, 5, payload.as_slice())
            .await
            .expect("split");
        engine.quiesce(QUIESCE_TIMEOUT).await.expect("quiesce");
        engine.shutdown().await.expect("shutdown");
        keyspace
            .persist(fjall::PersistMode::SyncAll)
            .expect("persist");
        new
    };

    let (_keyspace, engine) = fjall_engine(dir.path(), 16, 2);
    let iv = engine.labels.ctx(1);
    assert_eq!(engine.labels.label_size(&iv, 5).expect("size"), 17);
    assert_eq!(engine.labels.label_size(&iv, new).expect("size"), 3);
    assert_eq!(engine.labels.label_size(&iv, 7).expect("size"), 0);
    assert!(engine.labels.new_label(&iv).expect("label") > new);
    assert_dense(&engine, &iv, &[Span::new(0, 0, 0, 3)], new);
    assert_dense(&engine, &iv, &[Span::new(3, 0, 0, 17)], 5);
    assert_consistent(&engine, &iv, &[5, 7, new]);
}
