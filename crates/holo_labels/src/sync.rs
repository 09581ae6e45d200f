//! Dense-block propagation of merges and splits.
//!
//! `LabelBlockSync` subscribes to a label volume's merge and split deltas and
//! rewrites the affected dense blocks. Each block task is routed to one of a
//! fixed set of serial workers by hashing its block coordinate, so every
//! read-modify-write against one block runs on one thread in arrival order
//! while different blocks proceed in parallel. No per-block locks are taken.
//!
//! Merge and split deltas arrive on one subscription queue drained by one
//! dispatcher, so block tasks reach the workers in publish order. Merge and
//! split tasks share the routing key, so a merge and a split touching the
//! same block apply in the order they were published.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use anyhow::Context;
use holo_rle::BlockCoord;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::barrier::CompletionBarrier;
use crate::config::SyncConfig;
use crate::dense::{decode_block, LabelBlock, LabelBlockStore};
use crate::dirty::DirtyTracker;
use crate::events::{Delta, DeltaSplit, EventKind, SyncBus, SyncMessage};
use crate::load::{SyncLoadSnapshot, SyncLoadTracker};
use crate::merge_cache::MergeCache;
use crate::store::InstanceVersion;
use crate::types::MergeOp;

pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Lifecycle of a sync engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Constructed, not yet subscribed.
    Idle,
    Running,
    /// Shutdown requested; workers are finishing queued block tasks.
    Draining,
    Closed,
}

enum BlockWork {
    Relabel(Arc<MergeOp>),
    Split(Arc<DeltaSplit>),
}

struct BlockTask {
    iv: InstanceVersion,
    coord: BlockCoord,
    work: BlockWork,
    // Released when the task finishes or is dropped unrun.
    _holds: Vec<CompletionBarrier>,
}

/// State shared by the dispatcher and the workers.
struct SyncShared {
    instance: String,
    blocks: LabelBlockStore,
    dirty: Arc<DirtyTracker>,
    merge_cache: Arc<MergeCache>,
    load: SyncLoadTracker,
}

struct WorkerPool {
    senders: Vec<mpsc::Sender<BlockTask>>,
    load: SyncLoadTracker,
}

impl WorkerPool {
    fn worker_for(&self, coord: BlockCoord) -> usize {
        worker_index(coord, self.senders.len())
    }

    async fn dispatch(&self, task: BlockTask) {
        let worker = self.worker_for(task.coord);
        self.load.record_dispatched(worker);
        let coord = task.coord;
        if self.senders[worker].send(task).await.is_err() {
            self.load.record_completed(worker);
            warn!(worker, %coord, "label sync worker gone; block task dropped");
        }
    }
}

fn worker_index(coord: BlockCoord, workers: usize) -> usize {
    (hash_key(&coord.to_key()) as usize) % workers.max(1)
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    workers: Vec<thread::JoinHandle<()>>,
}

struct SyncInner {
    state: SyncState,
    running: Option<Running>,
}

pub struct LabelBlockSync {
    shared: Arc<SyncShared>,
    config: SyncConfig,
    inner: Mutex<SyncInner>,
}

impl LabelBlockSync {
    pub fn new(
        instance: impl Into<String>,
        blocks: LabelBlockStore,
        dirty: Arc<DirtyTracker>,
        merge_cache: Arc<MergeCache>,
        config: SyncConfig,
    ) -> Self {
        let config = config.normalized();
        Self {
            shared: Arc::new(SyncShared {
                instance: instance.into(),
                blocks,
                dirty,
                merge_cache,
                load: SyncLoadTracker::new(config.workers),
            }),
            config,
            inner: Mutex::new(SyncInner {
                state: SyncState::Idle,
                running: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.lock().state
    }

    pub fn load(&self) -> SyncLoadSnapshot {
        self.shared.load.snapshot()
    }

    /// Worker that owns `coord`.
    pub fn worker_for(&self, coord: BlockCoord) -> usize {
        worker_index(coord, self.config.workers)
    }

    /// Subscribe to `bus` and start the worker pool. Must be called from
    /// within a tokio runtime.
    pub fn init_sync(&self, bus: &SyncBus) -> anyhow::Result<()> {
        let mut inner = self.lock();
        anyhow::ensure!(
            inner.state == SyncState::Idle,
            "label sync for {} already started ({:?})",
            self.shared.instance,
            inner.state
        );
        let runtime = tokio::runtime::Handle::try_current()
            .context("label sync requires a tokio runtime")?;

        let mut senders = Vec::with_capacity(self.config.workers);
        let mut workers = Vec::with_capacity(self.config.workers);
        for index in 0..self.config.workers {
            let (tx, rx) = mpsc::channel(self.config.worker_queue);
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("label-sync-{index}"))
                .spawn(move || worker_loop(index, shared, rx))
                .context("spawn label sync worker")?;
            senders.push(tx);
            workers.push(handle);
        }
        let pool = Arc::new(WorkerPool {
            senders,
            load: self.shared.load.clone(),
        });

        let instance = &self.shared.instance;
        let rx = bus.subscribe_all(
            instance,
            &[
                EventKind::MergeStart,
                EventKind::MergeBlock,
                EventKind::SplitStart,
                EventKind::SplitLabel,
            ],
            self.config.merge_queue.saturating_add(self.config.split_queue),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = runtime.spawn(dispatch_loop(self.shared.clone(), pool, rx, shutdown_rx));

        inner.state = SyncState::Running;
        inner.running = Some(Running {
            shutdown_tx,
            dispatcher,
            workers,
        });
        info!(
            instance = %self.shared.instance,
            workers = self.config.workers,
            "label block sync running"
        );
        Ok(())
    }

    /// Stop accepting deltas and wait for queued block tasks to finish.
    ///
    /// Deltas still waiting in the subscription queue are discarded.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let running = {
            let mut inner = self.lock();
            match inner.state {
                SyncState::Running => {
                    inner.state = SyncState::Draining;
                    inner.running.take()
                }
                SyncState::Idle => {
                    inner.state = SyncState::Closed;
                    None
                }
                SyncState::Draining | SyncState::Closed => None,
            }
        };
        let Some(running) = running else {
            return Ok(());
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(err) = running.dispatcher.await {
            warn!(error = ?err, "label sync dispatcher failed");
        }
        // The dispatcher held the last worker senders; workers now drain and exit.
        let workers = running.workers;
        tokio::task::spawn_blocking(move || {
            for worker in workers {
                if worker.join().is_err() {
                    error!("label sync worker panicked");
                }
            }
        })
        .await
        .context("join label sync workers")?;

        self.lock().state = SyncState::Closed;
        info!(instance = %self.shared.instance, "label block sync closed");
        Ok(())
    }
}

impl Drop for LabelBlockSync {
    fn drop(&mut self) {
        if let Some(running) = self.lock().running.as_ref() {
            let _ = running.shutdown_tx.send(true);
        }
    }
}

async fn dispatch_loop(
    shared: Arc<SyncShared>,
    pool: Arc<WorkerPool>,
    mut rx: mpsc::Receiver<SyncMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                shared.handle(&pool, msg).await;
            }
        }
    }
    debug!(instance = %shared.instance, "label sync dispatcher exiting");
}

impl SyncShared {
    async fn handle(&self, pool: &WorkerPool, msg: SyncMessage) {
        let iv = msg.ctx(&self.instance);
        match msg.delta {
            Delta::MergeStart { op, done } => {
                self.merge_cache.add(&iv, (*op).clone());
                let cache = self.merge_cache.clone();
                done.on_complete(move || {
                    cache.remove(&iv, &op);
                });
            }
            Delta::MergeBlock(merge) => {
                debug!(%iv, op = %merge.op, blocks = merge.blocks.len(), "dispatching merge");
                for coord in merge.blocks.iter() {
                    pool.dispatch(BlockTask {
                        iv: iv.clone(),
                        coord: *coord,
                        work: BlockWork::Relabel(merge.op.clone()),
                        _holds: vec![merge.done.clone()],
                    })
                    .await;
                }
            }
            Delta::SplitStart { old, done, .. } => {
                self.dirty.incr(&iv, old);
                let dirty = self.dirty.clone();
                done.on_complete(move || {
                    // Logged by `decr`.
                    let _ = dirty.decr(&iv, old);
                });
            }
            Delta::SplitLabel { split, done } => {
                let started = Instant::now();
                self.dirty.incr(&iv, split.old);
                let applying = {
                    let dirty = self.dirty.clone();
                    let iv = iv.clone();
                    let (old, new) = (split.old, split.new);
                    CompletionBarrier::new(move || {
                        let _ = dirty.decr(&iv, old);
                        debug!(
                            %iv,
                            old,
                            new,
                            elapsed_us = started.elapsed().as_micros() as u64,
                            "split applied to dense blocks"
                        );
                    })
                };
                for coord in &split.sorted_blocks {
                    pool.dispatch(BlockTask {
                        iv: iv.clone(),
                        coord: *coord,
                        work: BlockWork::Split(split.clone()),
                        _holds: vec![applying.clone(), done.clone()],
                    })
                    .await;
                }
            }
            other => debug!(kind = ?other.kind(), "label sync ignoring delta"),
        }
    }

    fn load_block(&self, iv: &InstanceVersion, coord: BlockCoord) -> Option<LabelBlock> {
        let bytes = match self.blocks.get_raw(iv, coord) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(%iv, %coord, error = ?err, "dense block read failed; block skipped");
                return None;
            }
        };
        match decode_block(&bytes, self.blocks.config().block_size) {
            Ok(block) => Some(block),
            Err(err) => {
                error!(
                    invariant = true,
                    %iv,
                    %coord,
                    error = ?err,
                    "corrupt dense block; block skipped"
                );
                None
            }
        }
    }

    fn store_block(&self, iv: &InstanceVersion, coord: BlockCoord, block: &LabelBlock) {
        if let Err(err) = self.blocks.put_block(iv, coord, block) {
            warn!(%iv, %coord, error = ?err, "dense block write failed; block skipped");
        }
    }

    fn run(&self, task: &BlockTask) {
        let (iv, coord) = (&task.iv, task.coord);
        match &task.work {
            BlockWork::Relabel(op) => {
                let Some(mut block) = self.load_block(iv, coord) else {
                    debug!(%iv, %coord, "no dense block to relabel");
                    return;
                };
                if block.relabel(&op.merged, op.target) > 0 {
                    self.store_block(iv, coord, &block);
                }
            }
            BlockWork::Split(split) => {
                let Some(spans) = split.split.get(&coord) else {
                    return;
                };
                let Some(mut block) = self.load_block(iv, coord) else {
                    warn!(%iv, %coord, old = split.old, "split touches a missing dense block");
                    return;
                };
                match block.write_spans(coord, spans, split.new) {
                    Ok(_) => self.store_block(iv, coord, &block),
                    Err(err) => {
                        error!(
                            invariant = true,
                            %iv,
                            %coord,
                            error = ?err,
                            "split spans outside dense block"
                        );
                    }
                }
            }
        }
    }
}

fn worker_loop(index: usize, shared: Arc<SyncShared>, mut rx: mpsc::Receiver<BlockTask>) {
    while let Some(task) = rx.blocking_recv() {
        shared.run(&task);
        drop(task);
        shared.load.record_completed(index);
    }
    debug!(worker = index, "label sync worker exiting");
}
