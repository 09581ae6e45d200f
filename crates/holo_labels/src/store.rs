//! Ordered key-value storage used by the sparse and dense label stores.
//!
//! Keys are scoped by an `InstanceVersion` prefix so several data instances
//! and versions can share one partition. Engines only need point reads,
//! inclusive range scans and one atomic multi-key commit.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions};

/// Version identifier within a data instance.
pub type VersionId = u32;

/// One data instance at one version. Used both as the key scope for storage
/// and as the scope of dirty-label bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceVersion {
    pub instance: String,
    pub version: VersionId,
}

impl InstanceVersion {
    pub fn new(instance: impl Into<String>, version: VersionId) -> Self {
        Self {
            instance: instance.into(),
            version,
        }
    }

    /// Length-prefixed instance name followed by the big-endian version.
    pub fn key_prefix(&self) -> Vec<u8> {
        let name = self.instance.as_bytes();
        let mut out = Vec::with_capacity(4 + name.len() + 4);
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.version.to_be_bytes());
        out
    }

    /// Full storage key for `suffix` within this scope.
    pub fn key(&self, suffix: &[u8]) -> Vec<u8> {
        let mut out = self.key_prefix();
        out.extend_from_slice(suffix);
        out
    }
}

impl fmt::Display for InstanceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance, self.version)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    DeleteRange(Vec<u8>, Vec<u8>),
}

/// Staged writes applied atomically by `OrderedKv::commit`.
///
/// Operations apply in staging order, so a range delete followed by a put
/// inside the range keeps the put.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    /// Delete every key in `start..=end`.
    pub fn delete_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        self.ops.push(BatchOp::DeleteRange(start, end));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Resolve staged operations into final per-key writes (`None` = remove).
    ///
    /// `existing` lists stored keys for an inclusive range.
    fn resolve<F>(self, mut existing: F) -> anyhow::Result<BTreeMap<Vec<u8>, Option<Vec<u8>>>>
    where
        F: FnMut(&[u8], &[u8]) -> anyhow::Result<Vec<Vec<u8>>>,
    {
        let mut writes: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    writes.insert(key, Some(value));
                }
                BatchOp::Delete(key) => {
                    writes.insert(key, None);
                }
                BatchOp::DeleteRange(start, end) => {
                    if start > end {
                        continue;
                    }
                    for key in existing(&start, &end)? {
                        writes.insert(key, None);
                    }
                    for (_, value) in writes.range_mut(start..=end) {
                        *value = None;
                    }
                }
            }
        }
        Ok(writes)
    }
}

/// Ordered key-value engine.
pub trait OrderedKv: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> anyhow::Result<()>;
    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;
    /// Entries with keys in `start..=end`, ascending.
    fn range(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;
    fn delete_range(&self, start: &[u8], end: &[u8]) -> anyhow::Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_range(start.to_vec(), end.to_vec());
        self.commit(batch)
    }
    /// Apply every staged operation or none of them.
    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()>;
}

impl<T: OrderedKv + ?Sized> OrderedKv for Arc<T> {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> anyhow::Result<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        (**self).delete(key)
    }

    fn range(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        (**self).range(start, end)
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> anyhow::Result<()> {
        (**self).delete_range(start, end)
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        (**self).commit(batch)
    }
}

/// In-memory engine for tests and ephemeral volumes.
#[derive(Default)]
pub struct MemoryKv {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> anyhow::Error {
    anyhow::anyhow!("memory kv lock poisoned")
}

impl OrderedKv for MemoryKv {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let guard = self.inner.read().map_err(|_| poisoned())?;
        Ok(guard.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> anyhow::Result<()> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        guard.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        guard.remove(key);
        Ok(())
    }

    fn range(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if start > end {
            return Ok(Vec::new());
        }
        let guard = self.inner.read().map_err(|_| poisoned())?;
        Ok(guard
            .range(start.to_vec()..=end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        let writes = batch.resolve(|start, end| {
            Ok(guard
                .range(start.to_vec()..=end.to_vec())
                .map(|(k, _)| k.clone())
                .collect())
        })?;
        for (key, value) in writes {
            match value {
                Some(value) => guard.insert(key, value),
                None => guard.remove(&key),
            };
        }
        Ok(())
    }
}

/// Engine backed by one fjall partition.
pub struct FjallKv {
    keyspace: Arc<Keyspace>,
    partition: fjall::PartitionHandle,
    // Serializes commits so range deletes resolve against a stable view.
    lock: RwLock<()>,
}

impl FjallKv {
    pub fn open(keyspace: Arc<Keyspace>, partition: &str) -> anyhow::Result<Self> {
        let partition = keyspace
            .open_partition(partition, PartitionCreateOptions::default())
            .with_context(|| format!("open fjall partition {partition}"))?;
        Ok(Self {
            keyspace,
            partition,
            lock: RwLock::new(()),
        })
    }

    fn scan_keys(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for item in self.partition.range(start.to_vec()..=end.to_vec()) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

impl OrderedKv for FjallKv {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let _guard = self.lock.read().map_err(|_| anyhow::anyhow!("fjall kv lock poisoned"))?;
        Ok(self.partition.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> anyhow::Result<()> {
        let _guard = self.lock.write().map_err(|_| anyhow::anyhow!("fjall kv lock poisoned"))?;
        self.partition.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let _guard = self.lock.write().map_err(|_| anyhow::anyhow!("fjall kv lock poisoned"))?;
        self.partition.remove(key)?;
        Ok(())
    }

    fn range(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if start > end {
            return Ok(Vec::new());
        }
        let _guard = self.lock.read().map_err(|_| anyhow::anyhow!("fjall kv lock poisoned"))?;
        let mut out = Vec::new();
        for item in self.partition.range(start.to_vec()..=end.to_vec()) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.write().map_err(|_| anyhow::anyhow!("fjall kv lock poisoned"))?;
        // Snapshot range-deleted keys before staging removals.
        let writes = batch.resolve(|start, end| self.scan_keys(start, end))?;
        let mut fjall_batch = self.keyspace.batch();
        for (key, value) in writes {
            match value {
                Some(value) => fjall_batch.insert(&self.partition, key, value),
                None => fjall_batch.remove(&self.partition, key),
            }
        }
        fjall_batch.commit().context("commit fjall batch")?;
        Ok(())
    }
}
