//! In-memory model store with optional JSON snapshots.
//!
//! Each table keeps its rows in a map guarded by a `RwLock`. When opened on a
//! directory every mutation rewrites `<dir>/<table>.json`, so a restarted
//! server sees the executors, instances and tokens it handed out before.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::model::*;
use super::repo::{Filter, Repositories, Repository, StoreResult};
use super::StoreError;

/// One table of rows keyed by sequence number.
pub struct MemoryTable<M: Model> {
    rows: RwLock<BTreeMap<u64, M>>,
    next_id: AtomicU64,
    file: Option<PathBuf>,
}

impl<M: Model> MemoryTable<M> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            file: None,
        }
    }

    /// Opens the table snapshot in `dir`, creating an empty table when the
    /// snapshot does not exist yet.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(format!("{}.json", M::NAME));
        let mut rows = BTreeMap::new();
        if file.exists() {
            let data = std::fs::read(&file)?;
            let loaded: Vec<M> = serde_json::from_slice(&data)?;
            for row in loaded {
                rows.insert(seq_of(row.id()), row);
            }
        }
        let next = rows.keys().next_back().map(|k| k + 1).unwrap_or(1);
        debug!(component = "store", event = "table_loaded", table = M::NAME, rows = rows.len(), "table loaded");
        Ok(Self {
            rows: RwLock::new(rows),
            next_id: AtomicU64::new(next),
            file: Some(file),
        })
    }

    fn persist(&self, rows: &BTreeMap<u64, M>) -> StoreResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let snapshot: Vec<&M> = rows.values().collect();
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = file.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, file)?;
        Ok(())
    }

    fn key_of(&self, id: &str, rows: &BTreeMap<u64, M>) -> Option<u64> {
        let key = seq_of(id);
        rows.get(&key).filter(|row| row.id() == id).map(|_| key)
    }
}

impl<M: Model> Default for MemoryTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ids are decimal sequence numbers; foreign ids hash into the high range.
fn seq_of(id: &str) -> u64 {
    id.parse().unwrap_or_else(|_| {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in id.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h | (1 << 63)
    })
}

#[async_trait::async_trait]
impl<M: Model> Repository<M> for MemoryTable<M> {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<M>> {
        let rows = self.rows.read();
        Ok(self.key_of(id, &rows).and_then(|k| rows.get(&k).cloned()))
    }

    async fn find_where(&self, filter: Filter<'_, M>) -> StoreResult<Vec<M>> {
        Ok(self.rows.read().values().filter(|m| filter(m)).cloned().collect())
    }

    async fn create(&self, mut model: M) -> StoreResult<M> {
        let mut rows = self.rows.write();
        if model.id().is_empty() {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            model.set_id(id.to_string());
        } else {
            let key = seq_of(model.id());
            if key < (1 << 63) {
                self.next_id.fetch_max(key + 1, Ordering::SeqCst);
            }
        }
        rows.insert(seq_of(model.id()), model.clone());
        self.persist(&rows)?;
        Ok(model)
    }

    async fn save(&self, model: &M) -> StoreResult<()> {
        let mut rows = self.rows.write();
        let key = self.key_of(model.id(), &rows).ok_or_else(|| StoreError::NotFound {
            model: M::NAME,
            id: model.id().to_string(),
        })?;
        rows.insert(key, model.clone());
        self.persist(&rows)
    }

    async fn destroy(&self, id: &str) -> StoreResult<bool> {
        let mut rows = self.rows.write();
        let Some(key) = self.key_of(id, &rows) else {
            return Ok(false);
        };
        rows.remove(&key);
        self.persist(&rows)?;
        Ok(true)
    }
}

impl Repositories {
    /// Purely in-memory repositories.
    pub fn memory() -> Self {
        Self {
            executors: Arc::new(MemoryTable::<ExecutorModel>::new()),
            services: Arc::new(MemoryTable::<ServiceModel>::new()),
            instances: Arc::new(MemoryTable::<InstanceModel>::new()),
            gateways: Arc::new(MemoryTable::<GatewayModel>::new()),
            processes: Arc::new(MemoryTable::<ProcessModel>::new()),
            records: Arc::new(MemoryTable::<ProcessRecord>::new()),
            cloud_resources: Arc::new(MemoryTable::<CloudResource>::new()),
            audit_log: Arc::new(MemoryTable::<AuditLogEntry>::new()),
        }
    }

    /// Repositories snapshotted to JSON files under `dir`.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        let repos = Self {
            executors: Arc::new(MemoryTable::<ExecutorModel>::open(dir)?),
            services: Arc::new(MemoryTable::<ServiceModel>::open(dir)?),
            instances: Arc::new(MemoryTable::<InstanceModel>::open(dir)?),
            gateways: Arc::new(MemoryTable::<GatewayModel>::open(dir)?),
            processes: Arc::new(MemoryTable::<ProcessModel>::open(dir)?),
            records: Arc::new(MemoryTable::<ProcessRecord>::open(dir)?),
            cloud_resources: Arc::new(MemoryTable::<CloudResource>::open(dir)?),
            audit_log: Arc::new(MemoryTable::<AuditLogEntry>::open(dir)?),
        };
        info!(component = "store", event = "opened", dir = ?dir, "model store opened");
        Ok(repos)
    }
}
