pub mod gc;
pub mod reader;

use crate::catalog::Catalog;
use crate::catalog::types::{TableMeta, table_key};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Frozen view of the live tables at one catalog generation.
#[derive(Debug)]
pub struct Snapshot {
    id: u64,
    tables: Vec<TableMeta>,
    ready: AtomicBool,
}

impl Snapshot {
    pub(crate) fn new(id: u64, tables: Vec<TableMeta>) -> Self {
        Self {
            id,
            tables,
            ready: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Live tables and views, sorted by name.
    pub fn tables(&self) -> &[TableMeta] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableMeta> {
        let key = table_key(name);
        self.tables.iter().find(|meta| meta.key() == key)
    }

    /// Whether the read engine already has this generation's schema.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// Schema in the read engine holding the views of generation `id`.
pub(crate) fn generation_schema(id: u64) -> String {
    format!("g{id}")
}

/// Reference on a snapshot; dropping it hands the reference back to the
/// catalog.
pub struct SnapshotGuard {
    catalog: Arc<Catalog>,
    snapshot: Arc<Snapshot>,
}

impl SnapshotGuard {
    pub(crate) fn new(catalog: Arc<Catalog>, snapshot: Arc<Snapshot>) -> Self {
        Self { catalog, snapshot }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }
}

impl Deref for SnapshotGuard {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl std::fmt::Debug for SnapshotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotGuard")
            .field("id", &self.snapshot.id)
            .field("tables", &self.snapshot.tables.len())
            .finish()
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.catalog.release_snapshot(self.snapshot.id);
    }
}
