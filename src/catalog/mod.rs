pub mod types;

use crate::catalog::types::{TableKind, TableMeta, table_key};
use crate::error::MvdbError;
use crate::snapshot::gc::Reclaim;
use crate::snapshot::{Snapshot, SnapshotGuard};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

#[derive(Debug)]
struct TableEntry {
    name: String,
    deleted: bool,
    current_version: Option<u64>,
    versions: BTreeMap<u64, VersionEntry>,
}

#[derive(Debug)]
struct VersionEntry {
    meta: TableMeta,
    ref_count: usize,
}

#[derive(Debug)]
struct SnapshotEntry {
    snapshot: Arc<Snapshot>,
    ref_count: usize,
}

#[derive(Debug, Default)]
struct CatalogState {
    tables: HashMap<String, TableEntry>,
    snapshots: HashMap<u64, SnapshotEntry>,
    generation: u64,
}

/// In-memory registry of tables, their referenced versions and the snapshots
/// readers hold. Every version and snapshot is reference counted; when a count
/// reaches zero a [`Reclaim`] message is sent so the physical cleanup happens
/// outside the lock.
#[derive(Debug)]
pub struct Catalog {
    state: Mutex<CatalogState>,
    reclaim_tx: UnboundedSender<Reclaim>,
}

impl Catalog {
    pub fn new(tables: Vec<TableMeta>, reclaim_tx: UnboundedSender<Reclaim>) -> Arc<Self> {
        let catalog = Arc::new(Self {
            state: Mutex::new(CatalogState::default()),
            reclaim_tx,
        });
        for meta in tables {
            catalog.add_table_version(meta, false);
        }
        catalog
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Snapshots still materialized, including the current generation's one.
    pub fn live_snapshots(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    /// Current metadata of a live table.
    pub fn table_meta(&self, name: &str) -> Result<TableMeta, MvdbError> {
        let state = self.state.lock();
        state
            .tables
            .get(&table_key(name))
            .filter(|entry| !entry.deleted)
            .and_then(|entry| {
                let version = entry.current_version?;
                entry.versions.get(&version).map(|v| v.meta.clone())
            })
            .ok_or_else(|| MvdbError::table_not_found(name))
    }

    pub fn list_tables(&self) -> Vec<TableMeta> {
        let state = self.state.lock();
        live_tables(&state)
    }

    /// Whether any version of `name` is still referenced, live or not.
    pub fn has_versions(&self, name: &str) -> bool {
        self.state
            .lock()
            .tables
            .get(&table_key(name))
            .is_some_and(|entry| !entry.versions.is_empty())
    }

    /// Makes `meta` the current version of its table. The version gains one
    /// reference and the previous current version loses one. With
    /// `bump_generation` the change becomes visible to new snapshots.
    pub fn add_table_version(&self, meta: TableMeta, bump_generation: bool) {
        let mut reclaims = Vec::new();
        {
            let mut state = self.state.lock();
            add_version_locked(&mut state, meta, &mut reclaims);
            if bump_generation {
                bump_locked(&mut state, &mut reclaims);
            }
        }
        self.dispatch(reclaims);
    }

    /// Marks the table deleted and drops the reference of its current version.
    pub fn remove_table(&self, name: &str) -> Result<(), MvdbError> {
        let mut reclaims = Vec::new();
        {
            let mut state = self.state.lock();
            remove_table_locked(&mut state, &table_key(name), &mut reclaims)
                .ok_or_else(|| MvdbError::table_not_found(name))?;
            bump_locked(&mut state, &mut reclaims);
        }
        self.dispatch(reclaims);
        Ok(())
    }

    /// Registers `new_meta` and removes `old_name` in one generation step.
    pub fn rename_table(&self, old_name: &str, new_meta: TableMeta) -> Result<(), MvdbError> {
        let mut reclaims = Vec::new();
        {
            let mut state = self.state.lock();
            let old_key = table_key(old_name);
            if !state
                .tables
                .get(&old_key)
                .is_some_and(|entry| !entry.deleted)
            {
                return Err(MvdbError::table_not_found(old_name));
            }
            add_version_locked(&mut state, new_meta, &mut reclaims);
            remove_table_locked(&mut state, &old_key, &mut reclaims);
            bump_locked(&mut state, &mut reclaims);
        }
        self.dispatch(reclaims);
        Ok(())
    }

    /// Returns a reference on the current generation's snapshot. The first
    /// acquisition in a generation materializes it; the catalog keeps its own
    /// reference until the generation moves on.
    pub fn acquire_snapshot(self: &Arc<Self>) -> SnapshotGuard {
        let snapshot = {
            let mut state = self.state.lock();
            let id = state.generation;
            if let Some(entry) = state.snapshots.get_mut(&id) {
                entry.ref_count += 1;
                entry.snapshot.clone()
            } else {
                let tables = live_tables(&state);
                for meta in &tables {
                    if let Some(version) = state
                        .tables
                        .get_mut(&meta.key())
                        .and_then(|entry| entry.versions.get_mut(&meta.version))
                    {
                        version.ref_count += 1;
                    }
                }
                let snapshot = Arc::new(Snapshot::new(id, tables));
                state.snapshots.insert(
                    id,
                    SnapshotEntry {
                        snapshot: snapshot.clone(),
                        ref_count: 2,
                    },
                );
                debug!(generation = id, "snapshot materialized");
                snapshot
            }
        };
        SnapshotGuard::new(self.clone(), snapshot)
    }

    pub(crate) fn release_snapshot(&self, id: u64) {
        let mut reclaims = Vec::new();
        {
            let mut state = self.state.lock();
            release_snapshot_locked(&mut state, id, &mut reclaims);
        }
        self.dispatch(reclaims);
    }

    fn dispatch(&self, reclaims: Vec<Reclaim>) {
        for reclaim in reclaims {
            // A closed channel means the janitor has stopped; leftovers are
            // swept by the startup scan.
            let _ = self.reclaim_tx.send(reclaim);
        }
    }
}

fn live_tables(state: &CatalogState) -> Vec<TableMeta> {
    let mut tables: Vec<TableMeta> = state
        .tables
        .values()
        .filter(|entry| !entry.deleted)
        .filter_map(|entry| {
            let version = entry.current_version?;
            entry.versions.get(&version).map(|v| v.meta.clone())
        })
        .collect();
    tables.sort_by_key(|meta| meta.key());
    tables
}

fn add_version_locked(state: &mut CatalogState, meta: TableMeta, reclaims: &mut Vec<Reclaim>) {
    let key = meta.key();
    let version = meta.version;
    let entry = state.tables.entry(key.clone()).or_insert_with(|| TableEntry {
        name: meta.name.clone(),
        deleted: false,
        current_version: None,
        versions: BTreeMap::new(),
    });
    entry.name = meta.name.clone();
    entry.deleted = false;
    entry
        .versions
        .entry(version)
        .or_insert_with(|| VersionEntry { meta, ref_count: 0 })
        .ref_count += 1;
    if let Some(previous) = entry.current_version.replace(version) {
        release_version_locked(state, &key, previous, reclaims);
    }
}

fn remove_table_locked(
    state: &mut CatalogState,
    key: &str,
    reclaims: &mut Vec<Reclaim>,
) -> Option<()> {
    let entry = state.tables.get_mut(key).filter(|entry| !entry.deleted)?;
    entry.deleted = true;
    if let Some(previous) = entry.current_version.take() {
        release_version_locked(state, key, previous, reclaims);
    }
    Some(())
}

fn bump_locked(state: &mut CatalogState, reclaims: &mut Vec<Reclaim>) {
    let previous = state.generation;
    state.generation += 1;
    if state.snapshots.contains_key(&previous) {
        release_snapshot_locked(state, previous, reclaims);
    }
}

fn release_snapshot_locked(state: &mut CatalogState, id: u64, reclaims: &mut Vec<Reclaim>) {
    let Some(entry) = state.snapshots.get_mut(&id) else {
        return;
    };
    entry.ref_count = entry.ref_count.saturating_sub(1);
    if entry.ref_count > 0 {
        return;
    }
    let Some(entry) = state.snapshots.remove(&id) else {
        return;
    };
    reclaims.push(Reclaim::Snapshot { id });
    for meta in entry.snapshot.tables() {
        release_version_locked(state, &meta.key(), meta.version, reclaims);
    }
}

fn release_version_locked(
    state: &mut CatalogState,
    key: &str,
    version: u64,
    reclaims: &mut Vec<Reclaim>,
) {
    let Some(entry) = state.tables.get_mut(key) else {
        return;
    };
    let Some(version_entry) = entry.versions.get_mut(&version) else {
        return;
    };
    version_entry.ref_count = version_entry.ref_count.saturating_sub(1);
    if version_entry.ref_count > 0 {
        return;
    }
    if let Some(released) = entry.versions.remove(&version) {
        reclaims.push(Reclaim::Version {
            table: released.meta.name,
            version,
            has_data: released.meta.kind == TableKind::Table,
        });
    }
    if entry.deleted && entry.versions.is_empty() {
        let name = entry.name.clone();
        state.tables.remove(key);
        reclaims.push(Reclaim::Table { name });
    }
}

#[cfg(test)]
mod tests {
    use super::Catalog;
    use crate::catalog::types::TableMeta;
    use crate::snapshot::gc::Reclaim;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    fn drain(rx: &mut UnboundedReceiver<Reclaim>) -> Vec<Reclaim> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn snapshot_pins_version_across_replacement() {
        let (tx, mut rx) = unbounded_channel();
        let catalog = Catalog::new(vec![TableMeta::new_table("events", 1)], tx);

        let first = catalog.acquire_snapshot();
        assert_eq!(first.table("EVENTS").map(|m| m.version), Some(1));

        catalog.add_table_version(TableMeta::new_table("events", 2), true);
        assert!(drain(&mut rx).is_empty(), "version 1 still pinned");

        let second = catalog.acquire_snapshot();
        assert_eq!(second.table("events").map(|m| m.version), Some(2));
        assert_ne!(first.id(), second.id());

        drop(first);
        assert_eq!(
            drain(&mut rx),
            vec![
                Reclaim::Snapshot { id: 0 },
                Reclaim::Version {
                    table: "events".into(),
                    version: 1,
                    has_data: true,
                },
            ]
        );
        drop(second);
        assert!(drain(&mut rx).is_empty(), "current generation keeps its reference");
        assert_eq!(catalog.live_snapshots(), 1);
    }

    #[test]
    fn same_generation_returns_same_snapshot() {
        let (tx, _rx) = unbounded_channel();
        let catalog = Catalog::new(vec![TableMeta::new_table("a", 1)], tx);
        let one = catalog.acquire_snapshot();
        let two = catalog.acquire_snapshot();
        assert!(std::sync::Arc::ptr_eq(one.snapshot(), two.snapshot()));
        assert_eq!(catalog.live_snapshots(), 1);
    }

    #[test]
    fn unreferenced_version_is_reclaimed_immediately() {
        let (tx, mut rx) = unbounded_channel();
        let catalog = Catalog::new(vec![TableMeta::new_table("a", 1)], tx);
        catalog.add_table_version(TableMeta::new_table("a", 2), true);
        assert_eq!(
            drain(&mut rx),
            vec![Reclaim::Version {
                table: "a".into(),
                version: 1,
                has_data: true,
            }]
        );
        assert_eq!(catalog.table_meta("A").map(|m| m.version).ok(), Some(2));
    }

    #[test]
    fn removed_table_is_reclaimed_after_last_reader() {
        let (tx, mut rx) = unbounded_channel();
        let catalog = Catalog::new(
            vec![
                TableMeta::new_table("a", 1),
                TableMeta::new_view("v", 2, "SELECT * FROM a"),
            ],
            tx,
        );
        let reader = catalog.acquire_snapshot();
        catalog.remove_table("v").expect("remove");
        assert!(catalog.table_meta("v").is_err());
        assert!(catalog.remove_table("v").is_err());
        assert!(drain(&mut rx).is_empty());
        assert!(reader.table("v").is_some());

        drop(reader);
        let msgs = drain(&mut rx);
        assert!(msgs.contains(&Reclaim::Version {
            table: "v".into(),
            version: 2,
            has_data: false,
        }));
        assert!(msgs.contains(&Reclaim::Table { name: "v".into() }));
        assert_eq!(catalog.list_tables().len(), 1);
    }

    #[test]
    fn rename_is_atomic_for_new_snapshots() {
        let (tx, _rx) = unbounded_channel();
        let catalog = Catalog::new(vec![TableMeta::new_table("old", 1)], tx);
        let before = catalog.generation();
        catalog
            .rename_table("OLD", TableMeta::new_table("new", 2))
            .expect("rename");
        assert_eq!(catalog.generation(), before + 1);
        let snap = catalog.acquire_snapshot();
        assert!(snap.table("old").is_none());
        assert_eq!(snap.table("new").map(|m| m.version), Some(2));
        assert!(
            catalog
                .rename_table("missing", TableMeta::new_table("x", 3))
                .is_err()
        );
    }

    #[test]
    fn dropped_then_recreated_table_is_live_again() {
        let (tx, mut rx) = unbounded_channel();
        let catalog = Catalog::new(vec![TableMeta::new_table("a", 1)], tx);
        let reader = catalog.acquire_snapshot();
        catalog.remove_table("a").expect("remove");
        catalog.add_table_version(TableMeta::new_table("a", 5), true);
        drop(reader);
        let msgs = drain(&mut rx);
        assert!(!msgs.iter().any(|m| matches!(m, Reclaim::Table { .. })));
        assert_eq!(catalog.table_meta("a").map(|m| m.version).ok(), Some(5));
    }
}
