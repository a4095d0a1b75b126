pub mod attach;
pub mod catalog;
pub mod commit;
pub mod config;
pub mod error;
pub mod manifest;
pub mod offline;
pub mod query;
pub mod recovery;
pub mod remote;
pub mod snapshot;
pub mod storage;
pub mod sync_bridge;

pub use crate::catalog::types::{TableKind, TableMeta};
pub use crate::config::MvdbConfig;
pub use crate::error::{MvdbError, MvdbErrorCode};
pub use crate::query::{ColumnInfo, SchemaFilter, SchemaPage, TableInfo};
pub use crate::remote::PullReport;
pub use crate::snapshot::reader::ReadConnection;

use crate::catalog::Catalog;
use crate::catalog::types::{next_version, table_key, validate_table_name};
use crate::commit::{WriteJob, create_table_as, rename_in_file, validate_view};
use crate::config::ResolvedSettings;
use crate::remote::RemoteSync;
use crate::snapshot::gc::Janitor;
use crate::snapshot::reader::ReadHandle;
use crate::storage::layout::{LocalLayout, VersionDirGuard};
use duckdb::Connection;
use object_store::ObjectStore;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub generation_attaches: AtomicU64,
    pub versions_reclaimed: AtomicU64,
    pub snapshots_reclaimed: AtomicU64,
}

/// Point-in-time counters of the snapshot machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub generation: u64,
    pub live_snapshots: usize,
    pub generation_attaches: u64,
    pub versions_reclaimed: u64,
    pub snapshots_reclaimed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateTableOptions {
    /// Store the query as a view instead of materializing it.
    pub view: bool,
}

impl CreateTableOptions {
    pub fn view() -> Self {
        Self { view: true }
    }
}

struct Shared {
    config: MvdbConfig,
    settings: ResolvedSettings,
    layout: LocalLayout,
    catalog: Arc<Catalog>,
    reader: Arc<ReadHandle>,
    remote: Option<RemoteSync>,
    write_lock: Arc<AsyncMutex<()>>,
    counters: Arc<EngineCounters>,
    closed: AtomicBool,
}

/// A directory of versioned DuckDB tables, optionally replicated to an object
/// store. Writes are serialized and each produces a new immutable version;
/// readers see a consistent snapshot for as long as they hold it.
pub struct MvdbInstance {
    shared: Arc<Shared>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl MvdbInstance {
    pub async fn open(
        config: MvdbConfig,
        dir: &Path,
        remote: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self, MvdbError> {
        config.validate()?;
        info!(
            dir = %dir.display(),
            clean = config.clean,
            memory_limit_gb = config.memory_limit_gb,
            cpu = config.cpu,
            read_write_ratio = config.read_write_ratio,
            read_pool_size = config.read_pool_size,
            pool_timeout_ms = config.pool_timeout_ms,
            remote_retry_attempts = config.remote_retry_attempts,
            remote_retry_delay_ms = config.remote_retry_delay_ms,
            download_concurrency = config.download_concurrency,
            remote_enabled = remote.is_some(),
            "mvdb config"
        );
        let layout = LocalLayout::new(dir);
        let remote = remote.map(|store| {
            RemoteSync::new(
                store,
                layout.clone(),
                config.retry_policy(),
                config.download_concurrency,
            )
        });
        let recovered = recovery::recover(&config, &layout, remote.as_ref()).await?;

        let settings = config.resolved_settings();
        let counters = Arc::new(EngineCounters::default());
        let reader = {
            let config = config.clone();
            let read_settings = settings.read.clone();
            let layout = layout.clone();
            let counters = counters.clone();
            tokio::task::spawn_blocking(move || {
                ReadHandle::open(&config, &read_settings, layout, counters)
            })
            .await??
        };
        let reader = Arc::new(reader);

        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        let catalog = Catalog::new(recovered.tables, reclaim_tx);
        let write_lock = Arc::new(AsyncMutex::new(()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let janitor = Janitor {
            reader: reader.clone(),
            layout: layout.clone(),
            write_lock: write_lock.clone(),
            counters: counters.clone(),
        }
        .spawn(reclaim_rx, shutdown_rx);

        info!(tables = catalog.list_tables().len(), "mvdb opened");
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                settings,
                layout,
                catalog,
                reader,
                remote,
                write_lock,
                counters,
                closed: AtomicBool::new(false),
            }),
            janitor: Mutex::new(Some(janitor)),
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Stops accepting work, waits for the in-flight write, and drains the
    /// janitor. Read connections still held stay usable until dropped.
    pub async fn close(&self) -> Result<(), MvdbError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        drop(self.shared.write_lock.lock().await);
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            janitor.await?;
        }
        info!(dir = %self.shared.layout.root().display(), "mvdb closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), MvdbError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MvdbError::Closed);
        }
        Ok(())
    }

    /// Takes the global write lock and brings local state up to date with
    /// the remote store.
    async fn begin_write(&self) -> Result<OwnedMutexGuard<()>, MvdbError> {
        self.ensure_open()?;
        let guard = self.shared.write_lock.clone().lock_owned().await;
        self.ensure_open()?;
        if let Some(remote) = &self.shared.remote {
            remote.pull(Some(&self.shared.catalog)).await?;
        }
        Ok(guard)
    }

    fn write_job(&self, db_path: Option<std::path::PathBuf>, exclude_key: &str) -> WriteJob {
        WriteJob {
            db_path,
            siblings: self
                .shared
                .catalog
                .list_tables()
                .into_iter()
                .filter(|meta| meta.key() != exclude_key)
                .collect(),
            settings: self.shared.settings.write.clone(),
            init_queries: self.shared.config.db_init_queries.clone(),
            layout: self.shared.layout.clone(),
        }
    }

    /// Runs blocking engine work that owns the write lock and the new version
    /// directory. Both are handed back on success; if the caller is cancelled
    /// they are only released once the work has finished.
    async fn run_write<F>(
        write: OwnedMutexGuard<()>,
        dir_guard: Option<VersionDirGuard>,
        work: F,
    ) -> Result<(TableMeta, OwnedMutexGuard<()>, Option<VersionDirGuard>), MvdbError>
    where
        F: FnOnce() -> Result<TableMeta, MvdbError> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let meta = work()?;
            Ok((meta, write, dir_guard))
        })
        .await?
    }

    /// Pushes, records locally, then makes `meta` current.
    async fn publish(
        &self,
        op: &'static str,
        previous: Option<&TableMeta>,
        meta: TableMeta,
        dir_guard: Option<VersionDirGuard>,
    ) -> Result<(), MvdbError> {
        if let Some(remote) = &self.shared.remote {
            remote
                .push(previous, &meta)
                .await
                .map_err(|e| e.context(op, &meta.name))?;
        }
        if let Err(err) = self.shared.layout.write_table_meta(&meta) {
            if self.shared.remote.is_some() {
                error!(
                    table = %meta.name,
                    version = meta.version,
                    error = %err,
                    "version pushed but local metadata write failed; next pull reconciles"
                );
            }
            return Err(err.context(op, &meta.name));
        }
        if let Some(guard) = dir_guard {
            guard.disarm();
        }
        info!(
            table = %meta.name,
            version = meta.version,
            kind = %meta.kind,
            op,
            "table version published"
        );
        self.shared.catalog.add_table_version(meta, true);
        Ok(())
    }

    /// Creates or replaces `name` from `query`. As a table, the result is
    /// materialized into a new version file; as a view, only the SQL is kept.
    pub async fn create_table_as_select(
        &self,
        name: &str,
        query: &str,
        options: CreateTableOptions,
    ) -> Result<(), MvdbError> {
        validate_table_name(name).map_err(MvdbError::Validation)?;
        let write = self.begin_write().await?;
        let shared = &self.shared;

        let existing = shared.catalog.table_meta(name).ok();
        let canonical = existing
            .as_ref()
            .map_or_else(|| name.to_string(), |meta| meta.name.clone());
        let version = next_version(existing.as_ref().map_or(0, |meta| meta.version));
        let mut meta = if options.view {
            let mut meta = TableMeta::new_view(&canonical, version, query);
            if let Some(previous) = existing.as_ref().filter(|meta| meta.is_view()) {
                meta.created_version = previous.created_version;
            }
            meta
        } else {
            TableMeta::new_table(&canonical, version)
        };

        let dir_guard = if options.view {
            shared.layout.ensure_table_dir(&canonical)?;
            None
        } else {
            Some(shared.layout.create_version_dir(&canonical, version)?)
        };
        let job = self.write_job(
            (!options.view).then(|| shared.layout.data_file(&canonical, version)),
            &meta.key(),
        );
        let layout = shared.layout.clone();
        let query = query.to_string();
        let (meta, _write, dir_guard) = Self::run_write(write, dir_guard, move || {
            let wc = job.open()?;
            if meta.is_view() {
                validate_view(wc.conn(), &meta.name, &query)?;
            } else {
                create_table_as(wc.conn(), &meta.name, &query)?;
            }
            wc.finish()?;
            if !meta.is_view() {
                meta.files = layout.checksum_version(&meta.name, meta.version)?;
            }
            Ok(meta)
        })
        .await
        .map_err(|e| e.context("create", name))?;

        self.publish("create", existing.as_ref(), meta, dir_guard)
            .await
    }

    /// Produces a new version of `name` by copying the current one and
    /// handing a write connection on the copy to `mutate_fn`.
    pub async fn mutate_table<F>(
        &self,
        name: &str,
        init_queries: &[&str],
        mutate_fn: F,
    ) -> Result<(), MvdbError>
    where
        F: FnOnce(&Connection) -> Result<(), MvdbError> + Send + 'static,
    {
        let write = self.begin_write().await?;
        let shared = &self.shared;
        let previous = shared.catalog.table_meta(name)?;
        if previous.is_view() {
            return Err(MvdbError::Validation(format!(
                "'{}' is a view and cannot be mutated",
                previous.name
            )));
        }
        let version = next_version(previous.version);
        let mut meta = TableMeta::new_table(&previous.name, version);
        meta.created_version = previous.created_version;

        let dir_guard = shared.layout.create_version_dir(&meta.name, version)?;
        let job = self.write_job(
            Some(shared.layout.data_file(&meta.name, version)),
            &meta.key(),
        );
        let layout = shared.layout.clone();
        let source = previous.clone();
        let init_queries: Vec<String> = init_queries.iter().map(|q| q.to_string()).collect();
        let (meta, _write, dir_guard) = Self::run_write(write, Some(dir_guard), move || {
            layout.copy_version_files(&source, &meta.name, meta.version)?;
            let wc = job.open()?;
            for query in &init_queries {
                wc.conn().execute_batch(query)?;
            }
            mutate_fn(wc.conn())?;
            wc.finish()?;
            meta.files = layout.checksum_version(&meta.name, meta.version)?;
            Ok(meta)
        })
        .await
        .map_err(|e| e.context("mutate", name))?;

        self.publish("mutate", Some(&previous), meta, dir_guard)
            .await
    }

    pub async fn drop_table(&self, name: &str) -> Result<(), MvdbError> {
        let _write = self.begin_write().await?;
        let shared = &self.shared;
        let previous = shared.catalog.table_meta(name)?;
        if let Some(remote) = &shared.remote {
            remote
                .delete_table(&previous.name)
                .await
                .map_err(|e| e.context("drop", name))?;
        }
        shared
            .layout
            .mark_deleted(&previous)
            .map_err(|e| e.context("drop", name))?;
        shared.catalog.remove_table(&previous.name)?;
        info!(table = %previous.name, version = previous.version, "table dropped");
        Ok(())
    }

    pub async fn rename_table(&self, old_name: &str, new_name: &str) -> Result<(), MvdbError> {
        validate_table_name(new_name).map_err(MvdbError::Validation)?;
        if table_key(old_name) == table_key(new_name) {
            return Err(MvdbError::Conflict(format!(
                "cannot rename '{old_name}' to '{new_name}': names are equal ignoring case"
            )));
        }
        let write = self.begin_write().await?;
        let shared = &self.shared;
        let previous = shared.catalog.table_meta(old_name)?;
        if shared.catalog.table_meta(new_name).is_ok() {
            return Err(MvdbError::Conflict(format!(
                "table '{new_name}' already exists"
            )));
        }
        let version = next_version(previous.version);

        let (meta, _write, dir_guard) = if previous.is_view() {
            shared.layout.ensure_table_dir(new_name)?;
            let sql = previous.sql.clone().unwrap_or_default();
            (TableMeta::new_view(new_name, version, sql), write, None)
        } else {
            let dir_guard = shared.layout.create_version_dir(new_name, version)?;
            let job = WriteJob {
                db_path: Some(shared.layout.data_file(new_name, version)),
                siblings: Vec::new(),
                settings: shared.settings.write.clone(),
                init_queries: Vec::new(),
                layout: shared.layout.clone(),
            };
            let layout = shared.layout.clone();
            let source = previous.clone();
            let mut meta = TableMeta::new_table(new_name, version);
            Self::run_write(write, Some(dir_guard), move || {
                layout.copy_version_files(&source, &meta.name, meta.version)?;
                let wc = job.open()?;
                rename_in_file(wc.conn(), &source.name, &meta.name)?;
                wc.finish()?;
                meta.files = layout.checksum_version(&meta.name, meta.version)?;
                Ok(meta)
            })
            .await
            .map_err(|e| e.context("rename", old_name))?
        };

        if let Some(remote) = &shared.remote {
            remote
                .rename(&previous, &meta)
                .await
                .map_err(|e| e.context("rename", old_name))?;
        }
        shared
            .layout
            .write_table_meta(&meta)
            .and_then(|()| shared.layout.mark_deleted(&previous))
            .map_err(|e| e.context("rename", old_name))?;
        if let Some(guard) = dir_guard {
            guard.disarm();
        }
        shared.catalog.rename_table(&previous.name, meta)?;
        info!(from = %previous.name, to = new_name, "table renamed");
        Ok(())
    }

    /// Borrows a read connection pinned to the current snapshot. Dropping it
    /// (or calling [`ReadConnection::release`]) gives everything back.
    pub async fn acquire_read_connection(&self) -> Result<ReadConnection, MvdbError> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let snapshot = shared.catalog.acquire_snapshot();
            shared.reader.connect(snapshot)
        })
        .await?
    }

    /// Describes tables and columns as seen by the current snapshot.
    pub async fn schema(&self, filter: SchemaFilter) -> Result<SchemaPage, MvdbError> {
        let conn = self.acquire_read_connection().await?;
        tokio::task::spawn_blocking(move || query::describe(&conn, &filter)).await?
    }

    /// Current metadata of one table or view.
    pub fn table(&self, name: &str) -> Result<TableMeta, MvdbError> {
        self.shared.catalog.table_meta(name)
    }

    pub fn list_tables(&self) -> Vec<TableMeta> {
        self.shared.catalog.list_tables()
    }

    /// Bytes on disk of the current version of every table.
    pub fn size(&self) -> u64 {
        self.shared
            .catalog
            .list_tables()
            .iter()
            .map(|meta| self.shared.layout.table_size(meta))
            .sum()
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            generation: self.shared.catalog.generation(),
            live_snapshots: self.shared.catalog.live_snapshots(),
            generation_attaches: counters.generation_attaches.load(Ordering::Relaxed),
            versions_reclaimed: counters.versions_reclaimed.load(Ordering::Relaxed),
            snapshots_reclaimed: counters.snapshots_reclaimed.load(Ordering::Relaxed),
        }
    }

    pub fn dir(&self) -> &Path {
        self.shared.layout.root()
    }

    /// Pulls remote changes outside of a write. Also the way to reconcile
    /// after a write that failed half-way through.
    pub async fn sync_remote(&self) -> Result<PullReport, MvdbError> {
        self.ensure_open()?;
        let _write = self.shared.write_lock.lock().await;
        match &self.shared.remote {
            Some(remote) => remote.pull(Some(&self.shared.catalog)).await,
            None => Ok(PullReport::default()),
        }
    }
}
