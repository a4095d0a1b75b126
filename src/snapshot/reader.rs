use crate::attach::{AttachTarget, attach_tables, safe_sql_name, safe_sql_string};
use crate::catalog::types::TableMeta;
use crate::config::MvdbConfig;
use crate::error::MvdbError;
use crate::snapshot::{Snapshot, SnapshotGuard, generation_schema};
use crate::storage::layout::LocalLayout;
use crate::EngineCounters;
use duckdb::{Connection, DuckdbConnectionManager};
use parking_lot::Mutex;
use r2d2::{CustomizeConnection, Pool, PooledConnection};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ConnectionInit {
    queries: Vec<String>,
}

impl CustomizeConnection<Connection, duckdb::Error> for ConnectionInit {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), duckdb::Error> {
        for query in &self.queries {
            conn.execute_batch(query)?;
        }
        Ok(())
    }
}

/// The in-memory read engine. Each catalog generation gets its own schema of
/// wrapper views; data files are attached read-only and shared between
/// generations.
pub(crate) struct ReadHandle {
    pool: Pool<DuckdbConnectionManager>,
    layout: LocalLayout,
    // Serializes attach/detach and schema DDL on the shared engine.
    meta_lock: Mutex<()>,
    counters: Arc<EngineCounters>,
}

impl ReadHandle {
    pub(crate) fn open(
        config: &MvdbConfig,
        settings: &BTreeMap<String, String>,
        layout: LocalLayout,
        counters: Arc<EngineCounters>,
    ) -> Result<Self, MvdbError> {
        let manager = DuckdbConnectionManager::memory()?;
        let pool = Pool::builder()
            .max_size(config.read_pool_size)
            .min_idle(Some(1))
            .connection_timeout(config.pool_timeout())
            .connection_customizer(Box::new(ConnectionInit {
                queries: config.conn_init_queries.clone(),
            }))
            .build(manager)?;
        {
            let conn = pool.get()?;
            apply_settings(&conn, settings)?;
            for query in &config.db_init_queries {
                conn.execute_batch(query)?;
            }
        }
        info!(
            pool_size = config.read_pool_size,
            settings = settings.len(),
            "read engine opened"
        );
        Ok(Self {
            pool,
            layout,
            meta_lock: Mutex::new(()),
            counters,
        })
    }

    /// Borrows a pooled connection scoped to the snapshot's generation,
    /// building the generation's schema on first use.
    pub(crate) fn connect(&self, snapshot: SnapshotGuard) -> Result<ReadConnection, MvdbError> {
        let conn = self.pool.get()?;
        self.ensure_generation(&conn, &snapshot)?;
        conn.execute_batch(&format!(
            "USE memory.{}",
            safe_sql_name(&generation_schema(snapshot.id()))
        ))?;
        Ok(ReadConnection {
            conn: Some(conn),
            snapshot,
        })
    }

    fn ensure_generation(&self, conn: &Connection, snapshot: &Snapshot) -> Result<(), MvdbError> {
        if snapshot.is_ready() {
            return Ok(());
        }
        let _guard = self.meta_lock.lock();
        if snapshot.is_ready() {
            return Ok(());
        }
        let schema = generation_schema(snapshot.id());
        conn.execute_batch(&format!(
            "CREATE SCHEMA IF NOT EXISTS memory.{}",
            safe_sql_name(&schema)
        ))?;
        attach_tables(
            conn,
            &self.layout,
            snapshot.tables(),
            AttachTarget::Schema(&schema),
        )?;
        snapshot.mark_ready();
        self.counters
            .generation_attaches
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            generation = snapshot.id(),
            tables = snapshot.tables().len(),
            "generation attached"
        );
        Ok(())
    }

    /// Drops the schema of a reclaimed generation.
    pub(crate) fn drop_generation(&self, id: u64) -> Result<(), MvdbError> {
        let conn = self.pool.get()?;
        let _guard = self.meta_lock.lock();
        conn.execute_batch(&format!(
            "USE memory.main; DROP SCHEMA IF EXISTS memory.{} CASCADE",
            safe_sql_name(&generation_schema(id))
        ))?;
        Ok(())
    }

    /// Detaches the data file of a reclaimed table version.
    pub(crate) fn detach_version(&self, meta_alias: &str) -> Result<(), MvdbError> {
        let conn = self.pool.get()?;
        let _guard = self.meta_lock.lock();
        conn.execute_batch(&format!(
            "USE memory.main; DETACH DATABASE IF EXISTS {}",
            safe_sql_name(meta_alias)
        ))?;
        Ok(())
    }
}

pub(crate) fn apply_settings(
    conn: &Connection,
    settings: &BTreeMap<String, String>,
) -> Result<(), MvdbError> {
    for (key, value) in settings {
        conn.execute_batch(&format!("SET {key} = {}", safe_sql_string(value)))?;
    }
    Ok(())
}

/// A pooled read connection pinned to one snapshot. Tables and views resolve
/// to the versions that were current when it was acquired, for as long as it
/// is held.
pub struct ReadConnection {
    conn: Option<PooledConnection<DuckdbConnectionManager>>,
    snapshot: SnapshotGuard,
}

impl ReadConnection {
    pub fn generation(&self) -> u64 {
        self.snapshot.id()
    }

    pub fn tables(&self) -> &[TableMeta] {
        self.snapshot.tables()
    }

    pub(crate) fn connection(&self) -> &Connection {
        self.deref()
    }

    /// Returns the connection to the pool and releases the snapshot.
    pub fn release(mut self) -> Result<(), MvdbError> {
        if let Some(conn) = self.conn.take() {
            conn.execute_batch("USE memory.main")?;
        }
        Ok(())
    }
}

impl Deref for ReadConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => &**conn,
            None => unreachable!("connection is only taken by release"),
        }
    }
}

impl std::fmt::Debug for ReadConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadConnection")
            .field("generation", &self.snapshot.id())
            .finish()
    }
}

impl Drop for ReadConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && let Err(err) = conn.execute_batch("USE memory.main")
        {
            warn!(error = %err, "failed to reset read connection");
        }
    }
}
