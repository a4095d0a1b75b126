use crate::error::MvdbError;
use crate::query::{SchemaFilter, SchemaPage};
use crate::remote::PullReport;
use crate::snapshot::reader::ReadConnection;
use crate::{CreateTableOptions, MvdbInstance};
use duckdb::Connection;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

pub fn block_on_mvdb<F, T>(rt: &Handle, f: F) -> T
where
    F: Future<Output = T>,
{
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| rt.block_on(f)),
        Err(_) => rt.block_on(f),
    }
}

/// Blocking facade over [`MvdbInstance`] for callers without an async context.
pub struct MvdbSync {
    inner: Arc<MvdbInstance>,
    rt: Handle,
}

impl MvdbSync {
    pub fn new(inner: Arc<MvdbInstance>, rt: Handle) -> Self {
        Self { inner, rt }
    }

    pub fn instance(&self) -> &Arc<MvdbInstance> {
        &self.inner
    }

    pub fn create_table_as_select(
        &self,
        name: &str,
        query: &str,
        options: CreateTableOptions,
    ) -> Result<(), MvdbError> {
        block_on_mvdb(
            &self.rt,
            self.inner.create_table_as_select(name, query, options),
        )
    }

    pub fn mutate_table<F>(
        &self,
        name: &str,
        init_queries: &[&str],
        mutate_fn: F,
    ) -> Result<(), MvdbError>
    where
        F: FnOnce(&Connection) -> Result<(), MvdbError> + Send + 'static,
    {
        block_on_mvdb(
            &self.rt,
            self.inner.mutate_table(name, init_queries, mutate_fn),
        )
    }

    pub fn drop_table(&self, name: &str) -> Result<(), MvdbError> {
        block_on_mvdb(&self.rt, self.inner.drop_table(name))
    }

    pub fn rename_table(&self, old_name: &str, new_name: &str) -> Result<(), MvdbError> {
        block_on_mvdb(&self.rt, self.inner.rename_table(old_name, new_name))
    }

    pub fn acquire_read_connection(&self) -> Result<ReadConnection, MvdbError> {
        block_on_mvdb(&self.rt, self.inner.acquire_read_connection())
    }

    pub fn schema(&self, filter: SchemaFilter) -> Result<SchemaPage, MvdbError> {
        block_on_mvdb(&self.rt, self.inner.schema(filter))
    }

    pub fn sync_remote(&self) -> Result<PullReport, MvdbError> {
        block_on_mvdb(&self.rt, self.inner.sync_remote())
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn close(&self) -> Result<(), MvdbError> {
        block_on_mvdb(&self.rt, self.inner.close())
    }
}

#[cfg(test)]
mod tests {
    use super::MvdbSync;
    use crate::{CreateTableOptions, MvdbConfig, MvdbInstance};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn blocking_facade_works_outside_a_runtime() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let dir = tempdir().expect("temp");
        let db = rt
            .block_on(MvdbInstance::open(MvdbConfig::default(), dir.path(), None))
            .expect("open");
        let db = MvdbSync::new(Arc::new(db), rt.handle().clone());

        db.create_table_as_select("t", "SELECT 1 AS id", CreateTableOptions::default())
            .expect("create");
        let conn = db.acquire_read_connection().expect("conn");
        let id: i32 = conn
            .query_row("SELECT id FROM t", [], |row| row.get(0))
            .expect("query");
        assert_eq!(id, 1);
        drop(conn);
        db.close().expect("close");
    }
}
