#![allow(dead_code)]

use mvdb::{CreateTableOptions, MvdbConfig, MvdbInstance};
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn remote_store(path: &Path) -> Arc<dyn ObjectStore> {
    Arc::new(LocalFileSystem::new_with_prefix(path).expect("local object store"))
}

pub async fn open_local(dir: &Path) -> MvdbInstance {
    MvdbInstance::open(MvdbConfig::default(), dir, None)
        .await
        .expect("open db")
}

pub async fn open_with_remote(dir: &Path, remote: &Path) -> MvdbInstance {
    let config = MvdbConfig {
        remote_retry_delay_ms: 10,
        ..MvdbConfig::default()
    };
    MvdbInstance::open(config, dir, Some(remote_store(remote)))
        .await
        .expect("open db with remote")
}

pub async fn create_table(db: &MvdbInstance, name: &str, query: &str) {
    db.create_table_as_select(name, query, CreateTableOptions::default())
        .await
        .expect("create table");
}

pub async fn create_view(db: &MvdbInstance, name: &str, query: &str) {
    db.create_table_as_select(name, query, CreateTableOptions::view())
        .await
        .expect("create view");
}

/// First column of every row, rendered as text.
pub async fn query_column(db: &MvdbInstance, sql: &str) -> Result<Vec<String>, String> {
    let conn = db.acquire_read_connection().await.map_err(|e| e.to_string())?;
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| e.to_string())?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
}

pub async fn count_rows(db: &MvdbInstance, table: &str) -> i64 {
    let conn = db.acquire_read_connection().await.expect("read conn");
    conn.query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| {
        row.get(0)
    })
    .expect("count")
}

/// Polls until `check` holds; the janitor reclaims asynchronously.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn version_dirs(dir: &Path, table: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir.join(table)) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}
