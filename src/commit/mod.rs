//! The write half of every mutation: a dedicated DuckDB connection on the new
//! version's data file, with sibling tables visible as temporary views.

use crate::attach::{AttachTarget, attach_tables, safe_sql_name};
use crate::catalog::types::TableMeta;
use crate::error::MvdbError;
use crate::snapshot::reader::apply_settings;
use crate::storage::layout::LocalLayout;
use duckdb::Connection;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Everything needed to open a write connection.
#[derive(Debug, Clone)]
pub(crate) struct WriteJob {
    /// Data file of the version being written; `None` for views, which are
    /// validated on an in-memory engine.
    pub db_path: Option<PathBuf>,
    pub siblings: Vec<TableMeta>,
    pub settings: BTreeMap<String, String>,
    pub init_queries: Vec<String>,
    pub layout: LocalLayout,
}

pub(crate) struct WriteConnection {
    conn: Connection,
    aliases: Vec<String>,
    views: Vec<String>,
    file_backed: bool,
}

impl WriteJob {
    pub(crate) fn open(&self) -> Result<WriteConnection, MvdbError> {
        let conn = match &self.db_path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        apply_settings(&conn, &self.settings)?;
        for query in &self.init_queries {
            conn.execute_batch(query)?;
        }
        let report = attach_tables(&conn, &self.layout, &self.siblings, AttachTarget::Temp)?;
        Ok(WriteConnection {
            conn,
            aliases: report.aliases,
            views: report.views,
            file_backed: self.db_path.is_some(),
        })
    }
}

impl WriteConnection {
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Removes the sibling views and attachments and flushes the data file.
    /// The connection is closed when this returns.
    pub(crate) fn finish(self) -> Result<(), MvdbError> {
        for view in &self.views {
            if let Err(err) = self
                .conn
                .execute_batch(&format!("DROP VIEW IF EXISTS temp.main.{}", safe_sql_name(view)))
            {
                warn!(view = %view, error = %err, "failed to drop temporary view");
            }
        }
        for alias in &self.aliases {
            self.conn
                .execute_batch(&format!("DETACH DATABASE IF EXISTS {}", safe_sql_name(alias)))?;
        }
        if self.file_backed {
            self.conn.execute_batch("CHECKPOINT")?;
        }
        self.conn.close().map_err(|(_, err)| MvdbError::Engine(err))?;
        debug!("write connection closed");
        Ok(())
    }
}

/// Whether the engine rejected the SQL text itself rather than something it
/// refers to.
pub(crate) fn is_parse_error(err: &duckdb::Error) -> bool {
    err.to_string().contains("Parser Error")
}

/// Materializes `query` as table `name` on the write connection.
pub(crate) fn create_table_as(
    conn: &Connection,
    name: &str,
    query: &str,
) -> Result<(), MvdbError> {
    conn.execute_batch(&format!(
        "CREATE OR REPLACE TABLE {} AS ({query}\n)",
        safe_sql_name(name)
    ))?;
    Ok(())
}

/// Checks a view definition against the siblings. Returns `Err` only for SQL
/// the engine cannot parse; views whose dependencies are missing are accepted
/// so they can be created ahead of them.
pub(crate) fn validate_view(conn: &Connection, name: &str, query: &str) -> Result<(), MvdbError> {
    match conn.execute_batch(&format!(
        "CREATE OR REPLACE TEMP VIEW {} AS ({query}\n)",
        safe_sql_name(name)
    )) {
        Ok(()) => Ok(()),
        Err(err) if is_parse_error(&err) => Err(MvdbError::InvalidDefinition {
            name: name.to_string(),
            message: err.to_string(),
        }),
        Err(err) => {
            debug!(view = name, error = %err, "view accepted with unresolved references");
            Ok(())
        }
    }
}

/// Renames the table stored in a copied data file.
pub(crate) fn rename_in_file(conn: &Connection, old: &str, new: &str) -> Result<(), MvdbError> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {}",
        safe_sql_name(old),
        safe_sql_name(new)
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{WriteJob, create_table_as, validate_view};
    use crate::storage::layout::LocalLayout;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn write_connection_sees_siblings_and_persists() {
        let dir = tempdir().expect("temp");
        let layout = LocalLayout::new(dir.path());

        let guard = layout.create_version_dir("base", 1).expect("dir");
        let job = WriteJob {
            db_path: Some(layout.data_file("base", 1)),
            siblings: Vec::new(),
            settings: BTreeMap::from([("threads".to_string(), "1".to_string())]),
            init_queries: Vec::new(),
            layout: layout.clone(),
        };
        let wc = job.open().expect("open");
        create_table_as(wc.conn(), "base", "SELECT 1 AS id").expect("create");
        wc.finish().expect("finish");
        guard.disarm();

        let guard = layout.create_version_dir("derived", 2).expect("dir");
        let job = WriteJob {
            db_path: Some(layout.data_file("derived", 2)),
            siblings: vec![crate::catalog::types::TableMeta::new_table("base", 1)],
            settings: BTreeMap::new(),
            init_queries: Vec::new(),
            layout: layout.clone(),
        };
        let wc = job.open().expect("open");
        create_table_as(wc.conn(), "derived", "SELECT id + 1 AS id FROM base").expect("create");
        wc.finish().expect("finish");
        guard.disarm();

        let conn = duckdb::Connection::open(layout.data_file("derived", 2)).expect("reopen");
        let id: i32 = conn
            .query_row("SELECT id FROM derived", [], |row| row.get(0))
            .expect("query");
        assert_eq!(id, 2);
    }

    #[test]
    fn only_parse_errors_reject_views() {
        let dir = tempdir().expect("temp");
        let job = WriteJob {
            db_path: None,
            siblings: Vec::new(),
            settings: BTreeMap::new(),
            init_queries: Vec::new(),
            layout: LocalLayout::new(dir.path()),
        };
        let wc = job.open().expect("open");
        assert!(validate_view(wc.conn(), "v", "SELECT * FROM not_yet_created").is_ok());
        let err = validate_view(wc.conn(), "v", "SELECT 1 AS id, 'India AS country")
            .expect_err("unterminated string");
        assert_eq!(err.code_str(), "invalid_definition");
        wc.finish().expect("finish");
    }
}
