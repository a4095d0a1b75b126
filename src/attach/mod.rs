//! Exposes a set of table versions to a DuckDB connection: tables attach their
//! data file read-only behind a wrapper view, views are recreated from their
//! SQL in dependency-agnostic order.

use crate::catalog::types::{TableKind, TableMeta};
use crate::error::MvdbError;
use crate::storage::layout::LocalLayout;
use duckdb::Connection;
use tracing::{debug, warn};

/// Quotes an identifier for DuckDB.
pub fn safe_sql_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for DuckDB.
pub fn safe_sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Where the wrapper views are created.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AttachTarget<'a> {
    /// A schema of the in-memory read engine, one per generation.
    Schema(&'a str),
    /// Temporary views of a write connection.
    Temp,
}

impl AttachTarget<'_> {
    fn qualify(&self, name: &str) -> String {
        match self {
            AttachTarget::Schema(schema) => {
                format!("memory.{}.{}", safe_sql_name(schema), safe_sql_name(name))
            }
            AttachTarget::Temp => safe_sql_name(name),
        }
    }

    fn create_view(&self, name: &str, body: &str) -> String {
        let temp = match self {
            AttachTarget::Schema(_) => "",
            AttachTarget::Temp => "TEMP ",
        };
        format!(
            "CREATE OR REPLACE {temp}VIEW {} AS {body}",
            self.qualify(name)
        )
    }
}

/// What [`attach_tables`] exposed, for teardown on write connections.
#[derive(Debug, Default)]
pub(crate) struct AttachReport {
    pub aliases: Vec<String>,
    pub views: Vec<String>,
    pub stubbed: Vec<String>,
}

pub(crate) fn attach_tables(
    conn: &Connection,
    layout: &LocalLayout,
    metas: &[TableMeta],
    target: AttachTarget<'_>,
) -> Result<AttachReport, MvdbError> {
    if let AttachTarget::Schema(schema) = target {
        conn.execute_batch(&format!("USE memory.{}", safe_sql_name(schema)))?;
    }
    let mut report = AttachReport::default();

    for meta in metas.iter().filter(|m| m.kind == TableKind::Table) {
        let alias = meta.db_alias();
        let path = layout.data_file(&meta.name, meta.version);
        conn.execute_batch(&format!(
            "ATTACH IF NOT EXISTS {} AS {} (READ_ONLY)",
            safe_sql_string(&path.to_string_lossy()),
            safe_sql_name(&alias)
        ))
        .map_err(|e| MvdbError::from(e).context("attach", &meta.name))?;
        conn.execute_batch(&target.create_view(
            &meta.name,
            &format!(
                "SELECT * FROM {}.main.{}",
                safe_sql_name(&alias),
                safe_sql_name(&meta.name)
            ),
        ))
        .map_err(|e| MvdbError::from(e).context("attach", &meta.name))?;
        report.aliases.push(alias);
        report.views.push(meta.name.clone());
    }

    let mut pending: Vec<&TableMeta> = metas.iter().filter(|m| m.is_view()).collect();
    pending.sort_by(|a, b| {
        a.created_version
            .cmp(&b.created_version)
            .then_with(|| a.key().cmp(&b.key()))
    });
    // A view may reference views created after it, so keep sweeping the
    // failures until a full pass makes no progress.
    let mut failures = Vec::new();
    while !pending.is_empty() {
        let mut progressed = false;
        let mut retry = Vec::new();
        failures.clear();
        for meta in pending {
            let sql = meta.sql.as_deref().unwrap_or_default();
            match conn.execute_batch(&target.create_view(&meta.name, &format!("({sql}\n)"))) {
                Ok(()) => {
                    progressed = true;
                    report.views.push(meta.name.clone());
                }
                Err(err) => {
                    failures.push((meta, err.to_string()));
                    retry.push(meta);
                }
            }
        }
        if !progressed {
            break;
        }
        pending = retry;
    }

    for (meta, message) in failures {
        warn!(view = %meta.name, error = %message, "view failed to attach; creating error stub");
        let stub = format!(
            "SELECT error({})",
            safe_sql_string(&format!("view '{}' is invalid: {message}", meta.name))
        );
        match conn.execute_batch(&target.create_view(&meta.name, &stub)) {
            Ok(()) => {
                report.views.push(meta.name.clone());
                report.stubbed.push(meta.name.clone());
            }
            Err(err) => warn!(view = %meta.name, error = %err, "failed to create error stub"),
        }
    }
    debug!(
        tables = report.aliases.len(),
        views = report.views.len(),
        stubbed = report.stubbed.len(),
        "tables attached"
    );
    Ok(report)
}
