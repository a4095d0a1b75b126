//! Inspection and maintenance of a data directory without opening an
//! instance.

use crate::catalog::types::{TableKind, TableMeta};
use crate::error::MvdbError;
use crate::storage::layout::{LocalLayout, PruneReport, sha256_file_hex};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalTableReport {
    pub name: String,
    pub version: u64,
    pub kind: TableKind,
    pub deleted: bool,
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyReport {
    pub ok: bool,
    pub table_count: u64,
    pub checked_files: u64,
    pub violations: Vec<String>,
}

pub fn list_tables(data_dir: &Path) -> Result<Vec<LocalTableReport>, MvdbError> {
    let layout = LocalLayout::new(data_dir);
    Ok(layout
        .scan_table_metas()?
        .into_iter()
        .map(|meta| LocalTableReport {
            files: meta.files.len() as u64,
            bytes: layout.table_size(&meta),
            name: meta.name,
            version: meta.version,
            kind: meta.kind,
            deleted: meta.deleted,
        })
        .collect())
}

/// Checks every live table's current version against the checksums recorded
/// in its metadata.
pub fn verify_local(data_dir: &Path) -> Result<VerifyReport, MvdbError> {
    let layout = LocalLayout::new(data_dir);
    let mut report = VerifyReport {
        ok: true,
        table_count: 0,
        checked_files: 0,
        violations: Vec::new(),
    };
    for meta in layout.scan_table_metas()? {
        if meta.deleted {
            continue;
        }
        report.table_count += 1;
        verify_table(&layout, &meta, &mut report);
    }
    report.ok = report.violations.is_empty();
    Ok(report)
}

fn verify_table(layout: &LocalLayout, meta: &TableMeta, report: &mut VerifyReport) {
    match meta.kind {
        TableKind::View => {
            if meta.sql.as_deref().is_none_or(|sql| sql.trim().is_empty()) {
                report
                    .violations
                    .push(format!("view '{}' has no SQL", meta.name));
            }
        }
        TableKind::Table => {
            if !layout.data_file(&meta.name, meta.version).exists() {
                report.violations.push(format!(
                    "table '{}' version {} has no data file",
                    meta.name, meta.version
                ));
                return;
            }
            let dir = layout.version_dir(&meta.name, meta.version);
            for (file, expected) in &meta.files {
                report.checked_files += 1;
                match sha256_file_hex(&dir.join(file)) {
                    Ok(actual) if actual == *expected => {}
                    Ok(actual) => report.violations.push(format!(
                        "table '{}' file '{file}' checksum mismatch: expected {expected}, got {actual}",
                        meta.name
                    )),
                    Err(err) => report
                        .violations
                        .push(format!("table '{}' file '{file}': {err}", meta.name)),
                }
            }
        }
    }
}

/// Same sweep as startup: drops tombstoned tables, directories without
/// metadata, and superseded versions.
pub fn prune_local(data_dir: &Path) -> Result<PruneReport, MvdbError> {
    LocalLayout::new(data_dir).prune()
}
