use crate::manifest::schema::REPLICATION_MARKER_FILE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TableKind {
    Table,
    View,
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableKind::Table => write!(f, "TABLE"),
            TableKind::View => write!(f, "VIEW"),
        }
    }
}

/// Metadata of one immutable version of a table or view. This is the content
/// of `meta.json`, both locally and in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub version: u64,
    /// Version at which the name first appeared. Views keep it across
    /// replacements and attach in this order.
    pub created_version: u64,
    #[serde(rename = "type")]
    pub kind: TableKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// File name inside the version directory mapped to its sha256 hex digest.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    /// Local tombstone; never set on remote metadata.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl TableMeta {
    pub fn new_table(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
            created_version: version,
            kind: TableKind::Table,
            sql: None,
            files: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn new_view(name: impl Into<String>, version: u64, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            created_version: version,
            kind: TableKind::View,
            sql: Some(sql.into()),
            files: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn is_view(&self) -> bool {
        self.kind == TableKind::View
    }

    pub fn key(&self) -> String {
        table_key(&self.name)
    }

    /// Alias under which this version's data file is attached to an engine.
    pub fn db_alias(&self) -> String {
        db_alias(&self.name, self.version)
    }

    /// Copy suitable for pushing: the local tombstone is stripped.
    pub fn for_remote(&self) -> Self {
        Self {
            deleted: false,
            ..self.clone()
        }
    }
}

/// Names compare case-insensitively; the catalog is keyed by this form.
pub fn table_key(name: &str) -> String {
    name.to_lowercase()
}

pub fn validate_table_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("table name must not be empty".into());
    }
    if name.len() > 255 {
        return Err("table name must be at most 255 bytes".into());
    }
    if table_key(name) == REPLICATION_MARKER_FILE {
        return Err(format!("table name '{name}' is reserved"));
    }
    if name.starts_with('.') {
        return Err(format!("table name '{name}' must not start with '.'"));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '%' || c.is_control())
    {
        return Err(format!(
            "table name '{name}' must not contain '/', '\\', '%' or control characters"
        ));
    }
    Ok(())
}

pub fn db_alias(name: &str, version: u64) -> String {
    format!("{}__{version}__db", table_key(name))
}

static LAST_VERSION: AtomicU64 = AtomicU64::new(0);

/// Returns a process-wide strictly increasing version id based on wall-clock
/// milliseconds, always greater than `floor`.
pub fn next_version(floor: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut candidate = 0;
    let _ = LAST_VERSION.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        candidate = now.max(last + 1).max(floor + 1);
        Some(candidate)
    });
    candidate
}

#[cfg(test)]
mod tests {
    use super::{TableKind, TableMeta, next_version, table_key, validate_table_name};

    #[test]
    fn versions_are_strictly_increasing_and_above_floor() {
        let a = next_version(0);
        let b = next_version(0);
        assert!(b > a);
        let c = next_version(b + 1_000_000);
        assert_eq!(c, b + 1_000_001);
    }

    #[test]
    fn meta_json_shape() {
        let mut meta = TableMeta::new_view("Orders_V", 7, "SELECT 1");
        meta.created_version = 3;
        let json = serde_json::to_value(&meta).expect("encode");
        assert_eq!(json["type"], "VIEW");
        assert_eq!(json["created_version"], 3);
        assert!(json.get("deleted").is_none());
        assert!(json.get("files").is_none());

        let decoded: TableMeta = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded.kind, TableKind::View);
        assert_eq!(decoded.key(), "orders_v");
        assert_eq!(decoded.db_alias(), "orders_v__7__db");
    }

    #[test]
    fn table_names_are_checked() {
        assert!(validate_table_name("events").is_ok());
        assert!(validate_table_name("Sales 2024").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("a/b").is_err());
        assert!(validate_table_name(".hidden").is_err());
        assert!(validate_table_name("replication.json").is_err());
        assert!(validate_table_name("Replication.JSON").is_err());
        assert_eq!(table_key("MixedCase"), "mixedcase");
    }
}
