use crate::catalog::types::{TableMeta, table_key};
use crate::error::MvdbError;
use crate::snapshot::generation_schema;
use crate::snapshot::reader::ReadConnection;
use std::collections::HashMap;

/// Selects which tables [`crate::MvdbInstance::schema`] describes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaFilter {
    /// Exact table name, compared case-insensitively.
    pub name: Option<String>,
    /// SQL `ILIKE` pattern on the table name.
    pub like: Option<String>,
    /// Maximum tables per page; 0 returns everything.
    pub page_size: usize,
    pub page_token: Option<String>,
}

impl SchemaFilter {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn like(pattern: impl Into<String>) -> Self {
        Self {
            like: Some(pattern.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub view: bool,
    pub version: u64,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaPage {
    pub tables: Vec<TableInfo>,
    pub next_page_token: Option<String>,
}

/// Describes the tables visible to `conn`'s snapshot.
pub(crate) fn describe(
    conn: &ReadConnection,
    filter: &SchemaFilter,
) -> Result<SchemaPage, MvdbError> {
    let mut sql = String::from(
        "SELECT table_name, column_name, data_type, is_nullable \
         FROM information_schema.columns \
         WHERE table_catalog = 'memory' AND table_schema = ?",
    );
    let mut params = vec![generation_schema(conn.generation())];
    if let Some(pattern) = &filter.like {
        sql.push_str(" AND table_name ILIKE ?");
        params.push(pattern.clone());
    }
    sql.push_str(" ORDER BY table_name, ordinal_position");

    let mut columns: HashMap<String, Vec<ColumnInfo>> = HashMap::new();
    let mut stmt = conn.connection().prepare(&sql)?;
    let rows = stmt.query_map(duckdb::params_from_iter(params.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            ColumnInfo {
                name: row.get(1)?,
                data_type: row.get(2)?,
                nullable: row.get::<_, String>(3)? == "YES",
            },
        ))
    })?;
    for row in rows {
        let (table, column) = row?;
        columns.entry(table_key(&table)).or_default().push(column);
    }

    let name_key = filter.name.as_deref().map(table_key);
    let token = filter.page_token.as_deref().map(table_key);
    let candidates: Vec<&TableMeta> = conn
        .tables()
        .iter()
        .filter(|meta| name_key.as_ref().is_none_or(|key| meta.key() == *key))
        .filter(|meta| token.as_ref().is_none_or(|token| meta.key() > *token))
        .filter(|meta| filter.like.is_none() || columns.contains_key(&meta.key()))
        .collect();

    let mut page = SchemaPage::default();
    let limit = if filter.page_size == 0 {
        candidates.len()
    } else {
        filter.page_size
    };
    for meta in candidates.iter().take(limit) {
        page.tables.push(TableInfo {
            name: meta.name.clone(),
            view: meta.is_view(),
            version: meta.version,
            columns: columns.remove(&meta.key()).unwrap_or_default(),
        });
    }
    if candidates.len() > limit {
        page.next_page_token = page.tables.last().map(|table| table_key(&table.name));
    }
    Ok(page)
}
