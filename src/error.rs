use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Table,
    Version,
    Snapshot,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Table => write!(f, "table"),
            ResourceType::Version => write!(f, "version"),
            ResourceType::Snapshot => write!(f, "snapshot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MvdbErrorCode {
    Io,
    Engine,
    Remote,
    Pool,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    InvalidDefinition,
    IntegrityError,
    Unavailable,
    Closed,
    Conflict,
    TableNotFound,
    VersionNotFound,
    SnapshotNotFound,
}

impl MvdbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            MvdbErrorCode::Io => "io",
            MvdbErrorCode::Engine => "engine",
            MvdbErrorCode::Remote => "remote",
            MvdbErrorCode::Pool => "pool",
            MvdbErrorCode::Encode => "encode",
            MvdbErrorCode::Decode => "decode",
            MvdbErrorCode::Validation => "validation",
            MvdbErrorCode::InvalidConfig => "invalid_config",
            MvdbErrorCode::InvalidDefinition => "invalid_definition",
            MvdbErrorCode::IntegrityError => "integrity_error",
            MvdbErrorCode::Unavailable => "unavailable",
            MvdbErrorCode::Closed => "closed",
            MvdbErrorCode::Conflict => "conflict",
            MvdbErrorCode::TableNotFound => "table_not_found",
            MvdbErrorCode::VersionNotFound => "version_not_found",
            MvdbErrorCode::SnapshotNotFound => "snapshot_not_found",
        }
    }
}

#[derive(Debug, Error)]
pub enum MvdbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine error: {0}")]
    Engine(#[from] duckdb::Error),
    #[error("remote storage error: {0}")]
    Remote(#[from] object_store::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid definition for '{name}': {message}")]
    InvalidDefinition { name: String, message: String },
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
    #[error("database is closed")]
    Closed,
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{op} '{table}': {source}")]
    Context {
        op: &'static str,
        table: String,
        #[source]
        source: Box<MvdbError>,
    },
}

impl MvdbError {
    pub fn table_not_found(name: impl Into<String>) -> Self {
        MvdbError::NotFound {
            resource_type: ResourceType::Table,
            resource_id: name.into(),
        }
    }

    /// Attaches the operation and table name. Errors that already name the
    /// table, or were already wrapped, pass through untouched.
    pub fn context(self, op: &'static str, table: &str) -> Self {
        match self {
            MvdbError::Context { .. }
            | MvdbError::NotFound { .. }
            | MvdbError::Conflict(_)
            | MvdbError::InvalidDefinition { .. }
            | MvdbError::Closed => self,
            other => MvdbError::Context {
                op,
                table: table.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Innermost error, looking through any context wrapping.
    pub fn root(&self) -> &MvdbError {
        match self {
            MvdbError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn code(&self) -> MvdbErrorCode {
        match self {
            MvdbError::Io(_) => MvdbErrorCode::Io,
            MvdbError::Engine(_) => MvdbErrorCode::Engine,
            MvdbError::Remote(_) => MvdbErrorCode::Remote,
            MvdbError::Pool(_) => MvdbErrorCode::Pool,
            MvdbError::Encode(_) => MvdbErrorCode::Encode,
            MvdbError::Decode(_) => MvdbErrorCode::Decode,
            MvdbError::Validation(_) => MvdbErrorCode::Validation,
            MvdbError::InvalidConfig { .. } => MvdbErrorCode::InvalidConfig,
            MvdbError::InvalidDefinition { .. } => MvdbErrorCode::InvalidDefinition,
            MvdbError::IntegrityError { .. } => MvdbErrorCode::IntegrityError,
            MvdbError::Unavailable { .. } => MvdbErrorCode::Unavailable,
            MvdbError::Closed => MvdbErrorCode::Closed,
            MvdbError::Conflict(_) => MvdbErrorCode::Conflict,
            MvdbError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Table => MvdbErrorCode::TableNotFound,
                ResourceType::Version => MvdbErrorCode::VersionNotFound,
                ResourceType::Snapshot => MvdbErrorCode::SnapshotNotFound,
            },
            MvdbError::Context { source, .. } => source.code(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), MvdbError::NotFound { .. })
    }
}

impl From<tokio::task::JoinError> for MvdbError {
    fn from(err: tokio::task::JoinError) -> Self {
        MvdbError::Unavailable {
            message: format!("background task failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MvdbError, MvdbErrorCode, ResourceType};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(MvdbErrorCode::TableNotFound.as_str(), "table_not_found");
        assert_eq!(
            MvdbErrorCode::InvalidDefinition.as_str(),
            "invalid_definition"
        );
        assert_eq!(MvdbErrorCode::IntegrityError.as_str(), "integrity_error");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = MvdbError::NotFound {
            resource_type: ResourceType::Table,
            resource_id: "events".into(),
        };
        assert_eq!(err.code(), MvdbErrorCode::TableNotFound);
        assert_eq!(err.code_str(), "table_not_found");
        assert_eq!(err.to_string(), "table 'events' not found");
    }

    #[test]
    fn context_keeps_inner_code_and_names_table() {
        let err = MvdbError::Io(std::io::Error::other("disk full")).context("create", "events");
        assert_eq!(err.code(), MvdbErrorCode::Io);
        let text = err.to_string();
        assert!(text.contains("create 'events'"), "{text}");
        assert!(text.contains("disk full"), "{text}");

        let not_found = MvdbError::table_not_found("events").context("drop", "events");
        assert!(matches!(not_found, MvdbError::NotFound { .. }));
        assert!(not_found.is_not_found());
    }
}
