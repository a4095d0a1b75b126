use serde::{Deserialize, Serialize};

pub const REPLICATION_MARKER_FILE: &str = "replication.json";
pub const RENAME_INTENT_FILE: &str = "rename_intent.json";

/// Records whether the previous run replicated to a remote store. Decides
/// which side wins on the next startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMarker {
    pub remote_enabled: bool,
}

/// Written next to the source table in the remote store before a rename is
/// pushed. A reader that finds it completes or abandons the rename.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenameIntent {
    pub to: String,
    pub version: u64,
}
