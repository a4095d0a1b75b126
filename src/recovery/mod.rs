use crate::catalog::types::TableMeta;
use crate::config::MvdbConfig;
use crate::error::MvdbError;
use crate::remote::RemoteSync;
use crate::storage::layout::LocalLayout;
use tracing::{info, warn};

/// Which side was treated as the source of truth on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupSource {
    LocalOnly,
    Pulled,
    Pushed,
}

#[derive(Debug, Clone)]
pub struct RecoveredState {
    pub tables: Vec<TableMeta>,
    pub source: StartupSource,
}

/// Reconciles the local directory with the remote store and sweeps it. The
/// returned tables seed the catalog.
pub async fn recover(
    config: &MvdbConfig,
    layout: &LocalLayout,
    remote: Option<&RemoteSync>,
) -> Result<RecoveredState, MvdbError> {
    if config.clean {
        info!(dir = %layout.root().display(), "recovery: wiping local and remote state");
        layout.wipe()?;
        if let Some(remote) = remote {
            remote.wipe().await?;
        }
    }
    layout.ensure_root()?;

    let marker = layout.read_marker()?;
    let source = match remote {
        None => StartupSource::LocalOnly,
        Some(remote) => {
            let local_tables = layout.prune()?.live;
            let local_wins = !local_tables.is_empty()
                && marker.is_none_or(|marker| !marker.remote_enabled);
            if local_wins {
                info!(
                    tables = local_tables.len(),
                    "recovery: local data takes precedence; pushing"
                );
                remote.push_all(&local_tables).await?;
                StartupSource::Pushed
            } else {
                info!("recovery: pulling remote state");
                remote.pull(None).await?;
                StartupSource::Pulled
            }
        }
    };
    layout.write_marker(remote.is_some())?;

    let report = layout.prune()?;
    if !report.removed.is_empty() {
        warn!(removed = report.removed.len(), "recovery: removed stale local entries");
    }
    info!(tables = report.live.len(), ?source, "recovery complete");
    Ok(RecoveredState {
        tables: report.live,
        source,
    })
}
