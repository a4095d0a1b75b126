use crate::EngineCounters;
use crate::catalog::types::db_alias;
use crate::error::MvdbError;
use crate::snapshot::reader::ReadHandle;
use crate::storage::layout::LocalLayout;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Physical cleanup owed once the catalog drops the last reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaim {
    /// Drop the read engine schema of a generation.
    Snapshot { id: u64 },
    /// Detach and delete one version of a table. Views have no data.
    Version {
        table: String,
        version: u64,
        has_data: bool,
    },
    /// Delete what is left of a dropped table.
    Table { name: String },
}

/// Background task applying [`Reclaim`] messages in the order they were sent.
pub(crate) struct Janitor {
    pub reader: Arc<ReadHandle>,
    pub layout: LocalLayout,
    pub write_lock: Arc<AsyncMutex<()>>,
    pub counters: Arc<EngineCounters>,
}

impl Janitor {
    pub(crate) fn spawn(
        self,
        mut rx: mpsc::UnboundedReceiver<Reclaim>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => self.apply(msg).await,
                        None => break,
                    },
                    _ = &mut shutdown => {
                        while let Ok(msg) = rx.try_recv() {
                            self.apply(msg).await;
                        }
                        break;
                    }
                }
            }
            debug!("janitor stopped");
        })
    }

    async fn apply(&self, msg: Reclaim) {
        let result = match &msg {
            Reclaim::Snapshot { id } => {
                let reader = self.reader.clone();
                let id = *id;
                run_blocking(move || reader.drop_generation(id)).await.map(|()| {
                    self.counters
                        .snapshots_reclaimed
                        .fetch_add(1, Ordering::Relaxed);
                })
            }
            Reclaim::Version {
                table,
                version,
                has_data,
            } => {
                let reader = self.reader.clone();
                let layout = self.layout.clone();
                let (table, version, has_data) = (table.clone(), *version, *has_data);
                run_blocking(move || {
                    if has_data {
                        reader.detach_version(&db_alias(&table, version))?;
                        layout.remove_version_dir(&table, version)?;
                    }
                    Ok(())
                })
                .await
                .map(|()| {
                    self.counters
                        .versions_reclaimed
                        .fetch_add(1, Ordering::Relaxed);
                })
            }
            Reclaim::Table { name } => {
                // Writers recreate table directories; stay out of their way.
                let _write = self.write_lock.lock().await;
                let layout = self.layout.clone();
                let name = name.clone();
                run_blocking(move || layout.remove_dropped_table(&name).map(|_| ())).await
            }
        };
        match result {
            Ok(()) => debug!(?msg, "reclaimed"),
            Err(err) => warn!(?msg, error = %err, "reclaim failed"),
        }
    }
}

async fn run_blocking<F>(f: F) -> Result<(), MvdbError>
where
    F: FnOnce() -> Result<(), MvdbError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
