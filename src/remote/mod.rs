pub mod retry;

use crate::catalog::Catalog;
use crate::catalog::types::{TableKind, TableMeta};
use crate::error::MvdbError;
use crate::manifest::atomic::{decode_json, encode_json};
use crate::manifest::schema::{RENAME_INTENT_FILE, RenameIntent};
use crate::remote::retry::{RetryPolicy, with_retry};
use crate::storage::layout::{LocalLayout, META_FILE, sha256_hex};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one pull.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    pub downloaded: Vec<TableMeta>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    /// Tables already on disk at the remote version that the catalog had not
    /// caught up with.
    pub reconciled: Vec<String>,
}

/// Mirrors the local table layout into an object store:
///
/// ```text
/// <table>/meta.json
/// <table>/<version>/<file>
/// <table>/rename_intent.json   (only while a rename is in flight)
/// ```
///
/// A table exists remotely iff its `meta.json` does.
pub struct RemoteSync {
    store: Arc<dyn ObjectStore>,
    layout: LocalLayout,
    retry: RetryPolicy,
    download_concurrency: usize,
}

fn meta_key(table: &str) -> Path {
    Path::from(format!("{table}/{META_FILE}"))
}

fn intent_key(table: &str) -> Path {
    Path::from(format!("{table}/{RENAME_INTENT_FILE}"))
}

fn version_prefix(table: &str, version: u64) -> Path {
    Path::from(format!("{table}/{version}"))
}

impl RemoteSync {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        layout: LocalLayout,
        retry: RetryPolicy,
        download_concurrency: usize,
    ) -> Self {
        Self {
            store,
            layout,
            retry,
            download_concurrency: download_concurrency.max(1),
        }
    }

    /// Current metadata of every table in the remote store, keyed by lowercase
    /// name. Interrupted renames are completed or abandoned on the way.
    pub async fn remote_tables(&self) -> Result<BTreeMap<String, TableMeta>, MvdbError> {
        let store = &self.store;
        let listing = with_retry(self.retry, "list", || async move {
            store.list_with_delimiter(None).await
        })
        .await?;
        let mut tables = BTreeMap::new();
        // Table prefixes are used as listed so names never get re-encoded.
        for prefix in listing.common_prefixes {
            if let Some(intent) = self
                .get_json::<RenameIntent>(&prefix.child(RENAME_INTENT_FILE))
                .await?
                && self.resolve_rename_intent(&prefix, &intent).await?
            {
                continue;
            }
            if let Some(meta) = self.get_json::<TableMeta>(&prefix.child(META_FILE)).await? {
                tables.insert(meta.key(), meta);
            }
        }
        Ok(tables)
    }

    /// Returns true when the rename was completed and the old prefix no longer
    /// exists. While the target has not been published the rename may still be
    /// in flight on another instance, so the intent is left alone.
    async fn resolve_rename_intent(
        &self,
        old: &Path,
        intent: &RenameIntent,
    ) -> Result<bool, MvdbError> {
        match self.get_json::<TableMeta>(&meta_key(&intent.to)).await? {
            None => {
                debug!(from = %old, to = %intent.to, "rename pending; target not published");
                Ok(false)
            }
            Some(target) if target.version >= intent.version => {
                info!(from = %old, to = %intent.to, "completing interrupted rename");
                self.delete_prefix(old).await?;
                Ok(true)
            }
            Some(_) => {
                warn!(from = %old, to = %intent.to, "discarding stale rename intent");
                self.delete_object(&old.child(RENAME_INTENT_FILE)).await?;
                Ok(false)
            }
        }
    }

    /// Brings the local directory in line with the remote store. With a
    /// catalog, downloaded versions become current and vanished tables are
    /// removed from it; without one (startup), vanished tables are deleted
    /// from disk outright.
    pub async fn pull(&self, catalog: Option<&Catalog>) -> Result<PullReport, MvdbError> {
        let remote = self.remote_tables().await?;
        let local: BTreeMap<String, TableMeta> = self
            .layout
            .scan_table_metas()?
            .into_iter()
            .map(|meta| (meta.key(), meta))
            .collect();

        let mut report = PullReport::default();
        let mut pending = Vec::new();
        for (key, meta) in &remote {
            match local.get(key) {
                Some(existing)
                    if !existing.deleted
                        && existing.version == meta.version
                        && existing.name == meta.name =>
                {
                    report.unchanged += 1;
                    // An earlier pull may have written this version to disk
                    // and failed before the catalog saw it.
                    if let Some(catalog) = catalog
                        && !catalog
                            .table_meta(&existing.name)
                            .is_ok_and(|current| current.version == existing.version)
                    {
                        catalog.add_table_version(existing.clone(), true);
                        report.reconciled.push(existing.name.clone());
                    }
                }
                _ => pending.push(meta.clone()),
            }
        }

        // Every finished download is registered, even when another one fails.
        let results: Vec<Result<TableMeta, MvdbError>> = futures::stream::iter(pending)
            .map(|meta| self.download(meta))
            .buffer_unordered(self.download_concurrency)
            .collect()
            .await;
        let mut first_error = None;
        for result in results {
            let meta = match result {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(error = %err, "table download failed");
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            if let Some(existing) = local.get(&meta.key())
                && existing.name != meta.name
                && !existing.deleted
            {
                self.layout.mark_deleted(existing)?;
            }
            if let Some(catalog) = catalog {
                catalog.add_table_version(meta.clone(), true);
            }
            report.downloaded.push(meta);
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        for (key, existing) in &local {
            if existing.deleted || remote.contains_key(key) {
                continue;
            }
            match catalog {
                Some(catalog) => {
                    self.layout.mark_deleted(existing)?;
                    if let Err(err) = catalog.remove_table(&existing.name) {
                        debug!(
                            table = %existing.name,
                            error = %err,
                            "table already absent from catalog"
                        );
                    }
                }
                None => self.layout.remove_table_dir(&existing.name)?,
            }
            report.removed.push(existing.name.clone());
        }
        info!(
            downloaded = report.downloaded.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged,
            "pulled remote tables"
        );
        Ok(report)
    }

    async fn download(&self, meta: TableMeta) -> Result<TableMeta, MvdbError> {
        if meta.kind == TableKind::Table {
            let guard = self.layout.create_version_dir(&meta.name, meta.version)?;
            let files: Vec<(String, Option<String>)> = if meta.files.is_empty() {
                self.remote_version_files(&meta.name, meta.version)
                    .await?
                    .into_iter()
                    .map(|file| (file, None))
                    .collect()
            } else {
                meta.files
                    .iter()
                    .map(|(file, sum)| (file.clone(), Some(sum.clone())))
                    .collect()
            };
            for (file, expected) in files {
                let path = Path::from(format!("{}/{}/{file}", meta.name, meta.version));
                let bytes = self.get_bytes(&path).await?.ok_or_else(|| {
                    MvdbError::IntegrityError {
                        message: format!("remote file '{path}' is missing"),
                    }
                })?;
                if let Some(expected) = expected {
                    let actual = sha256_hex(&bytes);
                    if actual != expected {
                        return Err(MvdbError::IntegrityError {
                            message: format!(
                                "checksum mismatch for '{path}': expected {expected}, got {actual}"
                            ),
                        });
                    }
                }
                tokio::fs::write(guard.path().join(&file), &bytes).await?;
            }
            guard.disarm();
        } else {
            self.layout.ensure_table_dir(&meta.name)?;
        }
        self.layout.write_table_meta(&meta)?;
        debug!(table = %meta.name, version = meta.version, "downloaded table version");
        Ok(meta)
    }

    async fn remote_version_files(
        &self,
        table: &str,
        version: u64,
    ) -> Result<Vec<String>, MvdbError> {
        let prefix = version_prefix(table, version);
        Ok(self
            .list_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|location| location.filename().map(str::to_string))
            .collect())
    }

    /// Uploads the files of `new`, then its metadata, then removes the previous
    /// version of the same table.
    pub async fn push(&self, old: Option<&TableMeta>, new: &TableMeta) -> Result<(), MvdbError> {
        if new.kind == TableKind::Table {
            for file in new.files.keys() {
                let local = self.layout.version_dir(&new.name, new.version).join(file);
                let bytes = Bytes::from(tokio::fs::read(&local).await?);
                let path = Path::from(format!("{}/{}/{file}", new.name, new.version));
                self.put_bytes(&path, bytes).await?;
            }
        }
        self.put_bytes(&meta_key(&new.name), Bytes::from(encode_json(&new.for_remote())?))
            .await?;
        if let Some(old) = old
            && old.key() == new.key()
            && old.version != new.version
            && old.kind == TableKind::Table
        {
            self.delete_version(&old.name, old.version).await?;
        }
        debug!(table = %new.name, version = new.version, "pushed table version");
        Ok(())
    }

    /// Removes the objects of one version of a table.
    pub async fn delete_version(&self, name: &str, version: u64) -> Result<(), MvdbError> {
        self.delete_prefix(&version_prefix(name, version)).await
    }

    /// Removes every object of a table.
    pub async fn delete_table(&self, name: &str) -> Result<(), MvdbError> {
        self.delete_prefix(&Path::from(name)).await
    }

    /// Publishes `new` and removes `old`, leaving an intent behind so an
    /// interrupted rename can be finished by the next pull.
    pub async fn rename(&self, old: &TableMeta, new: &TableMeta) -> Result<(), MvdbError> {
        let intent = RenameIntent {
            to: new.name.clone(),
            version: new.version,
        };
        self.put_bytes(&intent_key(&old.name), Bytes::from(encode_json(&intent)?))
            .await?;
        self.push(None, new).await?;
        self.delete_table(&old.name).await
    }

    /// Makes the remote store mirror `tables`: each is pushed and remote
    /// tables not among them are deleted.
    pub async fn push_all(&self, tables: &[TableMeta]) -> Result<(), MvdbError> {
        let remote = self.remote_tables().await?;
        for meta in tables {
            if remote
                .get(&meta.key())
                .is_some_and(|existing| existing.version == meta.version)
            {
                continue;
            }
            let mut meta = meta.clone();
            if meta.kind == TableKind::Table && meta.files.is_empty() {
                meta.files = self.layout.checksum_version(&meta.name, meta.version)?;
                self.layout.write_table_meta(&meta)?;
            }
            self.push(remote.get(&meta.key()), &meta).await?;
        }
        for existing in remote.values() {
            if !tables.iter().any(|meta| meta.key() == existing.key()) {
                self.delete_table(&existing.name).await?;
            }
        }
        info!(tables = tables.len(), "pushed local tables");
        Ok(())
    }

    /// Deletes everything under the store's root.
    pub async fn wipe(&self) -> Result<(), MvdbError> {
        for location in self.list_prefix(&Path::default()).await? {
            self.delete_object(&location).await?;
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &Path) -> Result<Vec<Path>, MvdbError> {
        let store = &self.store;
        let prefix = (!prefix.as_ref().is_empty()).then_some(prefix);
        let objects = with_retry(self.retry, "list", || async move {
            store.list(prefix).try_collect::<Vec<_>>().await
        })
        .await;
        match objects {
            Ok(objects) => Ok(objects.into_iter().map(|meta| meta.location).collect()),
            Err(object_store::Error::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<(), MvdbError> {
        for location in self.list_prefix(prefix).await? {
            self.delete_object(&location).await?;
        }
        Ok(())
    }

    async fn delete_object(&self, path: &Path) -> Result<(), MvdbError> {
        let store = &self.store;
        match with_retry(self.retry, "delete", || async move { store.delete(path).await }).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_bytes(&self, path: &Path) -> Result<Option<Bytes>, MvdbError> {
        let store = &self.store;
        let result = with_retry(self.retry, "get", || async move {
            store.get(path).await?.bytes().await
        })
        .await;
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, MvdbError> {
        match self.get_bytes(path).await? {
            Some(bytes) => decode_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn put_bytes(&self, path: &Path, bytes: Bytes) -> Result<(), MvdbError> {
        let store = &self.store;
        with_retry(self.retry, "put", || {
            let payload = PutPayload::from(bytes.clone());
            async move { store.put(path, payload).await.map(|_| ()) }
        })
        .await?;
        Ok(())
    }
}
