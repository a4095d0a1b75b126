use crate::catalog::types::{TableKind, TableMeta};
use crate::error::MvdbError;
use crate::manifest::atomic::{read_json, write_json_atomic};
use crate::manifest::schema::{REPLICATION_MARKER_FILE, ReplicationMarker};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const META_FILE: &str = "meta.json";
pub const DATA_FILE: &str = "data.db";

/// On-disk arrangement of the local directory:
///
/// ```text
/// <root>/replication.json
/// <root>/<table>/meta.json
/// <root>/<table>/<version>/data.db
/// ```
#[derive(Debug, Clone)]
pub struct LocalLayout {
    root: PathBuf,
}

/// Result of sweeping the local directory.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub live: Vec<TableMeta>,
    pub removed: Vec<PathBuf>,
}

impl LocalLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), MvdbError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn table_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn version_dir(&self, name: &str, version: u64) -> PathBuf {
        self.table_dir(name).join(version.to_string())
    }

    pub fn data_file(&self, name: &str, version: u64) -> PathBuf {
        self.version_dir(name, version).join(DATA_FILE)
    }

    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.table_dir(name).join(META_FILE)
    }

    pub fn read_table_meta(&self, name: &str) -> Result<Option<TableMeta>, MvdbError> {
        read_json(&self.meta_path(name))
    }

    pub fn write_table_meta(&self, meta: &TableMeta) -> Result<(), MvdbError> {
        write_json_atomic(&self.meta_path(&meta.name), meta)
    }

    pub fn mark_deleted(&self, meta: &TableMeta) -> Result<(), MvdbError> {
        let tombstone = TableMeta {
            deleted: true,
            ..meta.clone()
        };
        self.write_table_meta(&tombstone)
    }

    /// Every table directory with a readable `meta.json`, tombstones included.
    pub fn scan_table_metas(&self) -> Result<Vec<TableMeta>, MvdbError> {
        let mut metas = Vec::new();
        for name in self.table_dir_names()? {
            match self.read_table_meta(&name) {
                Ok(Some(meta)) => metas.push(meta),
                Ok(None) => {}
                Err(err) => warn!(table = %name, error = %err, "unreadable table metadata"),
            }
        }
        metas.sort_by_key(|meta| meta.key());
        Ok(metas)
    }

    fn table_dir_names(&self) -> Result<Vec<String>, MvdbError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Creates an empty directory for a new version. The directory is removed
    /// again unless the returned guard is disarmed.
    pub fn create_version_dir(
        &self,
        name: &str,
        version: u64,
    ) -> Result<VersionDirGuard, MvdbError> {
        let path = self.version_dir(name, version);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(VersionDirGuard { path, armed: true })
    }

    pub fn ensure_table_dir(&self, name: &str) -> Result<(), MvdbError> {
        fs::create_dir_all(self.table_dir(name))?;
        Ok(())
    }

    /// Copies every file of `from`'s version directory into the directory of
    /// `to_name`/`to_version`.
    pub fn copy_version_files(
        &self,
        from: &TableMeta,
        to_name: &str,
        to_version: u64,
    ) -> Result<(), MvdbError> {
        let source = self.version_dir(&from.name, from.version);
        let target = self.version_dir(to_name, to_version);
        fs::create_dir_all(&target)?;
        for entry in fs::read_dir(&source)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), target.join(entry.file_name()))?;
            }
        }
        Ok(())
    }

    pub fn version_files(
        &self,
        name: &str,
        version: u64,
    ) -> Result<Vec<(String, PathBuf)>, MvdbError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.version_dir(name, version))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn checksum_version(
        &self,
        name: &str,
        version: u64,
    ) -> Result<BTreeMap<String, String>, MvdbError> {
        let mut sums = BTreeMap::new();
        for (file, path) in self.version_files(name, version)? {
            sums.insert(file, sha256_file_hex(&path)?);
        }
        Ok(sums)
    }

    pub fn remove_version_dir(&self, name: &str, version: u64) -> Result<(), MvdbError> {
        remove_dir_if_exists(&self.version_dir(name, version))
    }

    pub fn remove_table_dir(&self, name: &str) -> Result<(), MvdbError> {
        remove_dir_if_exists(&self.table_dir(name))
    }

    /// Removes the table directory if its metadata is a tombstone or missing.
    /// Returns whether anything was removed.
    pub fn remove_dropped_table(&self, name: &str) -> Result<bool, MvdbError> {
        let dir = self.table_dir(name);
        if !dir.exists() {
            return Ok(false);
        }
        match self.read_table_meta(name) {
            Ok(Some(meta)) if !meta.deleted => Ok(false),
            _ => {
                remove_dir_if_exists(&dir)?;
                Ok(true)
            }
        }
    }

    /// Bytes of the data files of `meta`'s version; views have none.
    pub fn table_size(&self, meta: &TableMeta) -> u64 {
        if meta.kind != TableKind::Table {
            return 0;
        }
        self.version_files(&meta.name, meta.version)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|(_, path)| fs::metadata(path).ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Removes directories without valid metadata, dropped tables, and version
    /// directories other than the current one. Returns the surviving tables.
    pub fn prune(&self) -> Result<PruneReport, MvdbError> {
        let mut report = PruneReport::default();
        for name in self.table_dir_names()? {
            let dir = self.table_dir(&name);
            let meta = match self.read_table_meta(&name) {
                Ok(Some(meta)) if !meta.deleted => meta,
                Ok(_) | Err(_) => {
                    remove_dir_if_exists(&dir)?;
                    report.removed.push(dir);
                    continue;
                }
            };
            if meta.kind == TableKind::Table && !self.data_file(&meta.name, meta.version).exists() {
                warn!(
                    table = %meta.name,
                    version = meta.version,
                    "data file missing; dropping local table"
                );
                remove_dir_if_exists(&dir)?;
                report.removed.push(dir);
                continue;
            }
            let keep = match meta.kind {
                TableKind::Table => Some(meta.version.to_string()),
                TableKind::View => None,
            };
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().to_string();
                if file_name == META_FILE || keep.as_deref() == Some(file_name.as_str()) {
                    continue;
                }
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
                report.removed.push(path);
            }
            report.live.push(meta);
        }
        report.live.sort_by_key(|meta| meta.key());
        Ok(report)
    }

    /// Removes every table directory and the replication marker.
    pub fn wipe(&self) -> Result<(), MvdbError> {
        remove_dir_if_exists(&self.root)?;
        self.ensure_root()
    }

    pub fn read_marker(&self) -> Result<Option<ReplicationMarker>, MvdbError> {
        match read_json(&self.root.join(REPLICATION_MARKER_FILE)) {
            Ok(marker) => Ok(marker),
            Err(MvdbError::Decode(message)) => {
                warn!(%message, "ignoring corrupt replication marker");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn write_marker(&self, remote_enabled: bool) -> Result<(), MvdbError> {
        write_json_atomic(
            &self.root.join(REPLICATION_MARKER_FILE),
            &ReplicationMarker { remote_enabled },
        )
    }
}

/// Deletes a freshly created version directory on drop unless disarmed.
#[derive(Debug)]
pub struct VersionDirGuard {
    path: PathBuf,
    armed: bool,
}

impl VersionDirGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for VersionDirGuard {
    fn drop(&mut self) {
        if self.armed
            && let Err(err) = remove_dir_if_exists(&self.path)
        {
            warn!(path = %self.path.display(), error = %err, "failed to remove version directory");
        }
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), MvdbError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn sha256_file_hex(path: &Path) -> Result<String, MvdbError> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_string(hasher.finalize().as_slice()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_string(Sha256::digest(bytes).as_slice())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
