//! Persistence for identification keys.
//!
//! The proxy only remembers an association by its name and our identification
//! public key. Losing the secret half means the user has to approve a new
//! association, so records are written atomically.

use kpx_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// One association as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAssociation {
    /// Database hash reported by the proxy.
    pub database_id: String,
    /// Association name chosen by the user in the proxy's dialog.
    pub name: String,
    /// Identification secret key, standard base64.
    pub id_key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    associations: Vec<StoredAssociation>,
}

pub trait AssociationStore: Send + Sync {
    fn load(&self) -> Result<Vec<StoredAssociation>>;
    fn save(&self, records: &[StoredAssociation]) -> Result<()>;
}

/// JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::File::create(path)
}

impl AssociationStore for JsonFileStore {
    fn load(&self) -> Result<Vec<StoredAssociation>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::store(format!("{}: {}", self.path.display(), e))),
        };
        let file: StoreFile = serde_json::from_slice(&data)
            .map_err(|e| Error::store(format!("{}: {}", self.path.display(), e)))?;
        debug!(
            count = file.associations.len(),
            "loaded associations from {}",
            self.path.display()
        );
        Ok(file.associations)
    }

    fn save(&self, records: &[StoredAssociation]) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::store(format!("{}: {}", dir.display(), e)))?;
        }

        let body = serde_json::to_vec_pretty(&StoreFile {
            associations: records.to_vec(),
        })
        .map_err(Error::store)?;

        let tmp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = create_private(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::store(format!("{}: {}", self.path.display(), e))
        })?;

        debug!(count = records.len(), "saved associations to {}", self.path.display());
        Ok(())
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredAssociation>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<StoredAssociation>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: Mutex::new(0),
        }
    }

    /// Snapshot of what was last saved.
    pub fn snapshot(&self) -> Vec<StoredAssociation> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AssociationStore for MemoryStore {
    fn load(&self) -> Result<Vec<StoredAssociation>> {
        Ok(self.snapshot())
    }

    fn save(&self, records: &[StoredAssociation]) -> Result<()> {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records.to_vec();
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
