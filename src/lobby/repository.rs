//! Durable storage of lobby records
//!
//! Synchronous by design of the callers: the manager persists while holding a
//! lobby's lock, so saves for one lobby never interleave.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::record::LobbyRecord;

const RECORD_FILE: &str = "lobby.json";
const BACKUP_FILE: &str = "lobby.json.bak";

/// Keyed store of lobby records
pub trait LobbyRepository: Send + Sync {
    fn load(&self, id: Uuid) -> Result<Option<LobbyRecord>, RepositoryError>;

    fn save(&self, record: &LobbyRecord) -> Result<(), RepositoryError>;

    /// Returns false if nothing was stored under `id`
    fn delete(&self, id: Uuid) -> Result<bool, RepositoryError>;

    fn enumerate(&self) -> Result<Vec<LobbyRecord>, RepositoryError>;

    fn list_public(&self) -> Result<Vec<LobbyRecord>, RepositoryError> {
        Ok(self
            .enumerate()?
            .into_iter()
            .filter(|record| !record.is_private)
            .collect())
    }
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RepositoryError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-process repository, lost on exit
#[derive(Debug, Default)]
pub struct MemoryLobbyRepository {
    records: RwLock<HashMap<Uuid, LobbyRecord>>,
}

impl MemoryLobbyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LobbyRepository for MemoryLobbyRepository {
    fn load(&self, id: Uuid) -> Result<Option<LobbyRecord>, RepositoryError> {
        Ok(self.records.read().get(&id).cloned())
    }

    fn save(&self, record: &LobbyRecord) -> Result<(), RepositoryError> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.records.write().remove(&id).is_some())
    }

    fn enumerate(&self) -> Result<Vec<LobbyRecord>, RepositoryError> {
        Ok(self.records.read().values().cloned().collect())
    }
}

/// One pretty-printed JSON document per lobby at `{root}/{id}/lobby.json`
#[derive(Debug, Clone)]
pub struct JsonFileLobbyRepository {
    root: PathBuf,
}

impl JsonFileLobbyRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn lobby_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn read_record(path: &Path) -> Result<LobbyRecord, RepositoryError> {
        let raw = fs::read_to_string(path).map_err(|e| RepositoryError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl LobbyRepository for JsonFileLobbyRepository {
    fn load(&self, id: Uuid) -> Result<Option<LobbyRecord>, RepositoryError> {
        let path = self.lobby_dir(id).join(RECORD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn save(&self, record: &LobbyRecord) -> Result<(), RepositoryError> {
        let dir = self.lobby_dir(record.id);
        fs::create_dir_all(&dir).map_err(|e| RepositoryError::io(&dir, e))?;

        let path = dir.join(RECORD_FILE);
        let backup = dir.join(BACKUP_FILE);
        let document = serde_json::to_string_pretty(record)?;

        let has_backup = path.exists();
        if has_backup {
            fs::copy(&path, &backup).map_err(|e| RepositoryError::io(&backup, e))?;
        }

        if let Err(e) = fs::write(&path, document) {
            if has_backup {
                if let Err(restore) = fs::copy(&backup, &path) {
                    warn!(lobby = %record.id, "Failed to restore lobby backup: {}", restore);
                }
            }
            return Err(RepositoryError::io(&path, e));
        }

        debug!(lobby = %record.id, "Saved lobby to {}", path.display());
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let dir = self.lobby_dir(id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|e| RepositoryError::io(&dir, e))?;
        Ok(true)
    }

    fn enumerate(&self) -> Result<Vec<LobbyRecord>, RepositoryError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.root).map_err(|e| RepositoryError::io(&self.root, e))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RepositoryError::io(&self.root, e))?;
            let path = entry.path().join(RECORD_FILE);
            if !path.is_file() {
                continue;
            }

            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                // One corrupt document must not hide the others
                Err(e) => warn!("Skipping unreadable lobby {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::record::GameConfiguration;

    fn scratch_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lobby-repo-{}-{}", label, Uuid::new_v4()))
    }

    fn record(name: &str, is_private: bool) -> LobbyRecord {
        LobbyRecord::new(name, is_private, "owner", GameConfiguration::default())
    }

    #[test]
    fn test_memory_repository() {
        let repo = MemoryLobbyRepository::new();
        let public = record("a", false);
        let private = record("b", true);
        repo.save(&public).unwrap();
        repo.save(&private).unwrap();

        assert_eq!(repo.load(public.id).unwrap(), Some(public.clone()));
        assert_eq!(repo.enumerate().unwrap().len(), 2);
        assert_eq!(repo.list_public().unwrap(), vec![public.clone()]);

        assert!(repo.delete(public.id).unwrap());
        assert!(!repo.delete(public.id).unwrap());
        assert_eq!(repo.load(public.id).unwrap(), None);
    }

    #[test]
    fn test_json_repository_round_trip() {
        let root = scratch_dir("round-trip");
        let repo = JsonFileLobbyRepository::new(&root);
        let mut stored = record("trains", true);
        stored.add_member("u2");

        repo.save(&stored).unwrap();
        assert!(root.join(stored.id.to_string()).join(RECORD_FILE).is_file());
        assert_eq!(repo.load(stored.id).unwrap(), Some(stored.clone()));

        // Second save leaves a backup of the first
        stored.name = "renamed".into();
        repo.save(&stored).unwrap();
        let backup = root.join(stored.id.to_string()).join(BACKUP_FILE);
        let previous: LobbyRecord = serde_json::from_str(&fs::read_to_string(backup).unwrap()).unwrap();
        assert_eq!(previous.name, "trains");
        assert_eq!(repo.load(stored.id).unwrap().unwrap().name, "renamed");

        assert!(repo.delete(stored.id).unwrap());
        assert_eq!(repo.load(stored.id).unwrap(), None);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_json_repository_skips_corrupt_documents() {
        let root = scratch_dir("corrupt");
        let repo = JsonFileLobbyRepository::new(&root);
        let good = record("good", false);
        repo.save(&good).unwrap();

        let broken = root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(RECORD_FILE), "{ not json").unwrap();

        let records = repo.enumerate().unwrap();
        assert_eq!(records, vec![good]);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_json_repository_missing_root() {
        let repo = JsonFileLobbyRepository::new(scratch_dir("missing"));
        assert!(repo.enumerate().unwrap().is_empty());
        assert!(!repo.delete(Uuid::new_v4()).unwrap());
    }
}
