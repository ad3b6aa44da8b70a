//! JSON file registry
//! Stores every record in one pretty-printed array. Each mutation loads the
//! whole file, edits it and renames a fresh copy into place, holding both an
//! in-process mutex and an advisory lock on `<path>.lock`.

use chrono::Utc;
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::{DomainRecord, Registry, RegistryError};
use crate::lock::{lock_path_for, FileLock};

pub struct JsonFileRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    // Threads of this process queue here before contending for the file lock
    write_lock: Mutex<()>,
}

impl JsonFileRegistry {
    /// Open a registry at `path`, creating an empty one if it does not exist
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let registry = Self {
            lock_path: lock_path_for(&path),
            path,
            write_lock: Mutex::new(()),
        };

        if !registry.path.exists() {
            let _file_lock = FileLock::acquire(&registry.lock_path)?;
            // Another process may have created it while we waited
            if !registry.path.exists() {
                registry.persist(&[])?;
                info!("Created empty registry at {}", registry.path.display());
            }
        }

        Ok(registry)
    }

    fn load(&self) -> Result<Vec<DomainRecord>, RegistryError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&raw)?)
    }

    fn persist(&self, records: &[DomainRecord]) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let payload = serde_json::to_vec_pretty(records)?;
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        fs::write(&temp_path, payload)?;
        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!("Persisted {} record(s) to {}", records.len(), self.path.display());
        Ok(())
    }
}

impl Registry for JsonFileRegistry {
    fn list_all(&self) -> Result<Vec<DomainRecord>, RegistryError> {
        self.load()
    }

    fn get(&self, name: &str) -> Result<Option<DomainRecord>, RegistryError> {
        Ok(self.load()?.into_iter().find(|r| r.name == name))
    }

    fn upsert(&self, mut record: DomainRecord) -> Result<DomainRecord, RegistryError> {
        let _guard = self.write_lock.lock();
        let _file_lock = FileLock::acquire(&self.lock_path)?;
        let mut records = self.load()?;

        record.updated_at = Utc::now();

        match records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => {
                record.created_at = existing.created_at;
                *existing = record.clone();
            }
            None => records.push(record.clone()),
        }

        self.persist(&records)?;
        Ok(record)
    }

    fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock();
        let _file_lock = FileLock::acquire(&self.lock_path)?;
        let mut records = self.load()?;

        let before = records.len();
        records.retain(|r| r.name != name);
        if records.len() == before {
            return Ok(false);
        }

        self.persist(&records)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_creates_empty_registry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("domains.json");
        let registry = JsonFileRegistry::new(&path).unwrap();

        assert!(path.exists());
        assert!(registry.list_all().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "[]");
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::new(dir.path().join("domains.json")).unwrap();

        let first = registry.upsert(DomainRecord::new("a.example.com", "blog")).unwrap();

        let mut replacement = DomainRecord::new("a.example.com", "news");
        replacement.active = true;
        let second = registry.upsert(replacement).unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);

        let stored = registry.get("a.example.com").unwrap().unwrap();
        assert_eq!(stored.subfolder, "news");
        assert!(stored.active);
        assert_eq!(registry.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_keeps_insertion_order() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::new(dir.path().join("domains.json")).unwrap();

        for name in ["c.example.com", "a.example.com", "b.example.com"] {
            registry.upsert(DomainRecord::new(name, "x")).unwrap();
        }
        registry.upsert(DomainRecord::new("a.example.com", "y")).unwrap();

        let names: Vec<String> = registry.list_all().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["c.example.com", "a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::new(dir.path().join("domains.json")).unwrap();
        registry.upsert(DomainRecord::new("a.example.com", "blog")).unwrap();

        assert!(registry.remove("a.example.com").unwrap());
        assert!(!registry.remove("a.example.com").unwrap());
        assert!(registry.get("a.example.com").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("domains.json");
        fs::write(&path, "{not json").unwrap();
        let registry = JsonFileRegistry::new(&path).unwrap();

        assert!(matches!(registry.list_all(), Err(RegistryError::Json(_))));
        assert!(registry.upsert(DomainRecord::new("a.example.com", "x")).is_err());
        // The broken file is left for an operator to inspect
        assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::new(dir.path().join("domains.json")).unwrap();
        registry.upsert(DomainRecord::new("a.example.com", "blog")).unwrap();
        registry.remove("a.example.com").unwrap();

        let leftovers: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
    }

    #[test]
    fn test_concurrent_upserts_are_not_lost() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(JsonFileRegistry::new(dir.path().join("domains.json")).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .upsert(DomainRecord::new(format!("site{}.example.com", i), "x"))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.list_all().unwrap().len(), 16);
    }

    #[test]
    fn test_separate_handles_on_one_file_do_not_lose_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("domains.json");
        let first = Arc::new(JsonFileRegistry::new(&path).unwrap());
        let second = Arc::new(JsonFileRegistry::new(&path).unwrap());

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let registry = if i % 2 == 0 { first.clone() } else { second.clone() };
                std::thread::spawn(move || {
                    registry
                        .upsert(DomainRecord::new(format!("site{}.example.com", i), "x"))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(first.list_all().unwrap().len(), 40);
        assert_eq!(JsonFileRegistry::new(&path).unwrap().list_all().unwrap().len(), 40);
    }
}
