//! Persistent registry of logical files.
//!
//! The catalog is a single JSON document at the data root recording, for
//! each logical file, its id, size, RAID layout and import checksum. It is
//! rewritten whole on every change through a temporary file and a rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CATALOG_FILE_NAME, CATALOG_TMP_NAME};
use crate::error::{StorageError, StorageResult};
use crate::page::FileId;
use crate::raid::RaidLayout;

/// One registered logical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Logical name, unique within the data root.
    pub name: String,
    /// Stable id used to address the file's parts and pages.
    pub id: FileId,
    /// Logical size in bytes.
    pub size: u64,
    /// Layout the file was written with.
    pub layout: RaidLayout,
    /// CRC32 of the imported source, cleared once the file is modified.
    pub checksum: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    next_id: u32,
    files: Vec<CatalogEntry>,
}

#[derive(Debug, Default)]
struct CatalogState {
    next_id: u32,
    entries: BTreeMap<String, CatalogEntry>,
}

/// Registry of logical files, optionally backed by a JSON file.
#[derive(Debug)]
pub struct Catalog {
    path: Option<PathBuf>,
    state: Mutex<CatalogState>,
    /// Serializes writers of the temporary file.
    persisting: Mutex<()>,
}

/// Rejects names that cannot be used as a part file name on every device.
pub fn validate_name(name: &str) -> StorageResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name == "." || name == ".." {
        Some("name is a relative path component")
    } else if name.contains(['/', '\\', '\0']) {
        Some("name contains a path separator or NUL")
    } else if name.starts_with('.') {
        Some("name starts with '.'")
    } else if name == CATALOG_FILE_NAME || name == CATALOG_TMP_NAME {
        Some("name is reserved for the catalog")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StorageError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

impl Catalog {
    /// A catalog that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(CatalogState {
                next_id: 1,
                entries: BTreeMap::new(),
            }),
            persisting: Mutex::new(()),
        }
    }

    /// Loads the catalog at `path`, or starts an empty one if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<CatalogDocument>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogDocument::default(),
            Err(e) => return Err(e.into()),
        };

        let mut entries = BTreeMap::new();
        let mut next_id = doc.next_id.max(1);
        for entry in doc.files {
            next_id = next_id.max(entry.id.0 + 1);
            entries.insert(entry.name.clone(), entry);
        }
        info!(
            "Opened catalog {} with {} logical files",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path: Some(path),
            state: Mutex::new(CatalogState { next_id, entries }),
            persisting: Mutex::new(()),
        })
    }

    /// Location of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Looks up a file by name.
    pub fn get(&self, name: &str) -> Option<CatalogEntry> {
        self.state.lock().entries.get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().entries.contains_key(name)
    }

    /// Registers a new empty file and assigns it an id.
    pub fn register(&self, name: &str, layout: RaidLayout) -> StorageResult<CatalogEntry> {
        validate_name(name)?;
        let mut state = self.state.lock();
        if state.entries.contains_key(name) {
            return Err(StorageError::DuplicateImport {
                name: name.to_string(),
            });
        }
        let entry = CatalogEntry {
            name: name.to_string(),
            id: FileId(state.next_id),
            size: 0,
            layout,
            checksum: None,
        };
        state.next_id += 1;
        state.entries.insert(name.to_string(), entry.clone());
        debug!("Registered {} as {}", name, entry.id);
        Ok(entry)
    }

    /// Applies `f` to a registered entry.
    pub fn update<F>(&self, name: &str, f: F) -> StorageResult<CatalogEntry>
    where
        F: FnOnce(&mut CatalogEntry),
    {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound {
                name: name.to_string(),
            })?;
        f(entry);
        Ok(entry.clone())
    }

    /// Unregisters a file.
    pub fn remove(&self, name: &str) -> Option<CatalogEntry> {
        self.state.lock().entries.remove(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Number of registered files.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no file is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the catalog to disk. A no-op for in-memory catalogs.
    pub fn persist(&self) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _writer = self.persisting.lock();
        let text = {
            let state = self.state.lock();
            let doc = CatalogDocument {
                next_id: state.next_id,
                files: state.entries.values().cloned().collect(),
            };
            serde_json::to_string_pretty(&doc)?
        };
        let tmp = path.with_file_name(CATALOG_TMP_NAME);
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        debug!("Persisted catalog {}", path.display());
        Ok(())
    }
}
