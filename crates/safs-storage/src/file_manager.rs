//! Import front door for external flat files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::error::{StorageError, StorageResult};
use crate::io_engine::BlockDevice;
use crate::saf::{SafFile, Safs};

const IMPORT_CHUNK: usize = 1 << 20;

/// What to do when a logical name is imported twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportPolicy {
    /// Any re-import is a `DuplicateImport`.
    Reject,
    /// Re-importing identical contents succeeds without rewriting.
    Idempotent,
}

impl FromStr for ImportPolicy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(ImportPolicy::Reject),
            "idempotent" => Ok(ImportPolicy::Idempotent),
            _ => Err(StorageError::config(format!("unknown import_policy '{}'", s))),
        }
    }
}

impl fmt::Display for ImportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportPolicy::Reject => write!(f, "reject"),
            ImportPolicy::Idempotent => write!(f, "idempotent"),
        }
    }
}

/// Result of a successful `load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Logical name.
    pub name: String,
    /// Bytes in the logical file.
    pub size: u64,
    /// CRC32 of the contents.
    pub checksum: u32,
    /// True when an identical file was already registered.
    pub already_present: bool,
}

/// Registers external files as logical files.
pub struct FileManager<D> {
    safs: Safs<D>,
    policy: ImportPolicy,
}

impl<D: BlockDevice> FileManager<D> {
    /// Uses the data root's configured import policy.
    pub fn new(safs: Safs<D>) -> Self {
        let policy = safs.config().import_policy;
        Self { safs, policy }
    }

    /// Overrides the import policy.
    pub fn with_policy(mut self, policy: ImportPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The underlying data root.
    pub fn safs(&self) -> &Safs<D> {
        &self.safs
    }

    /// Imports `source` as the logical file `name`.
    ///
    /// On failure nothing stays registered under `name` unless it was
    /// registered before the call.
    pub async fn load(&self, source: impl AsRef<Path>, name: &str) -> StorageResult<ImportReport> {
        let source = source.as_ref();
        self.safs.config().validate_file_name(name)?;
        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(StorageError::SourceNotFound {
                    path: source.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::SourceNotFound {
                    path: source.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(entry) = self.safs.catalog().get(name) {
            if self.policy == ImportPolicy::Reject {
                return Err(StorageError::DuplicateImport {
                    name: name.to_string(),
                });
            }
            let (size, checksum) = fingerprint(source).await?;
            if entry.size == size && entry.checksum == Some(checksum) {
                info!("{} already holds {}, skipping import", name, source.display());
                return Ok(ImportReport {
                    name: name.to_string(),
                    size,
                    checksum,
                    already_present: true,
                });
            }
            return Err(StorageError::DuplicateImport {
                name: name.to_string(),
            });
        }

        self.import_new(source, name).await
    }

    /// Creates `name` and copies `source` into it. A concurrent import that
    /// registered `name` first wins and is left untouched.
    async fn import_new(&self, source: &Path, name: &str) -> StorageResult<ImportReport> {
        let file = self.safs.create(name).await?;
        match self.import(source, file).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!("Import of {} as {} failed: {}", source.display(), name, e);
                if let Err(cleanup) = self.safs.remove(name).await {
                    warn!("Could not remove partial import {}: {}", name, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn import(&self, source: &Path, file: SafFile<D>) -> StorageResult<ImportReport> {
        let name = file.name().to_string();
        let mut reader = tokio::fs::File::open(source).await?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; IMPORT_CHUNK];
        let mut offset = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write(offset, &buf[..n]).await?;
            offset += n as u64;
        }
        file.flush().await?;
        let checksum = hasher.finalize();
        let entry = file.seal_import(checksum)?;
        file.close().await?;

        info!(
            "Imported {} as {} ({} bytes, crc32 {:08x})",
            source.display(),
            name,
            entry.size,
            checksum
        );
        Ok(ImportReport {
            name,
            size: entry.size,
            checksum,
            already_present: false,
        })
    }

    /// Registered logical names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.safs.list()
    }

    /// Whether `name` is registered.
    pub fn exists(&self, name: &str) -> bool {
        self.safs.exists(name)
    }

    /// Unregisters `name` and deletes its data.
    pub async fn remove(&self, name: &str) -> StorageResult<()> {
        self.safs.remove(name).await
    }
}

async fn fingerprint(path: &Path) -> StorageResult<(u64, u32)> {
    let mut reader = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::SourceNotFound {
            path: PathBuf::from(path),
        },
        _ => e.into(),
    })?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; IMPORT_CHUNK];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize()))
}
