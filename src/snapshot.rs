use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fingerprint::{fingerprint, is_valid_digest};

pub const SCHEMA_VERSION: u32 = 1;

/// Last observed content of the target and its fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schema_version: u32,
    pub captured_at: DateTime<Utc>,
    pub content: String,
    pub digest: String,
}

impl Snapshot {
    pub fn new(content: String, captured_at: DateTime<Utc>) -> Self {
        let digest = fingerprint(&content);
        Self {
            schema_version: SCHEMA_VERSION,
            captured_at,
            content,
            digest,
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Read { path: PathBuf, source: io::Error },
    Write { path: PathBuf, source: io::Error },
    SerdeJson(serde_json::Error),
    DigestMismatch { expected: String, got: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "read {}: {source}", path.display()),
            Self::Write { path, source } => write!(f, "write {}: {source}", path.display()),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::DigestMismatch { expected, got } => {
                write!(f, "digest does not match content: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => Some(source),
            Self::SerdeJson(e) => Some(e),
            Self::DigestMismatch { .. } => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

/// Durable holder of the single latest [`Snapshot`].
///
/// Callers guarantee a single writer; implementations do no locking of their own.
pub trait SnapshotStore: Send {
    /// Returns `Ok(None)` when nothing usable has been persisted yet.
    fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Replaces the persisted snapshot. Readers see either the old or the new record.
    fn save(
        &mut self,
        content: &str,
        digest: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Snapshot, StoreError>;
}

pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    /// Opens the store at `path`, creating its parent directory if missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match decode_snapshot(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(reason) => {
                warn!(
                    path = %self.path.display(),
                    %reason,
                    "ignoring unusable snapshot; treating baseline as absent"
                );
                Ok(None)
            }
        }
    }

    fn save(
        &mut self,
        content: &str,
        digest: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Snapshot, StoreError> {
        let snapshot = Snapshot::new(content.to_string(), captured_at);
        if snapshot.digest != digest {
            return Err(StoreError::DigestMismatch {
                expected: snapshot.digest,
                got: digest.to_string(),
            });
        }

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.path, &bytes).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), digest = %snapshot.digest, "snapshot saved");
        Ok(snapshot)
    }
}

fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, String> {
    let snapshot: Snapshot =
        serde_json::from_slice(bytes).map_err(|e| format!("parse snapshot: {e}"))?;
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(format!(
            "schemaVersion mismatch: expected {SCHEMA_VERSION}, got {}",
            snapshot.schema_version
        ));
    }
    if !is_valid_digest(&snapshot.digest) {
        return Err("digest is not a sha256 hex string".to_string());
    }
    if fingerprint(&snapshot.content) != snapshot.digest {
        return Err("digest does not match content".to_string());
    }
    Ok(snapshot)
}

pub(crate) fn tmp_path_next_to(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("snapshot"));
    parent.join(format!(
        ".{}.tmp.{}",
        file.to_string_lossy(),
        std::process::id()
    ))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = tmp_path_next_to(path);
    let result = (|| {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
