//! Install Receipts
//!
//! One JSON receipt per installed identifier records what was placed where,
//! so "which version is installed" never needs the network and uninstall
//! knows exactly what to remove.

use crate::error::{InstallError, IoResultExt};
use appdrop_common::descriptor::validate_identifier;
use appdrop_common::{paths, DescriptorError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// Receipt data for an installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    /// Package identifier (e.g., "comet")
    pub identifier: String,

    /// Version that was installed
    pub version: String,

    /// Display name at install time
    #[serde(default)]
    pub name: Option<String>,

    /// Host the archive came from
    pub source_host: String,

    /// SHA-256 of the archive if it was verified, None when verification was skipped
    #[serde(default)]
    pub verified_sha256: Option<String>,

    /// Target root the artifacts were placed in
    pub target_root: PathBuf,

    /// Installed artifact paths, in install-action order
    pub artifacts: Vec<PathBuf>,

    /// Timestamp of installation
    pub installed_at: String,
}

impl InstallReceipt {
    /// Recorded artifacts that are no longer on disk
    pub fn missing_artifacts(&self) -> Vec<PathBuf> {
        self.artifacts
            .iter()
            .filter(|p| std::fs::symlink_metadata(p).is_err())
            .cloned()
            .collect()
    }
}

/// Receipt storage rooted at `<state_dir>/receipts`
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    state_dir: PathBuf,
}

impl ReceiptStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        paths::state::receipts_dir(&self.state_dir)
    }

    /// Receipt file for an identifier; rejects anything that is not a plain file name
    pub fn path(&self, identifier: &str) -> Result<PathBuf, DescriptorError> {
        validate_identifier(identifier)?;
        Ok(paths::state::receipt_path(&self.state_dir, identifier))
    }

    /// Save a receipt atomically (temp file in the same directory, then rename)
    pub fn save(&self, receipt: &InstallReceipt) -> Result<PathBuf, InstallError> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir).at_path(&dir)?;

        let path = self.path(&receipt.identifier)?;
        let json = serde_json::to_vec_pretty(receipt)
            .map_err(|e| InstallError::filesystem(&path, std::io::Error::other(e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).at_path(&dir)?;
        tmp.write_all(&json).at_path(tmp.path())?;
        tmp.as_file().sync_all().at_path(tmp.path())?;
        tmp.persist(&path).map_err(|e| InstallError::filesystem(&path, e.error))?;

        tracing::debug!("Saved receipt to {:?}", path);
        Ok(path)
    }

    /// Load a receipt; a missing or unreadable one is reported as None
    pub fn load(&self, identifier: &str) -> Result<Option<InstallReceipt>, InstallError> {
        let path = match self.path(identifier) {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!("No receipt lookup for {:?}: {}", identifier, e);
                return Ok(None);
            }
        };

        let json = match std::fs::read(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(InstallError::filesystem(&path, e)),
        };

        match serde_json::from_slice::<InstallReceipt>(&json) {
            Ok(receipt) => Ok(Some(receipt)),
            Err(e) => {
                tracing::warn!("Ignoring corrupt receipt {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    /// Delete the receipt for an identifier (no-op if absent)
    pub fn delete(&self, identifier: &str) -> Result<(), InstallError> {
        let Ok(path) = self.path(identifier) else {
            return Ok(());
        };

        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Deleted receipt {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InstallError::filesystem(&path, e)),
        }
    }

    /// All readable receipts, sorted by identifier
    pub fn list(&self) -> Result<Vec<InstallReceipt>, InstallError> {
        let dir = self.dir();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(InstallError::filesystem(&dir, e)),
        };

        let mut receipts = Vec::new();
        for entry in entries {
            let path = entry.at_path(&dir)?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    if let Some(receipt) = self.load(&stem.to_string_lossy())? {
                        receipts.push(receipt);
                    }
                }
            }
        }

        receipts.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(receipts)
    }
}

/// Install timestamp in the `unix:<secs>` receipt format
pub fn timestamp_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!("unix:{}", duration.as_secs())
}
