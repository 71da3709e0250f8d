//! Installation State
//!
//! Decides, from the receipt alone, whether an install has anything to do.
//! Versions are free-form labels: they are compared for equality only.

use crate::receipt::InstallReceipt;
use appdrop_common::{paths, PackageDescriptor};
use std::path::{Path, PathBuf};

/// Installation state detected from receipts and the target root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallState {
    /// No receipt for this identifier
    Fresh,

    /// Same version installed and every artifact is in place
    Installed { receipt: InstallReceipt },

    /// A different version is installed
    VersionChanged {
        receipt: InstallReceipt,
        requested: String,
    },

    /// Receipt exists but artifacts are missing or live elsewhere
    Damaged {
        receipt: InstallReceipt,
        missing: Vec<PathBuf>,
    },
}

impl InstallState {
    /// Whether an install without `reinstall` can be skipped
    pub fn is_current(&self) -> bool {
        matches!(self, InstallState::Installed { .. })
    }

    pub fn receipt(&self) -> Option<&InstallReceipt> {
        match self {
            InstallState::Fresh => None,
            InstallState::Installed { receipt }
            | InstallState::VersionChanged { receipt, .. }
            | InstallState::Damaged { receipt, .. } => Some(receipt),
        }
    }
}

/// Expected canonical paths for a descriptor's artifacts under `target_root`
pub fn expected_artifacts(descriptor: &PackageDescriptor, target_root: &Path) -> Vec<PathBuf> {
    descriptor
        .install_actions()
        .iter()
        .map(|action| paths::install::artifact_path(target_root, action.artifact_name()))
        .collect()
}

/// Detect the installation state for a descriptor
pub fn detect_install_state(
    receipt: Option<InstallReceipt>,
    descriptor: &PackageDescriptor,
    target_root: &Path,
) -> InstallState {
    let receipt = match receipt {
        Some(receipt) => receipt,
        None => return InstallState::Fresh,
    };

    if receipt.version != descriptor.version() {
        return InstallState::VersionChanged {
            requested: descriptor.version().to_string(),
            receipt,
        };
    }

    // Same version: every expected artifact must be recorded and present
    let missing: Vec<PathBuf> = expected_artifacts(descriptor, target_root)
        .into_iter()
        .filter(|path| !receipt.artifacts.contains(path) || std::fs::symlink_metadata(path).is_err())
        .collect();

    if missing.is_empty() {
        InstallState::Installed { receipt }
    } else {
        InstallState::Damaged { receipt, missing }
    }
}
