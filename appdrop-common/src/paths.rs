//! Centralized Path Definitions
//!
//! Every location appdrop reads or writes is derived here, so installer,
//! receipts and CLI agree on the layout.

/// Where artifacts are placed
pub mod install {
    use std::path::PathBuf;

    /// System applications folder on macOS
    pub const MACOS_APPLICATIONS_DIR: &str = "/Applications";

    /// Default target root for application bundles
    ///
    /// `/Applications` on macOS, `~/Applications` elsewhere.
    pub fn default_target_root() -> PathBuf {
        if cfg!(target_os = "macos") {
            PathBuf::from(MACOS_APPLICATIONS_DIR)
        } else {
            dirs::home_dir()
                .map(|home| home.join("Applications"))
                .unwrap_or_else(|| PathBuf::from("Applications"))
        }
    }

    /// Canonical installed path of an artifact
    pub fn artifact_path(target_root: &std::path::Path, artifact_name: &str) -> PathBuf {
        target_root.join(artifact_name)
    }
}

/// Installer state (receipts)
pub mod state {
    use std::path::{Path, PathBuf};

    /// Default state directory (~/.local/share/appdrop on Linux)
    pub fn base_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join("appdrop"))
    }

    /// Directory holding one receipt per installed identifier
    pub fn receipts_dir(state_dir: &Path) -> PathBuf {
        state_dir.join("receipts")
    }

    /// Receipt file for an identifier
    pub fn receipt_path(state_dir: &Path, identifier: &str) -> PathBuf {
        receipts_dir(state_dir).join(format!("{}.json", identifier))
    }
}

/// User configuration
pub mod config {
    use std::path::PathBuf;

    pub const CONFIG_FILE_NAME: &str = "config.toml";

    /// Default config file (~/.config/appdrop/config.toml on Linux)
    pub fn config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("appdrop").join(CONFIG_FILE_NAME))
    }
}

/// Per-invocation staging directories inside the target root
pub mod staging {
    /// Hidden prefix so half-finished installs never look like artifacts
    pub const PREFIX: &str = ".appdrop-staging-";

    /// Whether a directory entry name belongs to a staging directory
    pub fn is_staging_name(name: &str) -> bool {
        name.starts_with(PREFIX)
    }
}

/// Safety validation for paths before deletion
pub mod safety {
    use std::path::Path;

    /// Validate that an installed artifact is safe to remove
    ///
    /// Returns true only if the path:
    /// - Sits directly inside the recorded target root
    /// - Is named exactly after the artifact
    /// - The target root is not the filesystem root
    pub fn is_safe_to_remove(path: &Path, target_root: &Path, artifact_name: &str) -> bool {
        if artifact_name.is_empty() || artifact_name == "." || artifact_name == ".." {
            return false;
        }

        if target_root.parent().is_none() {
            return false;
        }

        path.parent() == Some(target_root)
            && path.file_name().map(|n| n == artifact_name).unwrap_or(false)
    }
}
