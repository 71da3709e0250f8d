//! Installer error taxonomy
//!
//! Every failure carries enough context (identifier, version, URL host) to
//! retry by hand. The CLI maps each kind to a distinct exit code.

use appdrop_common::descriptor::DescriptorError;
use appdrop_common::PackageDescriptor;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Identifies the package an error is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub identifier: String,
    pub version: String,
    /// Host part of the source URL ("local" for file:// sources)
    pub host: String,
}

impl PackageRef {
    pub fn from_descriptor(descriptor: &PackageDescriptor) -> Self {
        Self {
            identifier: descriptor.identifier().to_string(),
            version: descriptor.version().to_string(),
            host: url_host(descriptor.url()),
        }
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (from {})", self.identifier, self.version, self.host)
    }
}

/// Host of a descriptor URL, without credentials, port or query
pub fn url_host(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => "local".to_string(),
        Ok(parsed) => parsed.host_str().unwrap_or("unknown").to_string(),
        Err(_) => "unknown".to_string(),
    }
}

/// Why the archive could not be retrieved
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("the download link has expired; refresh the descriptor's url and retry")]
    Expired,

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("nothing found at the source location")]
    NotFound,

    #[error("download did not finish within {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Whether retrying later (or with a refreshed URL) can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::NotFound)
    }
}

/// Filesystem failure classes worth telling apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemError {
    PermissionDenied,
    NoSpace,
    Other,
}

impl FilesystemError {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => FilesystemError::PermissionDenied,
            io::ErrorKind::StorageFull => FilesystemError::NoSpace,
            _ => FilesystemError::Other,
        }
    }
}

impl fmt::Display for FilesystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilesystemError::PermissionDenied => write!(f, "permission denied"),
            FilesystemError::NoSpace => write!(f, "no space left on device"),
            FilesystemError::Other => write!(f, "I/O error"),
        }
    }
}

/// Main error type for install operations
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(#[from] DescriptorError),

    #[error("failed to fetch {package}: {kind}")]
    Fetch { package: PackageRef, kind: FetchError },

    #[error("integrity check failed for {package}: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch {
        package: PackageRef,
        expected: String,
        actual: String,
    },

    #[error("artifact '{artifact}' not found in the archive for {package}")]
    ArtifactNotFound { package: PackageRef, artifact: String },

    #[error("cannot unpack the archive for {package}: {reason}")]
    Archive { package: PackageRef, reason: String },

    #[error("{kind} at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        kind: FilesystemError,
        #[source]
        source: io::Error,
    },

    #[error(
        "{package} disables integrity verification; \
         pass --allow-unverified (or set security.allow_unverified) to trust it anyway"
    )]
    UnverifiedNotAllowed { package: PackageRef },

    #[error("'{identifier}' is not installed")]
    NotInstalled { identifier: String },
}

impl InstallError {
    /// Wrap an I/O error with the path it happened at
    pub fn filesystem(path: impl AsRef<Path>, source: io::Error) -> Self {
        InstallError::Filesystem {
            path: path.as_ref().to_path_buf(),
            kind: FilesystemError::classify(&source),
            source,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> u8 {
        match self {
            InstallError::MalformedDescriptor(_) => 2,
            InstallError::Fetch { .. } => 3,
            InstallError::IntegrityMismatch { .. } => 4,
            InstallError::ArtifactNotFound { .. } | InstallError::Archive { .. } => 5,
            InstallError::Filesystem { .. } => 6,
            InstallError::UnverifiedNotAllowed { .. } => 7,
            InstallError::NotInstalled { .. } => 8,
        }
    }
}

/// Extension for attaching a path to raw I/O results
pub trait IoResultExt<T> {
    fn at_path(self, path: impl AsRef<Path>) -> Result<T, InstallError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at_path(self, path: impl AsRef<Path>) -> Result<T, InstallError> {
        self.map_err(|e| InstallError::filesystem(path, e))
    }
}
