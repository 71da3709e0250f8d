//! appdrop library - declarative application installs
//!
//! This library provides:
//! - Configuration and install context resolution
//! - Archive fetching (HTTP(S), `file://`)
//! - Archive extraction and artifact lookup
//! - Install receipts and state detection
//! - The installer itself

pub mod config;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod installer;
pub mod receipt;
pub mod state;

pub use appdrop_common::{descriptor, integrity, paths};
pub use appdrop_common::{DescriptorError, InstallAction, IntegrityPolicy, PackageDescriptor};
pub use error::{FetchError, InstallError};
pub use installer::{InstallOptions, InstallOutcome, InstallStatus, Installer};
