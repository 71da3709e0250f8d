//! appdrop Common Library
//!
//! Shared modules for the installer and its CLI.
//! This crate has NO async or network dependencies.

pub mod descriptor;
pub mod integrity;
pub mod paths;

pub use descriptor::{DescriptorError, InstallAction, IntegrityPolicy, PackageDescriptor};
