//! Installer - descriptor-driven installation logic
//!
//! Fetches the archive a descriptor points at, verifies it (or reports the
//! explicit decision not to), unpacks it into a staging directory inside the
//! target root and renames each artifact into its canonical path.
//!
//! Nothing touches the target root until the archive has been fetched and
//! verified, and the canonical path only ever changes through `rename`, so an
//! interrupted install never leaves a half-written artifact visible.

use crate::config::InstallContext;
use crate::error::{FetchError, InstallError, IoResultExt, PackageRef};
use crate::extractor::{self, ArchiveFormat, ExtractError};
use crate::fetcher::Fetcher;
use crate::receipt::{self, InstallReceipt, ReceiptStore};
use crate::state::{self, InstallState};
use appdrop_common::paths::{self, safety};
use appdrop_common::{integrity, IntegrityPolicy, PackageDescriptor};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;

/// Per-invocation install settings
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Overwrite an install of the same version instead of skipping it
    pub reinstall: bool,

    /// Fetch deadline (defaults to the context's fetch timeout)
    pub timeout: Option<Duration>,
}

/// What an install did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    /// Nothing was installed before
    Installed,
    /// Same version was replaced (explicit reinstall or repair)
    Reinstalled,
    /// A different version was replaced
    Upgraded,
    /// Same version already in place; nothing fetched
    AlreadyInstalled,
}

/// Result of a successful install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub identifier: String,
    pub version: String,
    /// Final artifact paths, in install-action order
    pub paths: Vec<PathBuf>,
    pub status: InstallStatus,
    /// Digest of the archive when it was verified
    pub verified_sha256: Option<String>,
}

/// Result of a successful uninstall
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallOutcome {
    pub identifier: String,
    pub version: String,
    pub removed: Vec<PathBuf>,
}

/// Fetched archive bytes after the integrity step
#[derive(Debug)]
pub struct FetchedArchive {
    pub bytes: Vec<u8>,
    /// Digest that matched the descriptor; None when verification was skipped
    pub verified_sha256: Option<String>,
}

/// Progress notifications for front-ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    AlreadyInstalled { version: String },
    Fetching { host: String },
    Fetched { bytes: u64 },
    DigestVerified { sha256: String },
    /// Emitted exactly once per fetch of a descriptor with `policy = "skip"`
    VerificationSkipped { identifier: String },
    Extracting { format: ArchiveFormat },
    Placed { path: PathBuf },
    Removed { path: PathBuf },
}

/// Descriptor-driven installer
pub struct Installer<F> {
    fetcher: F,
    context: InstallContext,
    receipts: ReceiptStore,
    events: Option<mpsc::UnboundedSender<InstallEvent>>,
}

impl<F: Fetcher> Installer<F> {
    pub fn new(fetcher: F, context: InstallContext) -> Self {
        let receipts = ReceiptStore::new(&context.state_dir);
        Self {
            fetcher,
            context,
            receipts,
            events: None,
        }
    }

    /// Send progress events to `tx`
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<InstallEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Install a descriptor into the context's target root
    pub async fn install(
        &self,
        descriptor: PackageDescriptor,
        options: &InstallOptions,
    ) -> Result<InstallOutcome, InstallError> {
        let package = PackageRef::from_descriptor(&descriptor);
        self.check_trust(&descriptor, &package)?;

        let target_root = &self.context.target_root;
        let existing = self.receipts.load(descriptor.identifier())?;
        let state = state::detect_install_state(existing, &descriptor, target_root);

        if state.is_current() && !options.reinstall {
            if let Some(receipt) = state.receipt() {
                tracing::info!(
                    "{} v{} is already installed; skipping (use --reinstall to overwrite)",
                    descriptor.identifier(),
                    receipt.version
                );
                self.emit(InstallEvent::AlreadyInstalled {
                    version: receipt.version.clone(),
                });
                return Ok(InstallOutcome {
                    identifier: receipt.identifier.clone(),
                    version: receipt.version.clone(),
                    paths: receipt.artifacts.clone(),
                    status: InstallStatus::AlreadyInstalled,
                    verified_sha256: receipt.verified_sha256.clone(),
                });
            }
        }

        let status = match &state {
            InstallState::Fresh => InstallStatus::Installed,
            InstallState::Installed { .. } => InstallStatus::Reinstalled,
            InstallState::Damaged { missing, .. } => {
                tracing::info!(
                    "Repairing {}: {} artifact(s) missing or placed elsewhere",
                    descriptor.identifier(),
                    missing.len()
                );
                InstallStatus::Reinstalled
            }
            InstallState::VersionChanged { receipt, requested } => {
                tracing::info!(
                    "Replacing {} v{} with v{}",
                    descriptor.identifier(),
                    receipt.version,
                    requested
                );
                InstallStatus::Upgraded
            }
        };

        let archive = self.fetch_verified(&descriptor, &package, options).await?;
        let format = extractor::detect_format(&archive.bytes, descriptor.url())
            .ok_or_else(|| archive_error(&package, ExtractError::UnknownFormat))?;

        // First filesystem side effect: staging lives inside the target root so
        // the final rename never crosses filesystems
        fs::create_dir_all(target_root).await.at_path(target_root)?;
        let staging = tempfile::Builder::new()
            .prefix(paths::staging::PREFIX)
            .tempdir_in(target_root)
            .at_path(target_root)?;

        self.emit(InstallEvent::Extracting { format });
        let staged = self
            .unpack(&descriptor, &package, archive.bytes, format, staging.path())
            .await?;

        let mut placements: Vec<Placement> = Vec::with_capacity(staged.len());
        for (staged_path, artifact_name) in staged {
            let final_path = paths::install::artifact_path(target_root, &artifact_name);
            let parked = match place_atomically(&staged_path, &final_path, staging.path()).await {
                Ok(parked) => parked,
                Err(err) => {
                    // Earlier artifacts go back to their previous state so the
                    // receipt on disk stays truthful
                    let rolled_back = roll_back(&placements, staging.path()).await;
                    if !rolled_back || err.is_stranded() {
                        let kept = staging.keep();
                        tracing::error!("Previous artifacts were left in {:?}", kept);
                    }
                    return Err(err.into_install_error(&final_path));
                }
            };

            tracing::info!("Placed {:?}", final_path);
            self.emit(InstallEvent::Placed {
                path: final_path.clone(),
            });
            placements.push(Placement { final_path, parked });
        }
        let placed: Vec<PathBuf> = placements.into_iter().map(|p| p.final_path).collect();

        if let Some(previous) = state.receipt() {
            self.remove_stale_artifacts(previous, &placed).await;
        }

        if let Err(e) = staging.close() {
            tracing::warn!("Could not clean up staging directory: {}", e);
        }

        let receipt = InstallReceipt {
            identifier: descriptor.identifier().to_string(),
            version: descriptor.version().to_string(),
            name: descriptor.name().map(str::to_string),
            source_host: package.host.clone(),
            verified_sha256: archive.verified_sha256.clone(),
            target_root: target_root.clone(),
            artifacts: placed.clone(),
            installed_at: receipt::timestamp_now(),
        };
        self.receipts.save(&receipt)?;

        tracing::info!(
            "Successfully installed {} v{} to {:?}",
            descriptor.display_name(),
            descriptor.version(),
            target_root
        );

        Ok(InstallOutcome {
            identifier: receipt.identifier,
            version: receipt.version,
            paths: placed,
            status,
            verified_sha256: archive.verified_sha256,
        })
    }

    /// Fetch and verify a descriptor's archive without installing it
    pub async fn fetch(
        &self,
        descriptor: &PackageDescriptor,
        options: &InstallOptions,
    ) -> Result<FetchedArchive, InstallError> {
        let package = PackageRef::from_descriptor(descriptor);
        self.check_trust(descriptor, &package)?;
        self.fetch_verified(descriptor, &package, options).await
    }

    /// Remove an installed package's artifacts and its receipt
    pub async fn uninstall(&self, identifier: &str) -> Result<UninstallOutcome, InstallError> {
        let receipt = self
            .receipts
            .load(identifier)?
            .ok_or_else(|| InstallError::NotInstalled {
                identifier: identifier.to_string(),
            })?;

        let mut removed = Vec::new();
        for path in &receipt.artifacts {
            if remove_artifact(path, &receipt.target_root).await? {
                self.emit(InstallEvent::Removed { path: path.clone() });
                removed.push(path.clone());
            }
        }

        self.receipts.delete(identifier)?;
        tracing::info!("Uninstallation complete for {} v{}", identifier, receipt.version);

        Ok(UninstallOutcome {
            identifier: receipt.identifier,
            version: receipt.version,
            removed,
        })
    }

    /// Receipt for an installed identifier (no network)
    pub fn installed(&self, identifier: &str) -> Result<Option<InstallReceipt>, InstallError> {
        self.receipts.load(identifier)
    }

    /// All installed packages (no network)
    pub fn list(&self) -> Result<Vec<InstallReceipt>, InstallError> {
        self.receipts.list()
    }

    fn check_trust(
        &self,
        descriptor: &PackageDescriptor,
        package: &PackageRef,
    ) -> Result<(), InstallError> {
        if !descriptor.integrity().is_verified() && !self.context.allow_unverified {
            return Err(InstallError::UnverifiedNotAllowed {
                package: package.clone(),
            });
        }
        Ok(())
    }

    async fn fetch_verified(
        &self,
        descriptor: &PackageDescriptor,
        package: &PackageRef,
        options: &InstallOptions,
    ) -> Result<FetchedArchive, InstallError> {
        let deadline = options.timeout.unwrap_or(self.context.fetch_timeout);

        tracing::info!("Fetching {} from {}", package, package.host);
        self.emit(InstallEvent::Fetching {
            host: package.host.clone(),
        });

        let bytes = match tokio::time::timeout(deadline, self.fetcher.fetch(descriptor.url())).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(kind)) => {
                return Err(InstallError::Fetch {
                    package: package.clone(),
                    kind,
                })
            }
            Err(_) => {
                return Err(InstallError::Fetch {
                    package: package.clone(),
                    kind: FetchError::Timeout(deadline),
                })
            }
        };

        tracing::debug!("Fetched {} bytes", bytes.len());
        self.emit(InstallEvent::Fetched {
            bytes: bytes.len() as u64,
        });

        match descriptor.integrity() {
            IntegrityPolicy::Verify { sha256: expected } => {
                let actual = integrity::sha256_hex(&bytes);
                if !integrity::digest_matches(expected, &actual) {
                    return Err(InstallError::IntegrityMismatch {
                        package: package.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }

                tracing::info!("✓ sha256 verified: {}", actual);
                self.emit(InstallEvent::DigestVerified {
                    sha256: actual.clone(),
                });
                Ok(FetchedArchive {
                    bytes,
                    verified_sha256: Some(actual),
                })
            }
            IntegrityPolicy::Skip => {
                tracing::warn!(
                    "Installing {} WITHOUT integrity verification: its descriptor disables the checksum",
                    package
                );
                self.emit(InstallEvent::VerificationSkipped {
                    identifier: descriptor.identifier().to_string(),
                });
                Ok(FetchedArchive {
                    bytes,
                    verified_sha256: None,
                })
            }
        }
    }

    /// Extract into `<staging>/payload` and locate every artifact
    ///
    /// Returns (staged path, artifact name) pairs in install-action order.
    async fn unpack(
        &self,
        descriptor: &PackageDescriptor,
        package: &PackageRef,
        bytes: Vec<u8>,
        format: ArchiveFormat,
        staging: &Path,
    ) -> Result<Vec<(PathBuf, String)>, InstallError> {
        let payload_dir = staging.join("payload");
        fs::create_dir(&payload_dir).await.at_path(&payload_dir)?;

        let names: Vec<String> = descriptor
            .install_actions()
            .iter()
            .map(|action| action.artifact_name().to_string())
            .collect();

        let handle = tokio::task::spawn_blocking(move || {
            extractor::extract(&bytes, format, &payload_dir)?;
            let located: Vec<(String, Option<PathBuf>)> = names
                .into_iter()
                .map(|name| {
                    let found = extractor::find_artifact(&payload_dir, &name);
                    (name, found)
                })
                .collect();
            Ok::<_, ExtractError>(located)
        });

        let located = handle
            .await
            .map_err(|e| InstallError::Archive {
                package: package.clone(),
                reason: format!("extraction task failed: {e}"),
            })?
            .map_err(|e| archive_error(package, e))?;

        // Every artifact must be present before anything is placed
        located
            .into_iter()
            .map(|(name, found)| match found {
                Some(path) => Ok((path, name)),
                None => Err(InstallError::ArtifactNotFound {
                    package: package.clone(),
                    artifact: name,
                }),
            })
            .collect()
    }

    /// Remove artifacts from a previous install that the new one did not replace
    async fn remove_stale_artifacts(&self, previous: &InstallReceipt, placed: &[PathBuf]) {
        for path in previous.artifacts.iter().filter(|p| !placed.contains(p)) {
            match remove_artifact(path, &previous.target_root).await {
                Ok(true) => {
                    tracing::info!("Removed stale artifact {:?}", path);
                    self.emit(InstallEvent::Removed { path: path.clone() });
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not remove stale artifact {:?}: {}", path, e),
            }
        }
    }

    fn emit(&self, event: InstallEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn archive_error(package: &PackageRef, err: ExtractError) -> InstallError {
    match err {
        ExtractError::Io { path, source } => InstallError::filesystem(path, source),
        other => InstallError::Archive {
            package: package.clone(),
            reason: other.to_string(),
        },
    }
}

/// How often placement retries when a concurrent install changes the path
const PLACE_ATTEMPTS: usize = 3;

/// An artifact renamed into its canonical path
struct Placement {
    final_path: PathBuf,
    /// Where the artifact it replaced was parked, if there was one
    parked: Option<PathBuf>,
}

/// Why an artifact could not be placed
#[derive(Debug)]
enum PlaceError {
    /// The canonical path is as it was before
    Failed(std::io::Error),
    /// The previous artifact could not be put back and is still at `parked`
    Stranded {
        source: std::io::Error,
        parked: PathBuf,
    },
}

impl PlaceError {
    fn is_stranded(&self) -> bool {
        matches!(self, PlaceError::Stranded { .. })
    }

    fn into_install_error(self, final_path: &Path) -> InstallError {
        match self {
            PlaceError::Failed(source) => InstallError::filesystem(final_path, source),
            PlaceError::Stranded { source, parked } => {
                let message = format!(
                    "{source}; the previous artifact could not be restored and was kept at {}",
                    parked.display()
                );
                InstallError::filesystem(final_path, std::io::Error::new(source.kind(), message))
            }
        }
    }
}

/// Whether a rename failed because something already sits at the destination
fn is_occupied(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::DirectoryNotEmpty
    )
}

/// Move `staged` to `final_path` with renames only
///
/// An existing artifact is first parked inside `scratch` (same filesystem,
/// unique per invocation) and restored if the second rename fails. Returns the
/// parked path. A concurrent install that wins the race for `final_path` is
/// parked in turn on the next attempt.
async fn place_atomically(
    staged: &Path,
    final_path: &Path,
    scratch: &Path,
) -> Result<Option<PathBuf>, PlaceError> {
    let file_name = final_path.file_name().unwrap_or_default();
    let mut last_err = None;

    for attempt in 0..PLACE_ATTEMPTS {
        match fs::symlink_metadata(final_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match fs::rename(staged, final_path).await {
                    Ok(()) => return Ok(None),
                    Err(e) if is_occupied(&e) => {
                        last_err = Some(e);
                        continue;
                    }
                    Err(e) => return Err(PlaceError::Failed(e)),
                }
            }
            Err(e) => return Err(PlaceError::Failed(e)),
        }

        let mut parked_name = std::ffi::OsString::from(format!("previous-{attempt}-"));
        parked_name.push(file_name);
        let parked = scratch.join(parked_name);

        match fs::rename(final_path, &parked).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(PlaceError::Failed(e)),
        }

        match fs::rename(staged, final_path).await {
            Ok(()) => return Ok(Some(parked)),
            Err(e) => match fs::rename(&parked, final_path).await {
                Ok(()) if is_occupied(&e) => last_err = Some(e),
                Ok(()) => return Err(PlaceError::Failed(e)),
                // A concurrent install already holds the path; our parked copy is stale
                Err(restore) if is_occupied(&restore) => last_err = Some(e),
                Err(restore) => {
                    tracing::error!(
                        "Could not restore previous artifact {:?} from {:?}: {}",
                        final_path,
                        parked,
                        restore
                    );
                    return Err(PlaceError::Stranded { source: e, parked });
                }
            },
        }
    }

    Err(PlaceError::Failed(last_err.unwrap_or_else(|| {
        std::io::Error::other("artifact path kept changing during placement")
    })))
}

/// Undo placements in reverse order; false if anything could not be undone
async fn roll_back(placements: &[Placement], scratch: &Path) -> bool {
    let mut clean = true;

    for (index, placement) in placements.iter().enumerate().rev() {
        let mut discarded_name = std::ffi::OsString::from(format!("rolled-back-{index}-"));
        discarded_name.push(placement.final_path.file_name().unwrap_or_default());

        if let Err(e) = fs::rename(&placement.final_path, scratch.join(discarded_name)).await {
            tracing::error!("Could not roll back {:?}: {}", placement.final_path, e);
            clean = false;
            continue;
        }

        if let Some(parked) = &placement.parked {
            if let Err(e) = fs::rename(parked, &placement.final_path).await {
                tracing::error!(
                    "Could not restore {:?} from {:?}: {}",
                    placement.final_path,
                    parked,
                    e
                );
                clean = false;
            }
        }
    }

    clean
}

/// Remove one installed artifact after the safety check
///
/// The artifact is renamed into a scratch directory first, so the canonical
/// path disappears in one step. Returns false if it was already gone.
async fn remove_artifact(path: &Path, target_root: &Path) -> Result<bool, InstallError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if !safety::is_safe_to_remove(path, target_root, &name) {
        tracing::warn!(
            "SAFETY: Refusing to remove {:?} - it is not an artifact directly inside {:?}",
            path,
            target_root
        );
        return Ok(false);
    }

    if fs::symlink_metadata(path).await.is_err() {
        return Ok(false);
    }

    let trash = tempfile::Builder::new()
        .prefix(paths::staging::PREFIX)
        .tempdir_in(target_root)
        .at_path(target_root)?;
    fs::rename(path, trash.path().join(&name)).await.at_path(path)?;

    tracing::info!("Removing {:?}", path);
    if let Err(e) = trash.close() {
        tracing::warn!("Could not delete removed artifact contents: {}", e);
    }
    Ok(true)
}

#[cfg(test)]
mod tests;
