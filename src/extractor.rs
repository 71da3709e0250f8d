//! Archive Extractor
//!
//! Unpacks a fetched archive into a staging directory and locates the
//! artifacts named by install actions. Runs synchronously; the installer
//! calls it from a blocking task.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// How deep below the extraction root an artifact may sit
/// (`Comet.app`, `Comet-1.0/Comet.app`, `dist/mac/Comet.app`)
pub const MAX_ARTIFACT_DEPTH: usize = 3;

/// Archive formats appdrop can unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarZst,
    /// Apple disk image (UDIF)
    Dmg,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarZst => "tar.zst",
            ArchiveFormat::Dmg => "dmg",
        };
        f.write_str(name)
    }
}

/// Extraction failures (the installer attaches package context)
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unrecognized archive format")]
    UnknownFormat,

    #[error("{0} archives can only be unpacked on macOS")]
    Unsupported(ArchiveFormat),

    #[error("corrupt {format} archive: {reason}")]
    Corrupt { format: ArchiveFormat, reason: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed: {message}")]
    Tool { tool: &'static str, message: String },
}

/// Identify the archive format from its leading/trailing bytes, falling back
/// to the file name in the source URL
pub fn detect_format(bytes: &[u8], url: &str) -> Option<ArchiveFormat> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        return Some(ArchiveFormat::TarGz);
    }
    if bytes.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        return Some(ArchiveFormat::TarZst);
    }
    if bytes.len() > 262 && &bytes[257..262] == b"ustar" {
        return Some(ArchiveFormat::Tar);
    }
    // UDIF images end with a 512-byte "koly" trailer
    if bytes.len() >= 512 && bytes[bytes.len() - 512..].starts_with(b"koly") {
        return Some(ArchiveFormat::Dmg);
    }

    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
        Some(ArchiveFormat::TarGz)
    } else if path.ends_with(".tar.zst") || path.ends_with(".tzst") {
        Some(ArchiveFormat::TarZst)
    } else if path.ends_with(".tar") {
        Some(ArchiveFormat::Tar)
    } else if path.ends_with(".dmg") {
        Some(ArchiveFormat::Dmg)
    } else {
        None
    }
}

/// Unpack `bytes` into `dest` (which must exist and be empty)
///
/// Returns the number of entries written.
pub fn extract(bytes: &[u8], format: ArchiveFormat, dest: &Path) -> Result<u64, ExtractError> {
    match format {
        ArchiveFormat::Tar => unpack_tar(Cursor::new(bytes), format, dest),
        ArchiveFormat::TarGz => {
            unpack_tar(flate2::read::GzDecoder::new(Cursor::new(bytes)), format, dest)
        }
        ArchiveFormat::TarZst => {
            let decoder = ruzstd::StreamingDecoder::new(Cursor::new(bytes)).map_err(|e| {
                ExtractError::Corrupt {
                    format,
                    reason: e.to_string(),
                }
            })?;
            unpack_tar(decoder, format, dest)
        }
        ArchiveFormat::Dmg => extract_dmg(bytes, dest),
    }
}

fn unpack_tar<R: std::io::Read>(
    reader: R,
    format: ArchiveFormat,
    dest: &Path,
) -> Result<u64, ExtractError> {
    let corrupt = |e: std::io::Error| ExtractError::Corrupt {
        format,
        reason: e.to_string(),
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    let mut count = 0;
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;

        // unpack_in refuses entries that would land outside `dest`
        let unpacked = entry.unpack_in(dest).map_err(|source| ExtractError::Io {
            path: dest.to_path_buf(),
            source,
        })?;

        if unpacked {
            count += 1;
        } else {
            let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            tracing::warn!("Skipped archive entry outside the extraction root: {}", path);
        }
    }

    tracing::debug!("Unpacked {} {} entries into {:?}", count, format, dest);
    Ok(count)
}

#[cfg(target_os = "macos")]
fn extract_dmg(bytes: &[u8], dest: &Path) -> Result<u64, ExtractError> {
    use std::process::Command;

    // The image file and mountpoint live next to dest, inside the same staging dir
    let work = dest.parent().unwrap_or(dest);
    let image = work.join("download.dmg");
    std::fs::write(&image, bytes).map_err(io_at(&image))?;

    let mountpoint = work.join("mount");
    std::fs::create_dir_all(&mountpoint).map_err(io_at(&mountpoint))?;

    let attach = Command::new("hdiutil")
        .args(["attach", "-nobrowse", "-readonly", "-noautoopen", "-mountpoint"])
        .arg(&mountpoint)
        .arg(&image)
        .output()
        .map_err(|e| ExtractError::Tool {
            tool: "hdiutil",
            message: e.to_string(),
        })?;

    if !attach.status.success() {
        return Err(ExtractError::Tool {
            tool: "hdiutil attach",
            message: String::from_utf8_lossy(&attach.stderr).trim().to_string(),
        });
    }

    // ditto keeps bundle symlinks, extended attributes and code signatures intact
    let copied = Command::new("ditto").arg(&mountpoint).arg(dest).output();

    let detach = Command::new("hdiutil")
        .args(["detach", "-quiet"])
        .arg(&mountpoint)
        .output();
    if let Err(e) = detach {
        tracing::warn!("Could not detach {:?}: {}", mountpoint, e);
    }

    let copied = copied.map_err(|e| ExtractError::Tool {
        tool: "ditto",
        message: e.to_string(),
    })?;
    if !copied.status.success() {
        return Err(ExtractError::Tool {
            tool: "ditto",
            message: String::from_utf8_lossy(&copied.stderr).trim().to_string(),
        });
    }

    let count = std::fs::read_dir(dest).map_err(io_at(dest))?.count() as u64;
    Ok(count)
}

#[cfg(target_os = "macos")]
fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ExtractError {
    let path = path.to_path_buf();
    move |source| ExtractError::Io { path, source }
}

#[cfg(not(target_os = "macos"))]
fn extract_dmg(_bytes: &[u8], _dest: &Path) -> Result<u64, ExtractError> {
    Err(ExtractError::Unsupported(ArchiveFormat::Dmg))
}

/// Find the shallowest entry named `name` under `root`
///
/// Symlinks are not followed, so a disk image's `/Applications` shortcut is
/// never descended into.
pub fn find_artifact(root: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(MAX_ARTIFACT_DEPTH)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() == name)
        .min_by_key(|entry| entry.depth())
        .map(|entry| entry.into_path())
}
