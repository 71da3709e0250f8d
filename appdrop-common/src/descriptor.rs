//! Package Descriptors
//!
//! A descriptor is static TOML data naming one installable package: where its
//! archive lives, how much to trust it, and which artifacts to place.
//!
//! ```toml
//! identifier = "comet"
//! version = "141.0.7390.23964"
//! url = "https://example/comet_latest.dmg"
//! name = "Comet"
//!
//! [integrity]
//! policy = "skip"
//!
//! [[install]]
//! kind = "app"
//! bundle = "Comet.app"
//! ```

use crate::integrity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// URL schemes a descriptor may point at
pub const SUPPORTED_SCHEMES: &[&str] = &["https://", "http://", "file://"];

/// Why a descriptor could not be turned into a [`PackageDescriptor`]
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read descriptor {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid descriptor syntax: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("failed to serialize descriptor: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl DescriptorError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// How the fetched archive is trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityPolicy {
    /// Compare the SHA-256 of the fetched bytes against a pinned digest
    Verify { sha256: String },

    /// Install without computing a digest (explicit trust decision)
    Skip,
}

impl IntegrityPolicy {
    pub fn is_verified(&self) -> bool {
        matches!(self, IntegrityPolicy::Verify { .. })
    }

    /// The pinned digest, if any
    pub fn expected_digest(&self) -> Option<&str> {
        match self {
            IntegrityPolicy::Verify { sha256 } => Some(sha256),
            IntegrityPolicy::Skip => None,
        }
    }
}

/// A single installation directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallAction {
    /// Place an application bundle (e.g. `Comet.app`) into the target root
    App { bundle: String },
}

impl InstallAction {
    /// Name of the artifact this action looks for inside the archive
    pub fn artifact_name(&self) -> &str {
        match self {
            InstallAction::App { bundle } => bundle,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InstallAction::App { .. } => "app",
        }
    }
}

impl fmt::Display for InstallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.artifact_name())
    }
}

/// A validated package descriptor
///
/// Only constructible through parsing or [`PackageDescriptor::new`], both of
/// which enforce every field invariant. Fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    identifier: String,
    version: String,
    integrity: IntegrityPolicy,
    url: String,
    name: Option<String>,
    description: Option<String>,
    homepage: Option<String>,
    install: Vec<InstallAction>,
}

/// On-disk shape. Everything is optional so missing fields get our own error
/// instead of a serde one.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    integrity: Option<RawIntegrity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    install: Option<Vec<RawAction>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawIntegrity {
    #[serde(skip_serializing_if = "Option::is_none")]
    policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bundle: Option<String>,
}

impl PackageDescriptor {
    /// Build a descriptor programmatically, applying the same validation as parsing
    pub fn new(
        identifier: impl Into<String>,
        version: impl Into<String>,
        integrity: IntegrityPolicy,
        url: impl Into<String>,
        install: Vec<InstallAction>,
    ) -> Result<Self, DescriptorError> {
        let raw = RawDescriptor {
            identifier: Some(identifier.into()),
            version: Some(version.into()),
            url: Some(url.into()),
            integrity: Some(RawIntegrity::from(&integrity)),
            install: Some(install.iter().map(RawAction::from).collect()),
            ..RawDescriptor::default()
        };

        Self::from_raw(raw)
    }

    /// Load a descriptor from a file path
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        contents.parse()
    }

    /// Serialize back to the TOML descriptor format
    pub fn to_toml(&self) -> Result<String, DescriptorError> {
        let raw = RawDescriptor {
            identifier: Some(self.identifier.clone()),
            version: Some(self.version.clone()),
            url: Some(self.url.clone()),
            name: self.name.clone(),
            description: self.description.clone(),
            homepage: self.homepage.clone(),
            integrity: Some(RawIntegrity::from(&self.integrity)),
            install: Some(self.install.iter().map(RawAction::from).collect()),
        };

        Ok(toml::to_string(&raw)?)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn integrity(&self) -> &IntegrityPolicy {
        &self.integrity
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Human-readable name, falling back to the identifier
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.identifier)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn homepage(&self) -> Option<&str> {
        self.homepage.as_deref()
    }

    pub fn install_actions(&self) -> &[InstallAction] {
        &self.install
    }

    fn from_raw(raw: RawDescriptor) -> Result<Self, DescriptorError> {
        let identifier = required(raw.identifier, "identifier")?;
        validate_identifier(&identifier)?;

        let version = required(raw.version, "version")?;
        if version.chars().any(char::is_whitespace) {
            return Err(DescriptorError::invalid("version", "must not contain whitespace"));
        }

        let url = required(raw.url, "url")?;
        validate_url(&url)?;

        let integrity = parse_integrity(
            raw.integrity
                .ok_or_else(|| DescriptorError::MissingField("integrity".into()))?,
        )?;

        let actions = raw
            .install
            .ok_or_else(|| DescriptorError::MissingField("install".into()))?;
        if actions.is_empty() {
            return Err(DescriptorError::invalid(
                "install",
                "at least one install action is required",
            ));
        }
        let install = actions
            .into_iter()
            .enumerate()
            .map(|(index, action)| parse_action(index, action))
            .collect::<Result<Vec<_>, _>>()?;

        for (index, action) in install.iter().enumerate() {
            if install[..index]
                .iter()
                .any(|earlier| earlier.artifact_name() == action.artifact_name())
            {
                return Err(DescriptorError::invalid(
                    format!("install[{index}].bundle"),
                    format!("{:?} is already installed by an earlier action", action.artifact_name()),
                ));
            }
        }

        Ok(Self {
            identifier,
            version,
            integrity,
            url,
            name: optional_text(raw.name, "name")?,
            description: optional_text(raw.description, "description")?,
            homepage: optional_text(raw.homepage, "homepage")?,
            install,
        })
    }
}

impl FromStr for PackageDescriptor {
    type Err = DescriptorError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let raw: RawDescriptor = toml::from_str(toml_str)?;
        Self::from_raw(raw)
    }
}

impl From<&IntegrityPolicy> for RawIntegrity {
    fn from(policy: &IntegrityPolicy) -> Self {
        match policy {
            IntegrityPolicy::Verify { sha256 } => RawIntegrity {
                policy: Some("verify".into()),
                sha256: Some(sha256.clone()),
            },
            IntegrityPolicy::Skip => RawIntegrity {
                policy: Some("skip".into()),
                sha256: None,
            },
        }
    }
}

impl From<&InstallAction> for RawAction {
    fn from(action: &InstallAction) -> Self {
        match action {
            InstallAction::App { bundle } => RawAction {
                kind: Some("app".into()),
                bundle: Some(bundle.clone()),
            },
        }
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, DescriptorError> {
    match value {
        None => Err(DescriptorError::MissingField(field.into())),
        Some(v) if v.trim().is_empty() => Err(DescriptorError::invalid(field, "must not be empty")),
        Some(v) => Ok(v),
    }
}

fn optional_text(value: Option<String>, field: &str) -> Result<Option<String>, DescriptorError> {
    match value {
        Some(v) if v.trim().is_empty() => Err(DescriptorError::invalid(field, "must not be empty")),
        other => Ok(other),
    }
}

/// Identifiers name receipt files, so they must be a safe single path component
pub fn validate_identifier(identifier: &str) -> Result<(), DescriptorError> {
    if identifier.is_empty() {
        return Err(DescriptorError::invalid("identifier", "must not be empty"));
    }
    if identifier.starts_with('.') {
        return Err(DescriptorError::invalid("identifier", "must not start with '.'"));
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+');
    if let Some(bad) = identifier.chars().find(|c| !allowed(*c)) {
        return Err(DescriptorError::invalid(
            "identifier",
            format!("character {bad:?} is not allowed"),
        ));
    }

    Ok(())
}

fn validate_url(url: &str) -> Result<(), DescriptorError> {
    let rest = SUPPORTED_SCHEMES
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .ok_or_else(|| {
            DescriptorError::invalid(
                "url",
                format!("unsupported scheme in {url:?} (expected https://, http:// or file://)"),
            )
        })?;

    if rest.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(DescriptorError::invalid("url", format!("{url:?} is not a valid location")));
    }

    Ok(())
}

fn parse_integrity(raw: RawIntegrity) -> Result<IntegrityPolicy, DescriptorError> {
    let policy = raw
        .policy
        .ok_or_else(|| DescriptorError::MissingField("integrity.policy".into()))?;

    match policy.as_str() {
        "verify" => {
            let sha256 = required(raw.sha256, "integrity.sha256")?;
            if !integrity::is_sha256_hex(&sha256) {
                return Err(DescriptorError::invalid(
                    "integrity.sha256",
                    format!(
                        "expected {} hex digits, got {:?}",
                        integrity::SHA256_HEX_LEN,
                        sha256
                    ),
                ));
            }
            Ok(IntegrityPolicy::Verify {
                sha256: sha256.to_ascii_lowercase(),
            })
        }
        "skip" => {
            if raw.sha256.is_some() {
                return Err(DescriptorError::invalid(
                    "integrity.sha256",
                    "a digest was given but policy is \"skip\"; use policy = \"verify\"",
                ));
            }
            Ok(IntegrityPolicy::Skip)
        }
        other => Err(DescriptorError::invalid(
            "integrity.policy",
            format!("unknown policy {other:?} (expected \"verify\" or \"skip\")"),
        )),
    }
}

fn parse_action(index: usize, raw: RawAction) -> Result<InstallAction, DescriptorError> {
    let kind = raw
        .kind
        .ok_or_else(|| DescriptorError::MissingField(format!("install[{index}].kind")))?;

    match kind.as_str() {
        "app" => {
            let field = format!("install[{index}].bundle");
            let bundle = required(raw.bundle, &field)?;
            validate_artifact_name(&bundle, &field)?;
            Ok(InstallAction::App { bundle })
        }
        other => Err(DescriptorError::invalid(
            format!("install[{index}].kind"),
            format!("unknown install action {other:?}"),
        )),
    }
}

fn validate_artifact_name(name: &str, field: &str) -> Result<(), DescriptorError> {
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(DescriptorError::invalid(
            field,
            format!("{name:?} must be a single file name"),
        ));
    }
    Ok(())
}
