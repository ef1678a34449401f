use std::collections::HashSet;

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::package_kind::PackageKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleInfo {
    pub id: String,
    pub name: Option<String>,
    pub version: Version,
    pub upgrade_code: Option<String>,
    #[serde(default)]
    pub per_machine: bool,
}

/// An archive holding one or more payloads.
///
/// An attached container lives inside the engine's own executable; its
/// offset and size come from the section header trailing that file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub attached: bool,
    pub attached_index: Option<u32>,
    pub source_path: Option<String>,
    pub download_url: Option<String>,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    pub key: String,
    pub file_path: String,
    pub container: Option<String>,
    pub source_path: Option<String>,
    pub download_url: Option<String>,
    pub size: u64,
    pub sha256: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackBoundary {
    pub id: String,
    #[serde(default = "default_true")]
    pub vital: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExitCodeBehavior {
    Success,
    Error,
    RebootRequired,
    RebootForced,
}

/// Maps a raw process exit code (or any code, when `code` is absent) to an
/// outcome for executable packages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitCodeRule {
    pub code: Option<i32>,
    pub behavior: ExitCodeBehavior,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PackageDetails {
    Msi {
        product_code: String,
        #[serde(default)]
        properties: Vec<String>,
    },
    Msp {
        patch_code: String,
        #[serde(default)]
        target_product_codes: Vec<String>,
    },
    Exe {
        install_arguments: Option<String>,
        repair_arguments: Option<String>,
        uninstall_arguments: Option<String>,
        detect_condition: Option<String>,
        #[serde(default)]
        exit_codes: Vec<ExitCodeRule>,
    },
    Msu {
        kb: Option<String>,
        detect_condition: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub id: String,
    #[serde(flatten)]
    pub details: PackageDetails,
    #[serde(default = "default_true")]
    pub vital: bool,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default)]
    pub per_machine: bool,
    /// Leave payloads in the content store after a successful install so
    /// later repairs need no source.
    #[serde(default = "default_true")]
    pub keep_cached: bool,
    pub cache_id: Option<String>,
    pub rollback_boundary: Option<String>,
    pub install_condition: Option<String>,
    #[serde(default)]
    pub payloads: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariableDecl {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub numeric: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleManifest {
    pub bundle: BundleInfo,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub payloads: Vec<Payload>,
    #[serde(default)]
    pub rollback_boundaries: Vec<RollbackBoundary>,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
}

impl Package {
    pub fn kind(&self) -> PackageKind {
        match self.details {
            PackageDetails::Msi { .. } => PackageKind::Msi,
            PackageDetails::Msp { .. } => PackageKind::Msp,
            PackageDetails::Exe { .. } => PackageKind::Exe,
            PackageDetails::Msu { .. } => PackageKind::Msu,
        }
    }

    pub fn cache_id(&self) -> &str {
        self.cache_id.as_deref().unwrap_or(&self.id)
    }

    pub fn uninstallable(&self) -> bool {
        !self.permanent
    }

    /// The payload handed to the installer technology (the first declared).
    pub fn primary_payload(&self) -> Option<&str> {
        self.payloads.first().map(String::as_str)
    }

    pub fn detect_condition(&self) -> Option<&str> {
        match &self.details {
            PackageDetails::Exe {
                detect_condition, ..
            }
            | PackageDetails::Msu {
                detect_condition, ..
            } => detect_condition.as_deref(),
            _ => None,
        }
    }
}

impl BundleManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse bundle manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn package_index(&self, id: &str) -> Option<usize> {
        self.packages.iter().position(|package| package.id == id)
    }

    pub fn payload(&self, key: &str) -> Option<&Payload> {
        self.payloads.iter().find(|payload| payload.key == key)
    }

    pub fn container(&self, id: &str) -> Option<&Container> {
        self.containers.iter().find(|container| container.id == id)
    }

    pub fn rollback_boundary(&self, id: &str) -> Option<&RollbackBoundary> {
        self.rollback_boundaries
            .iter()
            .find(|boundary| boundary.id == id)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.bundle.id.trim().is_empty() {
            return Err(anyhow!("bundle id must not be empty"));
        }

        let mut container_ids = HashSet::new();
        for container in &self.containers {
            if !container_ids.insert(container.id.as_str()) {
                return Err(anyhow!("duplicate container '{}'", container.id));
            }
            if container.attached && container.attached_index.is_none() {
                return Err(anyhow!(
                    "attached container '{}' must declare attached_index",
                    container.id
                ));
            }
            if !container.attached
                && container.source_path.is_none()
                && container.download_url.is_none()
            {
                return Err(anyhow!(
                    "detached container '{}' must declare source_path or download_url",
                    container.id
                ));
            }
        }

        let mut payload_keys = HashSet::new();
        for payload in &self.payloads {
            if !payload_keys.insert(payload.key.as_str()) {
                return Err(anyhow!("duplicate payload '{}'", payload.key));
            }
            validate_relative_file_path(&payload.file_path)
                .with_context(|| format!("invalid file_path for payload '{}'", payload.key))?;
            if let Some(container) = &payload.container {
                if !container_ids.contains(container.as_str()) {
                    return Err(anyhow!(
                        "payload '{}' references unknown container '{}'",
                        payload.key,
                        container
                    ));
                }
            }
        }

        let mut boundary_ids = HashSet::new();
        for boundary in &self.rollback_boundaries {
            if !boundary_ids.insert(boundary.id.as_str()) {
                return Err(anyhow!("duplicate rollback boundary '{}'", boundary.id));
            }
        }

        let mut package_ids = HashSet::new();
        for package in &self.packages {
            if !package_ids.insert(package.id.as_str()) {
                return Err(anyhow!("duplicate package '{}'", package.id));
            }
            if let Some(boundary) = &package.rollback_boundary {
                if !boundary_ids.contains(boundary.as_str()) {
                    return Err(anyhow!(
                        "package '{}' references unknown rollback boundary '{}'",
                        package.id,
                        boundary
                    ));
                }
            }
            for payload in &package.payloads {
                if !payload_keys.contains(payload.as_str()) {
                    return Err(anyhow!(
                        "package '{}' references unknown payload '{}'",
                        package.id,
                        payload
                    ));
                }
            }
            if package.payloads.is_empty() {
                return Err(anyhow!("package '{}' must declare a payload", package.id));
            }
        }

        Ok(())
    }
}

fn validate_relative_file_path(path: &str) -> anyhow::Result<()> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("file path must not be empty"));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || trimmed.contains(':') {
        return Err(anyhow!("file path must be relative: {path}"));
    }
    if trimmed
        .split(['/', '\\'])
        .any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(anyhow!("file path must not contain empty or '..' segments: {path}"));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}
