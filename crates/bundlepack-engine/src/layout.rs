use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout under one registration scope root (per-user or
/// per-machine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLayout {
    root: PathBuf,
}

impl EngineLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn package_cache_dir(&self, cache_id: &str) -> PathBuf {
        self.cache_dir().join(cache_id)
    }

    pub fn payload_cache_path(&self, cache_id: &str, file_path: &str) -> PathBuf {
        let mut path = self.package_cache_dir(cache_id);
        for segment in file_path.split(['/', '\\']) {
            path.push(segment);
        }
        path
    }

    pub fn bundle_cache_dir(&self, bundle_id: &str) -> PathBuf {
        self.cache_dir().join(format!("{bundle_id}.bundle"))
    }

    pub fn registration_dir(&self) -> PathBuf {
        self.root.join("registration")
    }

    pub fn registration_path(&self, bundle_id: &str) -> PathBuf {
        self.registration_dir()
            .join(format!("{bundle_id}.registration"))
    }

    pub fn resume_state_path(&self, bundle_id: &str) -> PathBuf {
        self.registration_dir().join(format!("{bundle_id}.state"))
    }

    pub fn variables_path(&self, bundle_id: &str) -> PathBuf {
        self.registration_dir()
            .join(format!("{bundle_id}.variables"))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn working_dir(&self, bundle_id: &str) -> PathBuf {
        self.tmp_dir().join(bundle_id)
    }

    pub fn working_payload_path(&self, bundle_id: &str, payload_key: &str) -> PathBuf {
        self.working_dir(bundle_id)
            .join("payloads")
            .join(sanitize_file_token(payload_key))
    }

    pub fn working_container_path(&self, bundle_id: &str, container_id: &str) -> PathBuf {
        self.working_dir(bundle_id)
            .join("containers")
            .join(sanitize_file_token(container_id))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.cache_dir(),
            self.registration_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_user_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows user root")?;
        return Ok(PathBuf::from(app_data).join("BundlePack"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user root")?;
    Ok(PathBuf::from(home).join(".bundlepack"))
}

pub fn default_machine_root() -> PathBuf {
    if cfg!(windows) {
        let program_data =
            std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        return PathBuf::from(program_data).join("BundlePack");
    }
    PathBuf::from("/var/lib/bundlepack")
}

fn sanitize_file_token(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
