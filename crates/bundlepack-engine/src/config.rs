use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::{default_machine_root, default_user_root};

/// Start-up configuration handed by reference to every component that needs
/// it. Nothing in the engine reads configuration from global state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub user_root: Option<PathBuf>,
    pub machine_root: Option<PathBuf>,
    pub trusted_publisher_keys: Vec<String>,
    pub cache_in_parallel: bool,
    pub elevation_command: Option<String>,
    pub elevation_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_root: None,
            machine_root: None,
            trusted_publisher_keys: Vec::new(),
            cache_in_parallel: true,
            elevation_command: None,
            elevation_timeout_secs: 120,
            download_timeout_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse engine config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid engine config: {}", path.display()))
    }

    pub fn resolve_user_root(&self) -> Result<PathBuf> {
        match &self.user_root {
            Some(root) => Ok(root.clone()),
            None => default_user_root(),
        }
    }

    pub fn resolve_machine_root(&self) -> PathBuf {
        self.machine_root
            .clone()
            .unwrap_or_else(default_machine_root)
    }
}
