use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

pub(crate) const LOG_ENV: &str = "BUNDLEPACK_LOG";
const DEFAULT_FILTER: &str = "info";

/// The elevated peer writes beside the parent's log instead of interleaving
/// into it.
pub(crate) fn log_path_for(base: &Path, elevated: bool) -> PathBuf {
    if !elevated {
        return base.to_path_buf();
    }
    let mut name = base.as_os_str().to_owned();
    name.push(".elevated");
    PathBuf::from(name)
}

pub(crate) fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the process-wide subscriber: the log file when given, else
/// stderr.
pub(crate) fn init_logging(log: Option<&Path>, elevated: bool) -> Result<()> {
    let filter = env_filter(std::env::var(LOG_ENV).ok().as_deref());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log {
        Some(base) => {
            let path = log_path_for(base, elevated);
            if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file: {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|err| anyhow::anyhow!("failed to install logger: {err}"))?;
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|err| anyhow::anyhow!("failed to install logger: {err}"))?;
        }
    }
    Ok(())
}
