use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bundlepack_security::verify_sha256_file;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::{is_user_cancel, result_code_of, EngineError, RESULT_SUCCESS};
use crate::fs_utils::{copy_stream_with_progress, file_size, move_file_or_copy};
use crate::progress::ApplyProgress;
use crate::ux::{
    check_reply, BootstrapperApplication, ErrorEvent, ErrorKind, ErrorReply, ResolveSourceReply,
    UxReply,
};

/// A strategy that brings one source to a local path, reporting
/// `(bytes_done, bytes_total)`; the callback returns `false` to cancel.
pub trait AcquisitionTransport: Send + Sync {
    fn download(
        &self,
        source: &str,
        destination: &Path,
        progress: &mut dyn FnMut(u64, u64) -> bool,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileCopyTransport;

impl AcquisitionTransport for FileCopyTransport {
    fn download(
        &self,
        source: &str,
        destination: &Path,
        progress: &mut dyn FnMut(u64, u64) -> bool,
    ) -> Result<()> {
        let path = Path::new(source.strip_prefix("file://").unwrap_or(source));
        let file = File::open(path)
            .with_context(|| format!("failed to open source: {}", path.display()))?;
        let total = file
            .metadata()
            .with_context(|| format!("failed to stat source: {}", path.display()))?
            .len();
        copy_stream_with_progress(file, destination, total, progress)?;
        Ok(())
    }
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("bundlepack/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl AcquisitionTransport for HttpTransport {
    fn download(
        &self,
        source: &str,
        destination: &Path,
        progress: &mut dyn FnMut(u64, u64) -> bool,
    ) -> Result<()> {
        let response = self
            .client
            .get(source)
            .send()
            .with_context(|| format!("request failed: {source}"))?
            .error_for_status()
            .with_context(|| format!("server rejected request: {source}"))?;
        let total = response.content_length().unwrap_or(0);
        copy_stream_with_progress(response, destination, total, progress)?;
        Ok(())
    }
}

/// Transports keyed by URL scheme. Sources without a scheme are local paths
/// served by the `file` transport.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: BTreeMap<String, Arc<dyn AcquisitionTransport>>,
}

impl TransportRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults(timeout_secs: u64) -> Result<Self> {
        let http: Arc<dyn AcquisitionTransport> = Arc::new(HttpTransport::new(timeout_secs)?);
        let mut registry = Self::empty();
        registry.register("file", Arc::new(FileCopyTransport));
        registry.register("http", http.clone());
        registry.register("https", http);
        Ok(registry)
    }

    pub fn register(&mut self, scheme: &str, transport: Arc<dyn AcquisitionTransport>) {
        self.transports
            .insert(scheme.to_ascii_lowercase(), transport);
    }

    pub fn for_source(&self, source: &str) -> Result<Arc<dyn AcquisitionTransport>> {
        let scheme = source_scheme(source);
        self.transports
            .get(&scheme)
            .cloned()
            .ok_or_else(|| anyhow!("no transport registered for scheme '{scheme}'"))
    }
}

pub fn source_scheme(source: &str) -> String {
    match source.split_once("://") {
        Some((scheme, _)) if !scheme.is_empty() => scheme.to_ascii_lowercase(),
        _ => "file".to_string(),
    }
}

/// One container or payload to bring into the working directory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: String,
    pub local_source: Option<PathBuf>,
    pub url: Option<String>,
    pub size: Option<u64>,
    pub sha256: Option<String>,
    pub destination: PathBuf,
    /// Whether transferred bytes advance cache progress. Containers are
    /// counted as their payloads are extracted instead.
    pub counts_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    AlreadyPresent,
    Acquired,
}

/// True when `path` already holds the expected bytes.
pub fn artifact_matches(path: &Path, size: Option<u64>, sha256: Option<&str>) -> bool {
    let Some(actual) = file_size(path) else {
        return false;
    };
    if size.is_some_and(|expected| expected != actual) {
        return false;
    }
    match sha256 {
        Some(expected) => verify_sha256_file(path, expected).unwrap_or(false),
        None => true,
    }
}

/// Brings `artifact` to its destination. A destination that already matches
/// is left untouched. Failures are offered to the interaction collaborator,
/// which decides whether to retry, supply another source, or abort.
pub fn acquire_artifact(
    ctx: &EngineContext,
    ux: &dyn BootstrapperApplication,
    progress: &ApplyProgress,
    artifact: &Artifact,
) -> Result<AcquireOutcome> {
    if artifact_matches(
        &artifact.destination,
        artifact.size,
        artifact.sha256.as_deref(),
    ) {
        debug!(artifact = %artifact.id, "artifact already present");
        if let Some(size) = artifact.size.filter(|_| artifact.counts_progress) {
            progress.add_cache_bytes(size);
        }
        return Ok(AcquireOutcome::AlreadyPresent);
    }

    let mut local_source = artifact.local_source.clone();
    let display_source = local_source
        .as_ref()
        .map(|path| path.display().to_string())
        .or_else(|| artifact.url.clone())
        .unwrap_or_default();
    check_reply(
        ux.on_acquire_begin(&artifact.id, &display_source),
        "on_acquire_begin",
    )?;

    // Bytes already credited to progress; a retried transfer only adds what
    // goes past them.
    let mut credited = 0_u64;
    let result = loop {
        if ctx.cancel_requested() {
            break Err(EngineError::UserCancelled.into());
        }

        let source = match select_source(local_source.as_deref(), artifact.url.as_deref()) {
            Ok(source) => source,
            Err(missing) => {
                match ux.on_resolve_source(&artifact.id, &missing) {
                    ResolveSourceReply::Source(path) => {
                        info!(
                            artifact = %artifact.id,
                            source = %path.display(),
                            "using alternate source"
                        );
                        local_source = Some(path);
                        continue;
                    }
                    ResolveSourceReply::Retry => continue,
                    ResolveSourceReply::Abort => {
                        break Err(EngineError::Acquire {
                            artifact: artifact.id.clone(),
                            reason: format!("source not found: {}", missing.display()),
                        }
                        .into());
                    }
                }
            }
        };

        match transfer(ctx, ux, progress, artifact, &source, &mut credited) {
            Ok(()) => break Ok(AcquireOutcome::Acquired),
            Err(err) if is_user_cancel(&err) => break Err(err),
            Err(err) => {
                warn!(
                    artifact = %artifact.id,
                    source = %source,
                    error = %format!("{err:#}"),
                    "acquisition failed"
                );
                let event = ErrorEvent {
                    kind: ErrorKind::Acquire,
                    subject: artifact.id.clone(),
                    code: result_code_of(&err),
                    message: format!("{err:#}"),
                };
                match ux.on_error(&event) {
                    ErrorReply::Retry => continue,
                    ErrorReply::Ignore | ErrorReply::Abort => {
                        break Err(EngineError::Acquire {
                            artifact: artifact.id.clone(),
                            reason: format!("{source}: {err:#}"),
                        }
                        .into());
                    }
                }
            }
        }
    };

    let code = match &result {
        Ok(_) => RESULT_SUCCESS,
        Err(err) => result_code_of(err),
    };
    ux.on_acquire_complete(&artifact.id, code);
    result
}

fn select_source(local: Option<&Path>, url: Option<&str>) -> std::result::Result<String, PathBuf> {
    if let Some(path) = local {
        if path.exists() {
            return Ok(path.display().to_string());
        }
        if url.is_none() {
            return Err(path.to_path_buf());
        }
    }
    match url {
        Some(url) => Ok(url.to_string()),
        None => Err(PathBuf::new()),
    }
}

fn transfer(
    ctx: &EngineContext,
    ux: &dyn BootstrapperApplication,
    progress: &ApplyProgress,
    artifact: &Artifact,
    source: &str,
    credited: &mut u64,
) -> Result<()> {
    let transport = ctx.transports.for_source(source)?;
    let part_path = part_path_for(&artifact.destination);
    let mut on_progress = |done: u64, total: u64| -> bool {
        if artifact.counts_progress && done > *credited {
            progress.add_cache_bytes(done - *credited);
            *credited = done;
        }
        let total = if total == 0 { artifact.size.unwrap_or(0) } else { total };
        let reply = ux.on_acquire_progress(&artifact.id, done, total, progress.overall_percent());
        reply == UxReply::Continue && !ctx.cancel_requested()
    };

    let result = transport.download(source, &part_path, &mut on_progress);
    if let Err(err) = result {
        let _ = fs::remove_file(&part_path);
        return Err(err);
    }
    move_file_or_copy(&part_path, &artifact.destination).with_context(|| {
        format!(
            "failed to move acquired artifact into place: {}",
            artifact.destination.display()
        )
    })?;
    info!(artifact = %artifact.id, source, "acquired artifact");
    Ok(())
}

fn part_path_for(destination: &Path) -> PathBuf {
    destination.with_file_name(format!(
        "{}.part",
        destination
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("artifact")
    ))
}
