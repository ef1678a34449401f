use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use bundlepack_core::{Package, Payload};
use bundlepack_security::{sha256_digest_file, verify_signature_with_trusted_keys};
use tracing::{debug, info, warn};

use crate::acquire::{acquire_artifact, artifact_matches, Artifact};
use crate::container::{ContainerReader, ContainerSource};
use crate::context::EngineContext;
use crate::elevation::{CachePayloadRequest, ElevationSlot};
use crate::error::{is_user_cancel, result_code_of, EngineError, RESULT_SUCCESS};
use crate::fs_utils::{ensure_parent_dir, file_size, move_file_or_copy, remove_dir_if_exists};
use crate::plan::{CacheAction, Plan, RollbackCacheAction};
use crate::progress::ApplyProgress;
use crate::ux::{check_reply, BootstrapperApplication, ErrorEvent, ErrorKind, ErrorReply, UxReply};

/// True when every payload of `package` sits in its content store with the
/// expected size.
pub fn is_package_cached(ctx: &EngineContext, package: &Package) -> bool {
    package.payloads.iter().all(|key| {
        ctx.manifest.payload(key).is_some_and(|payload| {
            file_size(&ctx.cached_payload_path(package, payload)) == Some(payload.size)
        })
    })
}

/// Checks size, digest, and (when authored) the publisher signature over
/// the digest.
pub fn verify_payload(ctx: &EngineContext, payload: &Payload, path: &Path) -> Result<()> {
    let verify_error = |reason: String| EngineError::Verify {
        artifact: payload.key.clone(),
        reason,
    };

    let actual = file_size(path)
        .ok_or_else(|| verify_error(format!("file missing: {}", path.display())))?;
    if actual != payload.size {
        return Err(verify_error(format!(
            "size mismatch: expected {} bytes, found {actual}",
            payload.size
        ))
        .into());
    }

    if payload.sha256.is_none() && payload.signature.is_none() {
        return Ok(());
    }

    let digest = sha256_digest_file(path)
        .with_context(|| format!("failed to hash payload: {}", path.display()))?;
    if let Some(expected) = &payload.sha256 {
        if !hex::encode(digest).eq_ignore_ascii_case(expected.trim()) {
            return Err(verify_error("sha256 mismatch".to_string()).into());
        }
    }
    if let Some(signature) = &payload.signature {
        let trusted = verify_signature_with_trusted_keys(
            &digest,
            signature,
            &ctx.config.trusted_publisher_keys,
        )
        .map_err(|err| verify_error(format!("{err:#}")))?;
        if !trusted {
            return Err(verify_error(
                "signature is not from a trusted publisher".to_string(),
            )
            .into());
        }
    }
    Ok(())
}

/// Verifies `source` and makes it visible in the package's content store.
/// Runs in whichever process owns the package's scope.
pub fn cache_payload(
    ctx: &EngineContext,
    package: &Package,
    payload: &Payload,
    source: &Path,
    move_file: bool,
) -> Result<PathBuf> {
    let destination = ctx.cached_payload_path(package, payload);
    if artifact_matches(&destination, Some(payload.size), payload.sha256.as_deref()) {
        debug!(package = %package.id, payload = %payload.key, "payload already cached");
        return Ok(destination);
    }

    verify_payload(ctx, payload, source)?;
    ensure_parent_dir(&destination)?;
    if move_file {
        move_file_or_copy(source, &destination)?;
    } else {
        let staged = destination.with_extension("part");
        fs::copy(source, &staged).with_context(|| {
            format!("failed to copy {} to {}", source.display(), staged.display())
        })?;
        move_file_or_copy(&staged, &destination)?;
    }
    info!(
        package = %package.id,
        payload = %payload.key,
        path = %destination.display(),
        "cached payload"
    );
    Ok(destination)
}

pub fn remove_package_cache(ctx: &EngineContext, package: &Package) -> Result<()> {
    let dir = ctx
        .layout_for(package.per_machine)
        .package_cache_dir(package.cache_id());
    remove_dir_if_exists(&dir)
        .with_context(|| format!("failed to remove package cache: {}", dir.display()))?;
    info!(package = %package.id, "removed package cache");
    Ok(())
}

pub fn layout_payload(
    ctx: &EngineContext,
    payload: &Payload,
    source: &Path,
    directory: &Path,
) -> Result<PathBuf> {
    let mut destination = directory.to_path_buf();
    for segment in payload.file_path.split(['/', '\\']) {
        destination.push(segment);
    }
    if artifact_matches(&destination, Some(payload.size), payload.sha256.as_deref()) {
        return Ok(destination);
    }
    verify_payload(ctx, payload, source)?;
    ensure_parent_dir(&destination)?;
    fs::copy(source, &destination).with_context(|| {
        format!(
            "failed to lay out {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    Ok(destination)
}

/// Copies the engine and its manifest into `directory` so the layout can be
/// launched on another machine.
pub fn layout_bundle(ctx: &EngineContext, directory: &Path) -> Result<()> {
    fs::create_dir_all(directory)
        .with_context(|| format!("failed to create layout directory: {}", directory.display()))?;
    for source in [&ctx.engine_path, &ctx.manifest_path] {
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("path has no file name: {}", source.display()))?;
        let destination = directory.join(name);
        if destination == *source {
            continue;
        }
        fs::copy(source, &destination).with_context(|| {
            format!("failed to copy {} to {}", source.display(), destination.display())
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Pending,
    Signaled,
    Failed,
}

/// Events the cache thread signals once a package's payloads are cached and
/// the execute thread waits on before running that package.
#[derive(Debug)]
pub struct SyncEvents {
    states: Mutex<Vec<SyncState>>,
    changed: Condvar,
}

impl SyncEvents {
    pub fn new(count: usize) -> Self {
        Self {
            states: Mutex::new(vec![SyncState::Pending; count]),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<SyncState>>> {
        self.states
            .lock()
            .map_err(|_| anyhow!("sync event state poisoned"))
    }

    pub fn signal(&self, event: usize) -> Result<()> {
        let mut states = self.lock()?;
        let state = states
            .get_mut(event)
            .ok_or_else(|| EngineError::InvalidPlan(format!("unknown sync event {event}")))?;
        *state = SyncState::Signaled;
        self.changed.notify_all();
        Ok(())
    }

    /// Releases every waiter with a failure; already signaled events stay
    /// signaled.
    pub fn fail_all(&self) {
        if let Ok(mut states) = self.states.lock() {
            for state in states.iter_mut() {
                if *state == SyncState::Pending {
                    *state = SyncState::Failed;
                }
            }
        }
        self.changed.notify_all();
    }

    pub fn wait(&self, event: usize) -> Result<()> {
        let mut states = self.lock()?;
        loop {
            match states.get(event) {
                None => {
                    return Err(
                        EngineError::InvalidPlan(format!("unknown sync event {event}")).into(),
                    )
                }
                Some(SyncState::Signaled) => return Ok(()),
                Some(SyncState::Failed) => {
                    return Err(EngineError::Acquire {
                        artifact: format!("sync event {event}"),
                        reason: "caching failed before the package was available".to_string(),
                    }
                    .into())
                }
                Some(SyncState::Pending) => {
                    states = self
                        .changed
                        .wait(states)
                        .map_err(|_| anyhow!("sync event state poisoned"))?;
                }
            }
        }
    }
}

/// Realizes a cache plan. Remembers the last cache checkpoint passed so a
/// failed run can undo what it cached.
pub struct CacheWorker<'a> {
    ctx: &'a EngineContext,
    ux: &'a dyn BootstrapperApplication,
    progress: &'a ApplyProgress,
    elevation: &'a ElevationSlot,
    sync: &'a SyncEvents,
    halt: Option<&'a AtomicBool>,
    last_checkpoint: Option<u32>,
    current_package: Option<String>,
}

impl<'a> CacheWorker<'a> {
    pub fn new(
        ctx: &'a EngineContext,
        ux: &'a dyn BootstrapperApplication,
        progress: &'a ApplyProgress,
        elevation: &'a ElevationSlot,
        sync: &'a SyncEvents,
    ) -> Self {
        Self {
            ctx,
            ux,
            progress,
            elevation,
            sync,
            halt: None,
            last_checkpoint: None,
            current_package: None,
        }
    }

    /// Stops the worker at its next action once `halt` is set.
    pub fn with_halt(mut self, halt: &'a AtomicBool) -> Self {
        self.halt = Some(halt);
        self
    }

    /// Runs every cache action in order. On failure every pending sync event
    /// is failed so the execute thread stops waiting.
    pub fn run(&mut self, plan: &Plan) -> Result<()> {
        let result = self.run_actions(plan);
        if let Err(err) = &result {
            let code = result_code_of(err);
            if let Some(package) = self.current_package.take() {
                self.ux.on_cache_package_complete(&package, code);
            }
            warn!(error = %format!("{err:#}"), "cache plan failed");
            self.sync.fail_all();
        }
        result
    }

    fn run_actions(&mut self, plan: &Plan) -> Result<()> {
        for action in &plan.cache_actions {
            if self.ctx.cancel_requested() {
                return Err(EngineError::UserCancelled.into());
            }
            if self.halt.is_some_and(|halt| halt.load(Ordering::SeqCst)) {
                return Err(anyhow!("caching stopped after execution failed"));
            }
            self.run_action(action)?;
        }
        Ok(())
    }

    fn run_action(&mut self, action: &CacheAction) -> Result<()> {
        match action {
            CacheAction::Checkpoint { id } => {
                self.last_checkpoint = Some(*id);
            }
            CacheAction::PackageStart {
                package,
                payload_count,
                bytes,
            } => {
                check_reply(
                    self.ux.on_cache_package_begin(package, *payload_count, *bytes),
                    "on_cache_package_begin",
                )?;
                self.current_package = Some(package.clone());
            }
            CacheAction::AcquireContainer { container } => {
                let container = self
                    .ctx
                    .manifest
                    .container(container)
                    .with_context(|| format!("unknown container '{container}'"))?;
                let artifact = Artifact {
                    id: container.id.clone(),
                    local_source: container
                        .source_path
                        .as_deref()
                        .map(|source| self.ctx.resolve_source_path(source)),
                    url: container.download_url.clone(),
                    size: container.size,
                    sha256: container.sha256.clone(),
                    destination: self.ctx.working_container_path(&container.id),
                    counts_progress: false,
                };
                acquire_artifact(self.ctx, self.ux, self.progress, &artifact)?;
            }
            CacheAction::ExtractContainer { container, payloads } => {
                self.extract_container(container, payloads)?;
            }
            CacheAction::AcquirePayload { payload } => {
                let payload = self.ctx.payload(payload)?;
                let artifact = Artifact {
                    id: payload.key.clone(),
                    local_source: payload
                        .source_path
                        .as_deref()
                        .map(|source| self.ctx.resolve_source_path(source)),
                    url: payload.download_url.clone(),
                    size: Some(payload.size),
                    sha256: payload.sha256.clone(),
                    destination: self.ctx.working_payload_path(&payload.key),
                    counts_progress: true,
                };
                acquire_artifact(self.ctx, self.ux, self.progress, &artifact)?;
            }
            CacheAction::CachePayload {
                package,
                payload,
                move_file,
            } => {
                self.cache_with_retry(package, payload, *move_file)?;
            }
            CacheAction::LayoutBundle { directory } => {
                layout_bundle(self.ctx, directory)?;
            }
            CacheAction::LayoutPayload { payload, directory } => {
                let payload = self.ctx.payload(payload)?;
                let source = self.ctx.working_payload_path(&payload.key);
                self.with_verify_retry(&payload.key, || {
                    layout_payload(self.ctx, payload, &source, directory).map(|_| ())
                })?;
            }
            CacheAction::PackageStop { package } => {
                self.current_package = None;
                self.ux.on_cache_package_complete(package, RESULT_SUCCESS);
            }
            CacheAction::SignalSyncpoint { event } => {
                self.sync.signal(*event)?;
            }
        }
        Ok(())
    }

    fn extract_container(&self, container_id: &str, payload_keys: &[String]) -> Result<()> {
        let container = self
            .ctx
            .manifest
            .container(container_id)
            .with_context(|| format!("unknown container '{container_id}'"))?;

        let mut wanted = HashMap::new();
        for key in payload_keys {
            let payload = self.ctx.payload(key)?;
            let destination = self.ctx.working_payload_path(key);
            if artifact_matches(&destination, Some(payload.size), payload.sha256.as_deref()) {
                self.progress.add_cache_bytes(payload.size);
                continue;
            }
            wanted.insert(key.clone(), destination);
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let source = match (container.attached, container.attached_index) {
            (true, Some(index)) => ContainerSource::Attached {
                image: self.ctx.engine_path.clone(),
                index,
            },
            _ => ContainerSource::File(self.ctx.working_container_path(container_id)),
        };
        let mut reader = ContainerReader::open(&source)
            .with_context(|| format!("failed to open container '{container_id}'"))?;
        let mut last: HashMap<String, u64> = HashMap::new();
        reader.extract(&wanted, |entry, done, total| {
            let previous = last.insert(entry.to_string(), done).unwrap_or(0);
            self.progress.add_cache_bytes(done.saturating_sub(previous));
            let reply = self.ux.on_acquire_progress(
                entry,
                done,
                total,
                self.progress.overall_percent(),
            );
            reply == UxReply::Continue && !self.ctx.cancel_requested()
        })?;
        info!(container = container_id, payloads = wanted.len(), "extracted container");
        Ok(())
    }

    fn cache_with_retry(&self, package_id: &str, payload_key: &str, move_file: bool) -> Result<()> {
        let package = self.ctx.package(package_id)?;
        let payload = self.ctx.payload(payload_key)?;
        let source = self.ctx.working_payload_path(payload_key);

        self.with_verify_retry(payload_key, || {
            if self.ctx.needs_elevation(package.per_machine) {
                self.elevation.cache_payload(&CachePayloadRequest {
                    package: package.id.clone(),
                    payload: payload.key.clone(),
                    source: source.clone(),
                    move_file,
                })
            } else {
                cache_payload(self.ctx, package, payload, &source, move_file).map(|_| ())
            }
        })
    }

    fn with_verify_retry<F>(&self, subject: &str, mut operation: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        loop {
            match operation() {
                Ok(()) => return Ok(()),
                Err(err) if is_user_cancel(&err) => return Err(err),
                Err(err) => {
                    let event = ErrorEvent {
                        kind: ErrorKind::Verify,
                        subject: subject.to_string(),
                        code: result_code_of(&err),
                        message: format!("{err:#}"),
                    };
                    match self.ux.on_error(&event) {
                        ErrorReply::Retry => continue,
                        ErrorReply::Ignore | ErrorReply::Abort => return Err(err),
                    }
                }
            }
        }
    }

    /// Undoes caching from the last passed checkpoint back to the start of
    /// the run, sparing the packages in `completed`. Failures are logged and
    /// skipped.
    pub fn rollback(&self, plan: &Plan, completed: &[String]) {
        let Some(checkpoint) = self.last_checkpoint else {
            return;
        };
        let actions = &plan.rollback_cache_actions;
        let Some(start) = actions.iter().position(|action| {
            matches!(action, RollbackCacheAction::Checkpoint { id } if *id == checkpoint)
        }) else {
            warn!(checkpoint, "cache checkpoint not present in rollback plan");
            return;
        };
        let end = actions[start + 1..]
            .iter()
            .position(|action| matches!(action, RollbackCacheAction::Checkpoint { .. }))
            .map_or(actions.len(), |offset| start + 1 + offset);

        for action in actions[..end].iter().rev() {
            let RollbackCacheAction::RollbackPackage { package } = action else {
                continue;
            };
            if completed.contains(package) {
                debug!(package = %package, "package was not rolled back; keeping its cache");
                continue;
            }
            let result = self.ctx.package(package).and_then(|package| {
                if self.ctx.needs_elevation(package.per_machine) {
                    self.elevation.clean_package(&package.id)
                } else {
                    remove_package_cache(self.ctx, package)
                }
            });
            if let Err(err) = result {
                warn!(
                    package = %package,
                    error = %format!("{err:#}"),
                    "cache rollback step failed"
                );
            }
        }
    }
}
