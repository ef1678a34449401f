use std::path::{Path, PathBuf};

use anyhow::Result;
use bundlepack_core::{ActionState, CurrentState, ExecuteOutcome, RequestState};

use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::registration::RelatedBundle;

/// Answer to a lifecycle callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UxReply {
    #[default]
    Continue,
    /// Abort the current operation with a user-exit result.
    Cancel,
    /// Treat the callback itself as an unrecoverable engine error.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReply {
    Retry,
    Ignore,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Acquire,
    Verify,
    Execute,
    Elevation,
}

/// A recoverable failure offered to the interaction collaborator before it
/// is allowed to propagate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub subject: String,
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveSourceReply {
    Abort,
    Retry,
    Source(PathBuf),
}

/// Why the run ended the way it did, as reported to `on_apply_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartState {
    #[default]
    None,
    Required,
    Initiated,
}

/// The user-interaction collaborator. Every method has a permissive default
/// so implementations only override the hooks they care about. Callbacks may
/// arrive from the cache thread, so implementations must be `Send + Sync`.
#[allow(unused_variables)]
pub trait BootstrapperApplication: Send + Sync {
    /// Called once the engine is ready to accept commands on `handle`.
    fn on_startup(&self, handle: EngineHandle) {}

    fn on_shutdown(&self) {}

    fn on_detect_begin(&self, installed: bool, package_count: usize) -> UxReply {
        UxReply::Continue
    }

    fn on_detect_related_bundle(&self, related: &RelatedBundle) -> UxReply {
        UxReply::Continue
    }

    fn on_detect_package_complete(&self, package_id: &str, result: u32, state: CurrentState) {}

    fn on_detect_complete(&self, result: u32) {}

    fn on_plan_begin(&self, package_count: usize) -> UxReply {
        UxReply::Continue
    }

    /// `requested` holds the engine's default and may be overridden.
    fn on_plan_package_begin(&self, package_id: &str, requested: &mut RequestState) -> UxReply {
        UxReply::Continue
    }

    fn on_plan_package_complete(
        &self,
        package_id: &str,
        requested: RequestState,
        execute: ActionState,
        rollback: ActionState,
    ) {
    }

    fn on_plan_complete(&self, result: u32) {}

    fn on_apply_begin(&self) -> UxReply {
        UxReply::Continue
    }

    fn on_register_begin(&self) -> UxReply {
        UxReply::Continue
    }

    fn on_register_complete(&self, result: u32) {}

    fn on_cache_begin(&self) -> UxReply {
        UxReply::Continue
    }

    fn on_cache_package_begin(&self, package_id: &str, payload_count: usize, bytes: u64) -> UxReply {
        UxReply::Continue
    }

    fn on_cache_package_complete(&self, package_id: &str, result: u32) {}

    fn on_cache_complete(&self, result: u32) {}

    fn on_acquire_begin(&self, artifact_id: &str, source: &str) -> UxReply {
        UxReply::Continue
    }

    fn on_acquire_progress(
        &self,
        artifact_id: &str,
        bytes_done: u64,
        bytes_total: u64,
        overall_percent: u8,
    ) -> UxReply {
        UxReply::Continue
    }

    fn on_acquire_complete(&self, artifact_id: &str, result: u32) {}

    /// A local source is missing; the collaborator may point at another.
    fn on_resolve_source(&self, artifact_id: &str, missing: &Path) -> ResolveSourceReply {
        ResolveSourceReply::Abort
    }

    fn on_execute_begin(&self, step_count: u64) -> UxReply {
        UxReply::Continue
    }

    fn on_execute_package_begin(&self, package_id: &str, action: ActionState, rollback: bool) -> UxReply {
        UxReply::Continue
    }

    fn on_execute_progress(&self, package_id: &str, package_percent: u8, overall_percent: u8) -> UxReply {
        UxReply::Continue
    }

    fn on_execute_package_complete(
        &self,
        package_id: &str,
        result: u32,
        outcome: Option<ExecuteOutcome>,
    ) {
    }

    fn on_execute_complete(&self, result: u32) {}

    fn on_error(&self, event: &ErrorEvent) -> ErrorReply {
        ErrorReply::Abort
    }

    /// Asked when restart policy is `prompt`; `true` allows the restart.
    fn on_restart_required(&self) -> bool {
        false
    }

    fn on_apply_complete(&self, result: u32, restart: RestartState) {}
}

/// Maps a callback reply onto the engine's error taxonomy.
pub fn check_reply(reply: UxReply, hook: &str) -> Result<()> {
    match reply {
        UxReply::Continue => Ok(()),
        UxReply::Cancel => Err(EngineError::UserCancelled.into()),
        UxReply::Fail => Err(EngineError::Ux(format!("{hook} returned failure")).into()),
    }
}

/// Collaborator that accepts every default. Used by the elevated peer and by
/// callers that drive the engine without a front-end.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentApplication;

impl BootstrapperApplication for SilentApplication {}
