use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{anyhow, Result};
use bundlepack_core::{ActionState, ExecuteOutcome, ResumeMode, Variables};
use tracing::{debug, info, warn};

use crate::cache::{remove_package_cache, CacheWorker, SyncEvents};
use crate::context::EngineContext;
use crate::drivers;
use crate::elevation::ElevationSlot;
use crate::error::{
    engine_error, is_fatal_to_run, is_user_cancel, result_code_of, EngineError, RESULT_SUCCESS,
};
use crate::fs_utils::remove_dir_if_exists;
use crate::plan::{ExecuteAction, Plan};
use crate::progress::ApplyProgress;
use crate::registration::{
    begin_session, end_session, read_record, resume_session, save_variables, write_resume_state,
    ResumeState,
};
use crate::ux::{
    check_reply, BootstrapperApplication, ErrorEvent, ErrorKind, ErrorReply, RestartState,
    UxReply,
};

/// How an Apply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub result: u32,
    pub restart: RestartState,
    pub suspended: bool,
}

impl ApplySummary {
    fn failed(err: &anyhow::Error) -> Self {
        Self {
            result: result_code_of(err),
            restart: RestartState::None,
            suspended: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result == RESULT_SUCCESS
    }
}

/// Shared inputs of one Apply.
pub struct ApplyContext<'a> {
    pub ctx: &'a EngineContext,
    pub ux: &'a dyn BootstrapperApplication,
    pub plan: &'a Plan,
    pub variables: &'a Variables,
    pub elevation: &'a ElevationSlot,
    pub suspend: &'a AtomicBool,
}

/// Runs the plan: registration, caching alongside execution, cleanup, and
/// registration bookkeeping. Never returns early without settling the
/// registration so an interrupted run can be resumed.
pub fn apply(run: &ApplyContext<'_>) -> ApplySummary {
    let ApplyContext { ctx, ux, plan, .. } = *run;
    if let Err(err) = check_reply(ux.on_apply_begin(), "on_apply_begin") {
        return ApplySummary::failed(&err);
    }

    let progress = ApplyProgress::new(plan.cache_bytes_total, plan.execute_steps_total);
    if plan.is_layout() {
        return apply_layout(run, &progress);
    }

    if run.suspend.load(Ordering::SeqCst) {
        return suspend_before_registration(run);
    }

    if plan.per_machine && !ctx.elevated {
        if let Err(err) = start_elevation(run) {
            return ApplySummary::failed(&err);
        }
    }

    let registered_before = read_record(ctx.registration_layout(), ctx.bundle_id())
        .map(|record| record.is_some())
        .unwrap_or(false);
    if let Err(err) = register(run) {
        warn!(error = %format!("{err:#}"), "registration failed");
        return ApplySummary::failed(&err);
    }

    let halt = AtomicBool::new(false);
    let sync = SyncEvents::new(plan.sync_events);
    let worker = CacheWorker::new(ctx, ux, &progress, run.elevation, &sync).with_halt(&halt);
    let mut executor = Executor::new(run, &progress, &sync);

    let (cache_result, worker, execute_stop) =
        match check_reply(ux.on_cache_begin(), "on_cache_begin") {
            Err(err) => (Err(err), Some(worker), ExecuteStop::NotStarted),
            Ok(()) if ctx.config.cache_in_parallel => {
                run_in_parallel(worker, &mut executor, plan, &halt, &sync)
            }
            Ok(()) => {
                let mut worker = worker;
                let cache_result = worker.run(plan);
                let stop = if cache_result.is_ok() {
                    executor.run()
                } else {
                    ExecuteStop::NotStarted
                };
                (cache_result, Some(worker), stop)
            }
        };
    ux.on_cache_complete(code_of(&cache_result));

    let mut failure: Option<anyhow::Error> = None;
    let mut suspended = false;
    match execute_stop {
        ExecuteStop::Completed | ExecuteStop::RestartInitiated | ExecuteStop::NotStarted => {}
        ExecuteStop::Suspended => suspended = true,
        ExecuteStop::Failed(err) => failure = Some(err),
    }
    if let Err(err) = cache_result {
        // A failed sync wait only echoes the cache failure behind it.
        let cache_is_cause = match &failure {
            None => true,
            Some(existing) => {
                is_user_cancel(&err)
                    || matches!(engine_error(existing), Some(EngineError::Acquire { .. }))
            }
        };
        if cache_is_cause {
            failure = Some(err);
        }
    }
    ux.on_execute_complete(failure.as_ref().map_or(RESULT_SUCCESS, result_code_of));

    if failure.is_some() {
        if let Some(worker) = &worker {
            worker.rollback(plan, &executor.completed);
        }
    } else if !suspended {
        clean(run);
    }
    let working_dir = ctx.user_layout.working_dir(ctx.bundle_id());
    if let Err(err) = remove_dir_if_exists(&working_dir) {
        debug!(path = %working_dir.display(), error = %err, "failed to remove working directory");
    }

    let restart = executor.restart;
    // Packages left in place by earlier boundaries keep the bundle
    // registered so they can be removed later.
    let keep_on_failure = registered_before || !executor.completed.is_empty();
    if let Err(err) = unregister(run, failure.is_none(), suspended, restart, keep_on_failure) {
        warn!(error = %format!("{err:#}"), "registration bookkeeping failed");
        if failure.is_none() {
            failure = Some(err);
        }
    }

    match failure {
        Some(err) => ApplySummary {
            result: result_code_of(&err),
            restart,
            suspended: false,
        },
        None => ApplySummary {
            result: RESULT_SUCCESS,
            restart,
            suspended,
        },
    }
}

fn code_of(result: &Result<()>) -> u32 {
    match result {
        Ok(()) => RESULT_SUCCESS,
        Err(err) => result_code_of(err),
    }
}

fn run_in_parallel<'w>(
    mut worker: CacheWorker<'w>,
    executor: &mut Executor<'_, '_>,
    plan: &Plan,
    halt: &AtomicBool,
    sync: &SyncEvents,
) -> (Result<()>, Option<CacheWorker<'w>>, ExecuteStop) {
    thread::scope(|scope| {
        let cache = scope.spawn(move || {
            let _guard = FailOnPanic(sync);
            let result = worker.run(plan);
            (result, worker)
        });
        let stop = executor.run();
        if matches!(stop, ExecuteStop::Failed(_)) {
            halt.store(true, Ordering::SeqCst);
        }
        match cache.join() {
            Ok((result, worker)) => (result, Some(worker), stop),
            Err(_) => {
                sync.fail_all();
                (Err(anyhow!("cache thread panicked")), None, stop)
            }
        }
    })
}

/// Releases execute-side waiters if the cache thread panics.
struct FailOnPanic<'s>(&'s SyncEvents);

impl Drop for FailOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.fail_all();
        }
    }
}

fn apply_layout(run: &ApplyContext<'_>, progress: &ApplyProgress) -> ApplySummary {
    let ApplyContext { ctx, ux, plan, .. } = *run;
    let sync = SyncEvents::new(0);
    let result = check_reply(ux.on_cache_begin(), "on_cache_begin").and_then(|()| {
        let mut worker = CacheWorker::new(ctx, ux, progress, run.elevation, &sync);
        worker.run(plan)
    });
    ux.on_cache_complete(code_of(&result));
    let working_dir = ctx.user_layout.working_dir(ctx.bundle_id());
    if let Err(err) = remove_dir_if_exists(&working_dir) {
        debug!(path = %working_dir.display(), error = %err, "failed to remove working directory");
    }
    match result {
        Ok(()) => {
            info!(directory = ?plan.layout_directory, "layout complete");
            ApplySummary {
                result: RESULT_SUCCESS,
                restart: RestartState::None,
                suspended: false,
            }
        }
        Err(err) => ApplySummary::failed(&err),
    }
}

/// A suspend requested before anything was registered only leaves a resume
/// marker in the invoking user's scope.
fn suspend_before_registration(run: &ApplyContext<'_>) -> ApplySummary {
    let ctx = run.ctx;
    let state = ResumeState {
        mode: ResumeMode::Suspend,
        action: run.plan.action,
    };
    let result = ctx
        .user_layout
        .ensure_base_dirs()
        .and_then(|()| write_resume_state(&ctx.user_layout, ctx.bundle_id(), state));
    match result {
        Ok(()) => {
            info!("apply suspended before registration");
            ApplySummary {
                result: RESULT_SUCCESS,
                restart: RestartState::None,
                suspended: true,
            }
        }
        Err(err) => ApplySummary::failed(&err),
    }
}

fn start_elevation(run: &ApplyContext<'_>) -> Result<()> {
    loop {
        match run.elevation.ensure_started() {
            Ok(()) => return Ok(()),
            Err(err) => {
                let event = ErrorEvent {
                    kind: ErrorKind::Elevation,
                    subject: run.ctx.bundle_id().to_string(),
                    code: result_code_of(&err),
                    message: format!("{err:#}"),
                };
                match run.ux.on_error(&event) {
                    ErrorReply::Retry => continue,
                    ErrorReply::Ignore | ErrorReply::Abort => return Err(err),
                }
            }
        }
    }
}

fn bundle_needs_elevation(ctx: &EngineContext) -> bool {
    ctx.needs_elevation(ctx.manifest.bundle.per_machine)
}

fn register(run: &ApplyContext<'_>) -> Result<()> {
    let ApplyContext { ctx, ux, plan, .. } = *run;
    check_reply(ux.on_register_begin(), "on_register_begin")?;
    let result = if bundle_needs_elevation(ctx) {
        run.elevation.session_begin(plan.action)
    } else {
        begin_session(ctx, plan.action).map(|_| ())
    };
    ux.on_register_complete(code_of(&result));
    result
}

fn save_state(run: &ApplyContext<'_>) -> Result<()> {
    let ctx = run.ctx;
    let bytes = run.variables.serialize_persisted();
    if bundle_needs_elevation(ctx) {
        run.elevation.save_state(&bytes)
    } else {
        save_variables(ctx.registration_layout(), ctx.bundle_id(), &bytes)
    }
}

fn unregister(
    run: &ApplyContext<'_>,
    succeeded: bool,
    suspended: bool,
    restart: RestartState,
    keep_on_failure: bool,
) -> Result<()> {
    let ctx = run.ctx;
    let action = run.plan.action;
    let elevated = bundle_needs_elevation(ctx);

    let pause = if suspended {
        Some(ResumeMode::Suspend)
    } else if restart != RestartState::None {
        Some(ResumeMode::RebootPending)
    } else {
        None
    };
    if let Some(mode) = pause {
        save_state(run)?;
        info!(mode = mode.as_str(), "registration left resumable");
        return if elevated {
            run.elevation.session_resume(mode, action)
        } else {
            resume_session(ctx, mode, action)
        };
    }

    let keep = if succeeded {
        run.plan.keep_registration
    } else {
        keep_on_failure
    };
    if elevated {
        run.elevation.session_end(keep)
    } else {
        end_session(ctx, keep)
    }
}

fn clean(run: &ApplyContext<'_>) {
    let ctx = run.ctx;
    for action in &run.plan.clean_actions {
        let result = ctx.package(&action.package).and_then(|package| {
            if ctx.needs_elevation(package.per_machine) {
                run.elevation.clean_package(&package.id)
            } else {
                remove_package_cache(ctx, package)
            }
        });
        if let Err(err) = result {
            warn!(package = %action.package, error = %format!("{err:#}"), "failed to clean package cache");
        }
    }
}

enum ExecuteStop {
    NotStarted,
    Completed,
    Suspended,
    RestartInitiated,
    Failed(anyhow::Error),
}

/// Walks the execute plan on the calling thread.
struct Executor<'a, 'r> {
    inputs: &'r ApplyContext<'a>,
    progress: &'r ApplyProgress,
    sync: &'r SyncEvents,
    last_checkpoint: Option<u32>,
    boundary: Option<String>,
    restart: RestartState,
    /// Packages whose forward action succeeded and was not rolled back.
    completed: Vec<String>,
}

impl<'a, 'r> Executor<'a, 'r> {
    fn new(inputs: &'r ApplyContext<'a>, progress: &'r ApplyProgress, sync: &'r SyncEvents) -> Self {
        Self {
            inputs,
            progress,
            sync,
            last_checkpoint: None,
            boundary: None,
            restart: RestartState::None,
            completed: Vec::new(),
        }
    }

    fn run(&mut self) -> ExecuteStop {
        let ux = self.inputs.ux;
        if let Err(err) = check_reply(
            ux.on_execute_begin(self.inputs.plan.execute_steps_total),
            "on_execute_begin",
        ) {
            return ExecuteStop::Failed(err);
        }

        let plan: &'a Plan = self.inputs.plan;
        let actions = &plan.execute_actions;
        let mut index = 0;
        while index < actions.len() {
            if self.inputs.suspend.load(Ordering::SeqCst) {
                info!(step = index, "execution suspended");
                return ExecuteStop::Suspended;
            }
            let step = if self.inputs.ctx.cancel_requested() {
                Err(StepFailure {
                    error: EngineError::UserCancelled.into(),
                    vital: true,
                })
            } else {
                self.run_action(&actions[index])
            };

            match step {
                Ok(StepOutcome::Continue) => index += 1,
                Ok(StepOutcome::RestartInitiated) => {
                    info!("package initiated a restart; stopping execution");
                    return ExecuteStop::RestartInitiated;
                }
                Err(failure) if !failure.vital && !is_user_cancel(&failure.error) => {
                    warn!(
                        error = %format!("{:#}", failure.error),
                        "non-vital package failed; continuing"
                    );
                    index += 1;
                }
                Err(failure) => {
                    self.rollback();
                    let boundary_vital = self
                        .boundary
                        .as_deref()
                        .and_then(|id| self.inputs.ctx.manifest.rollback_boundary(id))
                        .map_or(true, |boundary| boundary.vital);
                    if boundary_vital
                        || is_user_cancel(&failure.error)
                        || is_fatal_to_run(&failure.error)
                    {
                        return ExecuteStop::Failed(failure.error);
                    }
                    warn!(
                        boundary = ?self.boundary,
                        error = %format!("{:#}", failure.error),
                        "non-vital rollback boundary failed; skipping to the next boundary"
                    );
                    index = next_boundary(actions, index + 1);
                }
            }
        }
        ExecuteStop::Completed
    }

    fn run_action(&mut self, action: &ExecuteAction) -> Result<StepOutcome, StepFailure> {
        match action {
            ExecuteAction::Checkpoint { id } => {
                self.last_checkpoint = Some(*id);
                Ok(StepOutcome::Continue)
            }
            ExecuteAction::RollbackBoundary { boundary } => {
                debug!(boundary = %boundary, "entering rollback boundary");
                self.boundary = Some(boundary.clone());
                self.last_checkpoint = None;
                Ok(StepOutcome::Continue)
            }
            ExecuteAction::WaitSyncpoint { event } => {
                self.sync.wait(*event).map_err(|error| StepFailure {
                    error,
                    vital: true,
                })?;
                Ok(StepOutcome::Continue)
            }
            ExecuteAction::UncachePackage { .. } => Ok(StepOutcome::Continue),
            ExecuteAction::Package { package, action } => {
                let vital = self
                    .inputs
                    .ctx
                    .package(package)
                    .map(|package| package.vital)
                    .unwrap_or(true);
                let outcome = self
                    .execute_package(package, *action)
                    .map_err(|error| StepFailure { error, vital })?;
                self.completed.push(package.clone());
                Ok(self.note_outcome(outcome))
            }
            ExecuteAction::RelatedBundle { related, action } => {
                let outcome = self
                    .execute_related(*related, *action)
                    .map_err(|error| StepFailure { error, vital: true })?;
                Ok(self.note_outcome(outcome))
            }
        }
    }

    fn note_outcome(&mut self, outcome: ExecuteOutcome) -> StepOutcome {
        match outcome {
            ExecuteOutcome::RebootForced => {
                self.restart = RestartState::Initiated;
                StepOutcome::RestartInitiated
            }
            ExecuteOutcome::RebootRequired => {
                if self.restart == RestartState::None {
                    self.restart = RestartState::Required;
                }
                StepOutcome::Continue
            }
            ExecuteOutcome::Success | ExecuteOutcome::Error(_) => StepOutcome::Continue,
        }
    }

    fn dispatch(&self, package_id: &str, action: ActionState, rollback: bool) -> Result<ExecuteOutcome> {
        let ctx = self.inputs.ctx;
        let package = ctx.package(package_id)?;
        if ctx.needs_elevation(package.per_machine) {
            self.inputs
                .elevation
                .execute_package(package_id, action, rollback, self.inputs.variables)
        } else {
            drivers::execute(ctx, package, action, rollback, self.inputs.variables)
        }
    }

    /// Runs one forward package action, offering failures to the
    /// interaction collaborator.
    fn execute_package(&mut self, package_id: &str, action: ActionState) -> Result<ExecuteOutcome> {
        let ux = self.inputs.ux;
        check_reply(
            ux.on_execute_package_begin(package_id, action, false),
            "on_execute_package_begin",
        )?;

        let result = loop {
            let attempt = self.dispatch(package_id, action, false).and_then(|outcome| match outcome {
                ExecuteOutcome::Error(code) => Err(EngineError::PackageFailed {
                    package: package_id.to_string(),
                    code,
                }
                .into()),
                other => Ok(other),
            });
            match attempt {
                Ok(outcome) => break Ok(outcome),
                Err(err) if is_user_cancel(&err) || is_fatal_to_run(&err) => break Err(err),
                Err(err) => {
                    let event = ErrorEvent {
                        kind: ErrorKind::Execute,
                        subject: package_id.to_string(),
                        code: result_code_of(&err),
                        message: format!("{err:#}"),
                    };
                    match ux.on_error(&event) {
                        ErrorReply::Retry => continue,
                        ErrorReply::Ignore => {
                            warn!(package = package_id, "package failure ignored");
                            break Ok(ExecuteOutcome::Success);
                        }
                        ErrorReply::Abort => break Err(err),
                    }
                }
            }
        };

        match &result {
            Ok(outcome) => ux.on_execute_package_complete(package_id, RESULT_SUCCESS, Some(*outcome)),
            Err(err) => ux.on_execute_package_complete(package_id, result_code_of(err), None),
        }
        self.progress.complete_execute_step();
        let reply = ux.on_execute_progress(package_id, 100, self.progress.overall_percent());
        let outcome = result?;
        if reply == UxReply::Cancel {
            return Err(EngineError::UserCancelled.into());
        }
        Ok(outcome)
    }

    fn execute_related(&mut self, index: usize, action: ActionState) -> Result<ExecuteOutcome> {
        let ctx = self.inputs.ctx;
        let related = self.inputs.plan.related.get(index).ok_or_else(|| {
            EngineError::InvalidPlan(format!("unknown related bundle index {index}"))
        })?;
        let ux = self.inputs.ux;
        check_reply(
            ux.on_execute_package_begin(&related.bundle_id, action, false),
            "on_execute_package_begin",
        )?;
        let result = if ctx.needs_elevation(related.per_machine) {
            self.inputs.elevation.execute_related(related, action)
        } else {
            crate::registration::execute_related_bundle(ctx, related, action)
        }
        .and_then(|outcome| match outcome {
            ExecuteOutcome::Error(code) => Err(EngineError::PackageFailed {
                package: related.bundle_id.clone(),
                code,
            }
            .into()),
            other => Ok(other),
        });
        match &result {
            Ok(outcome) => {
                ux.on_execute_package_complete(&related.bundle_id, RESULT_SUCCESS, Some(*outcome))
            }
            Err(err) => ux.on_execute_package_complete(&related.bundle_id, result_code_of(err), None),
        }
        self.progress.complete_execute_step();
        result
    }

    /// Undoes the packages completed since the current boundary opened,
    /// newest first. Individual rollback failures are logged and skipped.
    fn rollback(&mut self) {
        let Some(checkpoint) = self.last_checkpoint.take() else {
            debug!(boundary = ?self.boundary, "nothing to roll back in this boundary");
            return;
        };
        let plan: &'a Plan = self.inputs.plan;
        let actions = &plan.rollback_actions;
        let Some(start) = actions.iter().position(
            |action| matches!(action, ExecuteAction::Checkpoint { id } if *id == checkpoint),
        ) else {
            warn!(checkpoint, "checkpoint not present in rollback plan");
            return;
        };
        info!(checkpoint, boundary = ?self.boundary, "rolling back");

        let ctx = self.inputs.ctx;
        let ux = self.inputs.ux;
        for action in actions[..start].iter().rev() {
            match action {
                ExecuteAction::RollbackBoundary { .. } => break,
                ExecuteAction::Package { package, action } => {
                    self.completed.retain(|id| id != package);
                    let _ = ux.on_execute_package_begin(package, *action, true);
                    let result = self.dispatch(package, *action, true);
                    match &result {
                        Ok(outcome) => {
                            if !outcome.is_success() {
                                warn!(package = %package, outcome = ?outcome, "rollback action failed");
                            }
                            ux.on_execute_package_complete(package, RESULT_SUCCESS, Some(*outcome));
                        }
                        Err(err) => {
                            warn!(package = %package, error = %format!("{err:#}"), "rollback action failed");
                            ux.on_execute_package_complete(package, result_code_of(err), None);
                        }
                    }
                }
                ExecuteAction::UncachePackage { package } => {
                    let result = ctx.package(package).and_then(|package| {
                        if ctx.needs_elevation(package.per_machine) {
                            self.inputs.elevation.clean_package(&package.id)
                        } else {
                            remove_package_cache(ctx, package)
                        }
                    });
                    if let Err(err) = result {
                        warn!(package = %package, error = %format!("{err:#}"), "failed to uncache package during rollback");
                    }
                }
                ExecuteAction::Checkpoint { .. }
                | ExecuteAction::WaitSyncpoint { .. }
                | ExecuteAction::RelatedBundle { .. } => {}
            }
        }
    }
}

enum StepOutcome {
    Continue,
    RestartInitiated,
}

struct StepFailure {
    error: anyhow::Error,
    vital: bool,
}

fn next_boundary(actions: &[ExecuteAction], from: usize) -> usize {
    actions
        .iter()
        .skip(from)
        .position(|action| matches!(action, ExecuteAction::RollbackBoundary { .. }))
        .map_or(actions.len(), |offset| from + offset)
}
