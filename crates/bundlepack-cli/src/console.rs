use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::{Mutex, MutexGuard};

use bundlepack_core::{ActionState, CurrentState, DisplayMode, ExecuteOutcome, LaunchAction};
use bundlepack_engine::{
    BootstrapperApplication, EngineHandle, ErrorEvent, ErrorKind, ErrorReply, RelatedBundle,
    RestartState, UxReply, RESULT_SUCCESS,
};
use tracing::{debug, warn};

use crate::render::{format_bytes, TerminalProgress, TerminalRenderer};

/// Answers the engine's questions from a terminal. Non-interactive runs
/// never block on input.
pub(crate) trait Prompter: Send + Sync {
    fn ask(&self, question: &str, choices: &[&str]) -> Option<String>;
}

/// Reads one line from stdin when stdin is a terminal.
pub(crate) struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn ask(&self, question: &str, choices: &[&str]) -> Option<String> {
        if !io::stdin().is_terminal() {
            return None;
        }
        print!("{question} [{}] ", choices.join("/"));
        io::stdout().flush().ok()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        Some(line.trim().to_ascii_lowercase())
    }
}

/// Console front-end. Drives Detect, Plan, and Apply for one action, then
/// lets the engine settle the exit code.
pub(crate) struct ConsoleApplication {
    action: LaunchAction,
    display: DisplayMode,
    renderer: TerminalRenderer,
    prompter: Box<dyn Prompter>,
    handle: Mutex<Option<EngineHandle>>,
    progress: Mutex<Option<TerminalProgress>>,
}

impl ConsoleApplication {
    pub(crate) fn new(action: LaunchAction, display: DisplayMode) -> Self {
        Self::with_prompter(action, display, Box::new(StdinPrompter))
    }

    pub(crate) fn with_prompter(
        action: LaunchAction,
        display: DisplayMode,
        prompter: Box<dyn Prompter>,
    ) -> Self {
        Self {
            action,
            display,
            renderer: TerminalRenderer::for_display(display),
            prompter,
            handle: Mutex::new(None),
            progress: Mutex::new(None),
        }
    }

    fn interactive(&self) -> bool {
        self.display == DisplayMode::Full
    }

    fn handle(&self) -> MutexGuard<'_, Option<EngineHandle>> {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn progress(&self) -> MutexGuard<'_, Option<TerminalProgress>> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends the next command, or gives up the handle so the engine ends
    /// the run with its own exit code.
    fn next(&self, command: impl FnOnce(&EngineHandle) -> anyhow::Result<()>) {
        let mut handle = self.handle();
        if let Some(current) = handle.as_ref() {
            if let Err(err) = command(current) {
                warn!(error = %format!("{err:#}"), "failed to queue engine command");
                *handle = None;
            }
        }
    }

    fn finish(&self, result: u32) {
        let mut handle = self.handle();
        if result != RESULT_SUCCESS {
            if let Some(current) = handle.as_ref() {
                let _ = current.quit(result);
            }
        }
        *handle = None;
    }

    fn update_progress(&self, percent: u8) -> UxReply {
        if let Some(progress) = self.progress().as_mut() {
            progress.set(percent);
        }
        UxReply::Continue
    }
}

impl BootstrapperApplication for ConsoleApplication {
    fn on_startup(&self, handle: EngineHandle) {
        self.renderer.print_section(&format!("{} bundle", self.action.as_str()));
        *self.handle() = Some(handle);
        self.next(|handle| handle.detect());
    }

    fn on_detect_related_bundle(&self, related: &RelatedBundle) -> UxReply {
        self.renderer.print_status(
            "info",
            &format!("found related bundle {} {}", related.bundle_id, related.version),
        );
        UxReply::Continue
    }

    fn on_detect_package_complete(&self, package_id: &str, result: u32, state: CurrentState) {
        debug!(package = package_id, result, state = state.as_str(), "package detected");
    }

    fn on_detect_complete(&self, result: u32) {
        if result != RESULT_SUCCESS {
            self.renderer
                .print_status("error", &format!("detection failed with result {result}"));
            self.finish(result);
            return;
        }
        let action = self.action;
        self.next(|handle| handle.plan(action));
    }

    fn on_plan_complete(&self, result: u32) {
        if result != RESULT_SUCCESS {
            self.renderer
                .print_status("error", &format!("planning failed with result {result}"));
            self.finish(result);
            return;
        }
        self.next(|handle| handle.apply());
    }

    fn on_apply_begin(&self) -> UxReply {
        *self.progress() = Some(self.renderer.start_progress(self.action.as_str()));
        UxReply::Continue
    }

    fn on_cache_package_begin(&self, package_id: &str, payload_count: usize, bytes: u64) -> UxReply {
        if let Some(progress) = self.progress().as_ref() {
            progress.set_message(package_id);
        }
        debug!(package = package_id, payload_count, bytes = %format_bytes(bytes), "caching package");
        UxReply::Continue
    }

    fn on_acquire_progress(
        &self,
        _artifact_id: &str,
        _bytes_done: u64,
        _bytes_total: u64,
        overall_percent: u8,
    ) -> UxReply {
        self.update_progress(overall_percent)
    }

    fn on_execute_package_begin(&self, package_id: &str, action: ActionState, rollback: bool) -> UxReply {
        if let Some(progress) = self.progress().as_ref() {
            progress.set_message(package_id);
        }
        if rollback {
            self.renderer
                .print_status("warn", &format!("rolling back {package_id}"));
        } else {
            debug!(package = package_id, action = action.as_str(), "executing package");
        }
        UxReply::Continue
    }

    fn on_execute_progress(&self, _package_id: &str, _package_percent: u8, overall_percent: u8) -> UxReply {
        self.update_progress(overall_percent)
    }

    fn on_execute_package_complete(
        &self,
        package_id: &str,
        result: u32,
        outcome: Option<ExecuteOutcome>,
    ) {
        match outcome {
            Some(ExecuteOutcome::RebootRequired | ExecuteOutcome::RebootForced) => self
                .renderer
                .print_status("warn", &format!("{package_id} requires a restart")),
            Some(_) => {}
            None => self
                .renderer
                .print_status("error", &format!("{package_id} failed with result {result}")),
        }
    }

    fn on_error(&self, event: &ErrorEvent) -> ErrorReply {
        self.renderer.print_status("error", &event.message);
        if !self.interactive() {
            return ErrorReply::Abort;
        }
        let choices: &[&str] = match event.kind {
            ErrorKind::Execute => &["retry", "ignore", "abort"],
            ErrorKind::Acquire | ErrorKind::Verify | ErrorKind::Elevation => &["retry", "abort"],
        };
        let answer = self
            .prompter
            .ask(&format!("{} failed.", event.subject), choices);
        match answer.as_deref() {
            Some("r" | "retry") => ErrorReply::Retry,
            Some("i" | "ignore") if choices.contains(&"ignore") => ErrorReply::Ignore,
            _ => ErrorReply::Abort,
        }
    }

    fn on_restart_required(&self) -> bool {
        if !self.interactive() {
            return false;
        }
        matches!(
            self.prompter
                .ask("A restart is required to finish. Restart now?", &["yes", "no"])
                .as_deref(),
            Some("y" | "yes")
        )
    }

    fn on_apply_complete(&self, result: u32, restart: RestartState) {
        if let Some(progress) = self.progress().take() {
            if result == RESULT_SUCCESS {
                progress.finish_success();
            } else {
                progress.finish_abandon();
            }
        }
        if result == RESULT_SUCCESS {
            let message = match restart {
                RestartState::None => format!("{} complete", self.action.as_str()),
                RestartState::Required => {
                    format!("{} complete; restart required", self.action.as_str())
                }
                RestartState::Initiated => {
                    format!("{} complete; restarting", self.action.as_str())
                }
            };
            self.renderer.print_status("ok", &message);
        } else {
            self.renderer.print_status(
                "error",
                &format!("{} failed with result {result}", self.action.as_str()),
            );
        }
        self.finish(RESULT_SUCCESS);
    }
}
