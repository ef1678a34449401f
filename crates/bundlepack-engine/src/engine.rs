use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bundlepack_core::{
    BundleManifest, DisplayMode, LaunchAction, RestartPolicy, ResumeMode, VariableValue,
    Variables,
};
use tracing::{debug, info, warn};

use crate::apply::{apply, ApplyContext, ApplySummary};
use crate::cache::is_package_cached;
use crate::context::EngineContext;
use crate::drivers;
use crate::elevation::ElevationSlot;
use crate::error::{
    result_code_of, EngineError, RESULT_RESTART_INITIATED, RESULT_RESTART_REQUIRED,
    RESULT_SUCCESS,
};
use crate::plan::{build_plan, PackageState, Plan, PlanInput};
use crate::process::describe_command;
use crate::registration::{
    list_related, load_variables, read_record, read_resume_state, RelatedBundle,
};
use crate::ux::{check_reply, BootstrapperApplication, RestartState};

/// Requests the interaction collaborator issues to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Detect,
    Plan(LaunchAction),
    Apply,
    Reload,
    Quit(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Detecting,
    Planning,
    Applying,
    Quitting,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Detecting => "detecting",
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Quitting => "quitting",
        }
    }
}

/// The collaborator's side of the command queue. Cloneable so a front-end
/// can keep one on another thread for cancel and suspend.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: Sender<EngineCommand>,
    cancel: Arc<AtomicBool>,
    suspend: Arc<AtomicBool>,
}

impl EngineHandle {
    fn send(&self, command: EngineCommand) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|err| anyhow!("engine is no longer accepting commands: {:?}", err.0))
    }

    pub fn detect(&self) -> Result<()> {
        self.send(EngineCommand::Detect)
    }

    pub fn plan(&self, action: LaunchAction) -> Result<()> {
        self.send(EngineCommand::Plan(action))
    }

    pub fn apply(&self) -> Result<()> {
        self.send(EngineCommand::Apply)
    }

    pub fn reload(&self) -> Result<()> {
        self.send(EngineCommand::Reload)
    }

    pub fn quit(&self, exit_code: u32) -> Result<()> {
        self.send(EngineCommand::Quit(exit_code))
    }

    /// Stops acquisition and execution at the next check; pending work is
    /// rolled back.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stops execution at the next step and leaves the bundle resumable.
    pub fn suspend(&self) {
        self.suspend.store(true, Ordering::SeqCst);
    }
}

/// Start-up choices from the command surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub action: LaunchAction,
    pub display: DisplayMode,
    pub restart: RestartPolicy,
    pub layout_directory: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            action: LaunchAction::Install,
            display: DisplayMode::Full,
            restart: RestartPolicy::Prompt,
            layout_directory: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: u32,
    pub restart: RestartState,
}

#[derive(Debug, Clone)]
struct Detection {
    installed: bool,
    states: Vec<PackageState>,
    related: Vec<RelatedBundle>,
}

/// The phase orchestrator. Detect and Plan may run any number of times;
/// Apply ends the run unless the collaborator asks for a reload.
pub struct Engine {
    ctx: EngineContext,
    options: EngineOptions,
    phase: Phase,
    variables: Variables,
    detection: Option<Detection>,
    plan: Option<Plan>,
    applied: Option<ApplySummary>,
    restart: RestartState,
    suspend: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(ctx: EngineContext, options: EngineOptions) -> Result<Self> {
        let variables = initial_variables(&ctx)?;
        Ok(Self {
            ctx,
            options,
            phase: Phase::Initializing,
            variables,
            detection: None,
            plan: None,
            applied: None,
            restart: RestartState::None,
            suspend: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    fn handle(&self) -> (EngineHandle, Receiver<EngineCommand>) {
        let (sender, receiver) = mpsc::channel();
        let handle = EngineHandle {
            sender,
            cancel: self.ctx.cancel.clone(),
            suspend: self.suspend.clone(),
        };
        (handle, receiver)
    }

    /// Hands the collaborator a command handle and services its commands
    /// until it quits or drops every handle.
    pub fn run(&mut self, ux: &dyn BootstrapperApplication) -> Result<RunOutcome> {
        loop {
            self.phase = Phase::Initializing;
            let (handle, receiver) = self.handle();
            ux.on_startup(handle);

            let mut reload = false;
            let mut exit_code = None;
            while let Ok(command) = receiver.recv() {
                debug!(command = ?command, phase = self.phase.as_str(), "engine command");
                match command {
                    EngineCommand::Detect => self.detect(ux),
                    EngineCommand::Plan(action) => self.plan_action(ux, action),
                    EngineCommand::Apply => self.apply(ux),
                    EngineCommand::Reload => {
                        reload = true;
                        break;
                    }
                    EngineCommand::Quit(code) => {
                        exit_code = Some(code);
                        break;
                    }
                }
            }

            if reload {
                info!("reloading engine");
                self.reset()?;
                continue;
            }

            self.phase = Phase::Quitting;
            ux.on_shutdown();
            let exit_code = exit_code.unwrap_or_else(|| self.exit_code());
            info!(exit_code, "engine quitting");
            return Ok(RunOutcome {
                exit_code,
                restart: self.restart,
            });
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.variables = initial_variables(&self.ctx)?;
        self.detection = None;
        self.plan = None;
        self.applied = None;
        self.restart = RestartState::None;
        self.suspend.store(false, Ordering::SeqCst);
        self.ctx.cancel.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Exit code of the run so far: the failing result, else the restart
    /// state.
    pub fn exit_code(&self) -> u32 {
        match self.applied {
            Some(summary) if !summary.succeeded() => summary.result,
            _ => match self.restart {
                RestartState::None => RESULT_SUCCESS,
                RestartState::Required => RESULT_RESTART_REQUIRED,
                RestartState::Initiated => RESULT_RESTART_INITIATED,
            },
        }
    }

    pub fn detect(&mut self, ux: &dyn BootstrapperApplication) {
        self.phase = Phase::Detecting;
        self.plan = None;
        let result = self.detect_packages(ux);
        let code = match result {
            Ok(detection) => {
                self.detection = Some(detection);
                RESULT_SUCCESS
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "detect failed");
                self.detection = None;
                result_code_of(&err)
            }
        };
        ux.on_detect_complete(code);
    }

    fn detect_packages(&mut self, ux: &dyn BootstrapperApplication) -> Result<Detection> {
        let ctx = &self.ctx;
        let installed = read_record(ctx.registration_layout(), ctx.bundle_id())?.is_some();
        check_reply(
            ux.on_detect_begin(installed, ctx.manifest.packages.len()),
            "on_detect_begin",
        )?;
        self.variables
            .set_builtin("BundleInstalled", VariableValue::Numeric(i64::from(installed)));
        let reboot_pending = read_resume_state(ctx.registration_layout(), ctx.bundle_id())?
            .is_some_and(|state| state.mode == ResumeMode::RebootPending);
        self.variables
            .set_builtin("RebootPending", VariableValue::Numeric(i64::from(reboot_pending)));

        let related = list_related(ctx)?;
        for bundle in &related {
            info!(related = %bundle.bundle_id, version = %bundle.version, "detected related bundle");
            check_reply(ux.on_detect_related_bundle(bundle), "on_detect_related_bundle")?;
        }

        let mut states = Vec::with_capacity(ctx.manifest.packages.len());
        for package in &ctx.manifest.packages {
            let install_condition = match package.install_condition.as_deref() {
                Some(condition) => ctx
                    .conditions
                    .evaluate(condition, &self.variables)
                    .with_context(|| {
                        format!("failed to evaluate install condition for '{}'", package.id)
                    })?,
                None => true,
            };
            let (current, code) = match drivers::detect(ctx, package, &self.variables) {
                Ok(current) => (current, RESULT_SUCCESS),
                Err(err) => {
                    warn!(package = %package.id, error = %format!("{err:#}"), "package detection failed");
                    (bundlepack_core::CurrentState::Unknown, result_code_of(&err))
                }
            };
            let cached = is_package_cached(ctx, package);
            debug!(
                package = %package.id,
                current = current.as_str(),
                cached,
                install_condition,
                "detected package"
            );
            ux.on_detect_package_complete(&package.id, code, current);
            states.push(PackageState {
                current,
                cached,
                install_condition,
            });
        }

        Ok(Detection {
            installed,
            states,
            related,
        })
    }

    pub fn plan_action(&mut self, ux: &dyn BootstrapperApplication, action: LaunchAction) {
        if self.detection.is_none() {
            self.detect(ux);
        }
        self.phase = Phase::Planning;
        let result = self.build(ux, action);
        let code = match result {
            Ok(plan) => {
                info!(
                    action = action.as_str(),
                    execute_steps = plan.execute_steps_total,
                    cache_bytes = plan.cache_bytes_total,
                    per_machine = plan.per_machine,
                    "plan complete"
                );
                self.plan = Some(plan);
                RESULT_SUCCESS
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "plan failed");
                self.plan = None;
                result_code_of(&err)
            }
        };
        ux.on_plan_complete(code);
    }

    fn build(&mut self, ux: &dyn BootstrapperApplication, action: LaunchAction) -> Result<Plan> {
        let detection = self
            .detection
            .as_ref()
            .ok_or_else(|| EngineError::InvalidPlan("detect has not completed".to_string()))?;
        check_reply(
            ux.on_plan_begin(self.ctx.manifest.packages.len()),
            "on_plan_begin",
        )?;
        self.variables
            .set_builtin("BundleAction", VariableValue::String(action.as_str().to_string()));
        debug!(installed = detection.installed, "planning");
        build_plan(
            &PlanInput {
                manifest: &self.ctx.manifest,
                states: &detection.states,
                action,
                related: &detection.related,
                layout_directory: self.options.layout_directory.clone(),
            },
            ux,
        )
    }

    pub fn apply(&mut self, ux: &dyn BootstrapperApplication) {
        let Some(plan) = self.plan.take() else {
            let err = anyhow::Error::from(EngineError::InvalidPlan(
                "apply requested before a plan".to_string(),
            ));
            warn!(error = %err, "apply rejected");
            ux.on_apply_complete(result_code_of(&err), RestartState::None);
            return;
        };
        self.phase = Phase::Applying;

        let elevation = ElevationSlot::new(self.ctx.clone());
        let summary = apply(&ApplyContext {
            ctx: &self.ctx,
            ux,
            plan: &plan,
            variables: &self.variables,
            elevation: &elevation,
            suspend: &self.suspend,
        });
        elevation.shutdown();

        self.restart = self.settle_restart(ux, summary.restart);
        info!(
            result = summary.result,
            restart = ?self.restart,
            suspended = summary.suspended,
            "apply complete"
        );
        self.applied = Some(summary);
        self.plan = Some(plan);
        ux.on_apply_complete(summary.result, self.restart);
    }

    /// Applies restart policy to a run that needs a restart. Returns
    /// `Initiated` only when a restart was actually requested from the OS.
    fn settle_restart(&self, ux: &dyn BootstrapperApplication, needed: RestartState) -> RestartState {
        if needed == RestartState::None {
            return RestartState::None;
        }
        let allowed = match self.options.restart {
            RestartPolicy::Never => false,
            RestartPolicy::Automatic => true,
            RestartPolicy::Prompt => {
                self.options.display != DisplayMode::None && ux.on_restart_required()
            }
        };
        if !allowed {
            info!("restart required but not allowed by policy");
            return RestartState::Required;
        }
        match self.request_restart() {
            Ok(()) => RestartState::Initiated,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to initiate restart");
                RestartState::Required
            }
        }
    }

    fn request_restart(&self) -> Result<()> {
        let mut command = restart_command();
        let output = self.ctx.runner.run(&mut command)?;
        if output.code != 0 {
            return Err(anyhow!(
                "{} exited with {}",
                describe_command(&command),
                output.code
            ));
        }
        info!("system restart initiated");
        Ok(())
    }
}

fn restart_command() -> Command {
    if cfg!(windows) {
        let mut command = Command::new("shutdown");
        command.args(["/r", "/t", "0"]);
        command
    } else {
        let mut command = Command::new("shutdown");
        command.args(["-r", "now"]);
        command
    }
}

/// Authored variables, persisted values from an interrupted run, then the
/// built-ins describing this bundle and process.
fn initial_variables(ctx: &EngineContext) -> Result<Variables> {
    let mut variables = declared_variables(&ctx.manifest)?;
    let layout = ctx.registration_layout();
    if read_resume_state(layout, ctx.bundle_id())?.is_some_and(|state| state.mode.is_resumable()) {
        if let Some(bytes) = load_variables(layout, ctx.bundle_id())? {
            let restored = variables
                .deserialize_persisted(&bytes)
                .context("failed to restore persisted variables")?;
            info!(restored, "restored variables from interrupted run");
        }
    }
    set_context_variables(ctx, &mut variables);
    Ok(variables)
}

pub fn declared_variables(manifest: &BundleManifest) -> Result<Variables> {
    let mut variables = Variables::new();
    for declared in &manifest.variables {
        if declared.numeric {
            let value = declared.value.trim().parse::<i64>().with_context(|| {
                format!("variable '{}' is not numeric: {}", declared.name, declared.value)
            })?;
            variables.set_numeric(&declared.name, value);
        } else {
            variables.set_string(&declared.name, declared.value.clone());
        }
    }
    Ok(variables)
}

/// Built-ins every process of a run can compute for itself.
pub fn set_context_variables(ctx: &EngineContext, variables: &mut Variables) {
    let bundle = &ctx.manifest.bundle;
    variables.set_builtin("BundleId", VariableValue::String(bundle.id.clone()));
    variables.set_builtin("BundleVersion", VariableValue::Version(bundle.version.clone()));
    variables.set_builtin(
        "BundleElevated",
        VariableValue::Numeric(i64::from(ctx.elevated)),
    );
    variables.set_builtin(
        "BundleSourceDir",
        VariableValue::String(ctx.source_dir.display().to_string()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_variables_parse_numeric_values() {
        let manifest = BundleManifest::from_toml_str(
            r#"
[bundle]
id = "suite"
version = "1.0.0"

[[variables]]
name = "Level"
value = " 3 "
numeric = true

[[variables]]
name = "Folder"
value = "/opt/suite"
"#,
        )
        .expect("manifest");
        let variables = declared_variables(&manifest).expect("variables");
        assert_eq!(variables.get_numeric("Level"), Some(3));
        assert_eq!(variables.get_string("Folder").as_deref(), Some("/opt/suite"));
    }

    #[test]
    fn handle_commands_reach_the_queue() {
        let (sender, receiver) = mpsc::channel();
        let handle = EngineHandle {
            sender,
            cancel: Arc::new(AtomicBool::new(false)),
            suspend: Arc::new(AtomicBool::new(false)),
        };
        handle.detect().expect("detect");
        handle.plan(LaunchAction::Repair).expect("plan");
        handle.quit(5).expect("quit");
        handle.suspend();
        assert_eq!(receiver.recv().expect("first"), EngineCommand::Detect);
        assert_eq!(
            receiver.recv().expect("second"),
            EngineCommand::Plan(LaunchAction::Repair)
        );
        assert_eq!(receiver.recv().expect("third"), EngineCommand::Quit(5));
        assert!(handle.suspend.load(Ordering::SeqCst));

        drop(receiver);
        assert!(handle.apply().is_err());
    }
}
