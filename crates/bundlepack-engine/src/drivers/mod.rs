//! Per-kind package drivers: detect presence, choose execute and rollback
//! actions, and run an action to an [`ExecuteOutcome`].

mod exe;
mod msi;
mod msp;
mod msu;

use std::path::PathBuf;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use bundlepack_core::{
    ActionState, CurrentState, ExecuteOutcome, Package, PackageDetails, RequestState, Variables,
};
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::process::describe_command;

pub use exe::translate_exit_code as translate_exe_exit_code;
pub use msi::translate_exit_code as translate_msi_exit_code;
pub use msu::translate_exit_code as translate_msu_exit_code;

/// What a package kind allows from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub repairable: bool,
    pub uninstallable: bool,
}

pub fn capabilities(package: &Package) -> Capabilities {
    let uninstallable = package.uninstallable();
    match &package.details {
        PackageDetails::Msi { .. } => Capabilities {
            repairable: true,
            uninstallable,
        },
        PackageDetails::Msp {
            target_product_codes,
            ..
        } => Capabilities {
            repairable: true,
            uninstallable: uninstallable && !target_product_codes.is_empty(),
        },
        PackageDetails::Exe {
            repair_arguments,
            uninstall_arguments,
            ..
        } => Capabilities {
            repairable: repair_arguments.is_some(),
            uninstallable: uninstallable && uninstall_arguments.is_some(),
        },
        PackageDetails::Msu { kb, .. } => Capabilities {
            repairable: false,
            uninstallable: uninstallable && kb.is_some(),
        },
    }
}

pub fn detect(
    ctx: &EngineContext,
    package: &Package,
    variables: &Variables,
) -> Result<CurrentState> {
    if let Some(condition) = package.detect_condition() {
        let present = ctx
            .conditions
            .evaluate(condition, variables)
            .with_context(|| format!("failed to evaluate detect condition for '{}'", package.id))?;
        return Ok(presence(present));
    }

    let present = match &package.details {
        PackageDetails::Msi { product_code, .. } => ctx.probe.product_installed(product_code)?,
        PackageDetails::Msp {
            patch_code,
            target_product_codes,
        } => ctx.probe.patch_applied(patch_code, target_product_codes)?,
        PackageDetails::Msu { kb: Some(kb), .. } => ctx.probe.update_installed(kb)?,
        PackageDetails::Exe { .. } | PackageDetails::Msu { kb: None, .. } => false,
    };
    Ok(presence(present))
}

fn presence(present: bool) -> CurrentState {
    if present {
        CurrentState::Present
    } else {
        CurrentState::Absent
    }
}

/// The execute action that moves `current` toward `requested`.
pub fn execute_action(
    capabilities: Capabilities,
    current: CurrentState,
    requested: RequestState,
) -> ActionState {
    match (current, requested) {
        (_, RequestState::None) => ActionState::None,
        (CurrentState::Present, RequestState::Present) => ActionState::None,
        (CurrentState::Present, RequestState::Repair) => {
            if capabilities.repairable {
                ActionState::Repair
            } else {
                ActionState::None
            }
        }
        (CurrentState::Present, RequestState::Absent) => {
            if capabilities.uninstallable {
                ActionState::Uninstall
            } else {
                ActionState::None
            }
        }
        (CurrentState::Absent | CurrentState::Unknown, RequestState::Present | RequestState::Repair) => {
            ActionState::Install
        }
        (CurrentState::Absent | CurrentState::Unknown, RequestState::Absent) => ActionState::None,
    }
}

/// Returns `(execute, rollback)`. The rollback action is planned from the
/// state a successful execute would leave back toward the current state.
pub fn plan_actions(
    package: &Package,
    current: CurrentState,
    requested: RequestState,
) -> (ActionState, ActionState) {
    let capabilities = capabilities(package);
    let execute = execute_action(capabilities, current, requested);
    if execute.is_none() {
        return (ActionState::None, ActionState::None);
    }
    let restore = match current {
        CurrentState::Present => RequestState::Present,
        CurrentState::Absent | CurrentState::Unknown => RequestState::Absent,
    };
    let rollback = execute_action(capabilities, current.after(execute), restore);
    (execute, rollback)
}

/// Runs `action` for `package`. The same entry point serves forward and
/// rollback execution; `rollback` only changes logging.
pub fn execute(
    ctx: &EngineContext,
    package: &Package,
    action: ActionState,
    rollback: bool,
    variables: &Variables,
) -> Result<ExecuteOutcome> {
    if action.is_none() {
        return Ok(ExecuteOutcome::Success);
    }
    info!(
        package = %package.id,
        kind = package.kind().as_str(),
        action = action.as_str(),
        rollback,
        "executing package"
    );

    let outcome = match &package.details {
        PackageDetails::Msi { .. } => msi::execute(ctx, package, action, variables)?,
        PackageDetails::Msp { .. } => msp::execute(ctx, package, action)?,
        PackageDetails::Exe { .. } => exe::execute(ctx, package, action, variables)?,
        PackageDetails::Msu { .. } => msu::execute(ctx, package, action)?,
    };

    match outcome {
        ExecuteOutcome::Error(code) => {
            warn!(package = %package.id, code, rollback, "package returned an error");
        }
        other => info!(package = %package.id, outcome = ?other, rollback, "package finished"),
    }
    Ok(outcome)
}

/// Replaces `[Name]` references with variable values; unknown names render
/// empty and `[[` escapes a literal bracket.
pub fn format_arguments(template: &str, variables: &Variables) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('[') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        if let Some(escaped) = after.strip_prefix('[') {
            rendered.push('[');
            rest = escaped;
            continue;
        }
        match after.find(']') {
            Some(close) => {
                let name = &after[..close];
                if let Some(value) = variables.get(name) {
                    rendered.push_str(&value.to_string());
                }
                rest = &after[close + 1..];
            }
            None => {
                rendered.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

pub(crate) fn primary_payload_path(ctx: &EngineContext, package: &Package) -> Result<PathBuf> {
    let key = package
        .primary_payload()
        .ok_or_else(|| anyhow!("package '{}' has no payload", package.id))?;
    let payload = ctx.payload(key)?;
    Ok(ctx.cached_payload_path(package, payload))
}

pub(crate) fn run_translated(
    ctx: &EngineContext,
    command: &mut Command,
    translate: impl Fn(i32) -> ExecuteOutcome,
) -> Result<ExecuteOutcome> {
    let description = describe_command(command);
    let output = ctx.runner.run(command)?;
    let outcome = translate(output.code);
    if !outcome.is_success() {
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            warn!(command = %description, stderr, "process reported errors");
        }
    }
    Ok(outcome)
}

/// The least successful of two outcomes: errors beat restarts, restarts
/// beat success.
pub(crate) fn worst_outcome(left: ExecuteOutcome, right: ExecuteOutcome) -> ExecuteOutcome {
    fn rank(outcome: ExecuteOutcome) -> u8 {
        match outcome {
            ExecuteOutcome::Success => 0,
            ExecuteOutcome::RebootRequired => 1,
            ExecuteOutcome::RebootForced => 2,
            ExecuteOutcome::Error(_) => 3,
        }
    }
    if rank(right) > rank(left) {
        right
    } else {
        left
    }
}
