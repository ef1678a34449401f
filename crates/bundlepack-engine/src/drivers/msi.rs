use std::process::Command;

use anyhow::Result;
use bundlepack_core::{ActionState, ExecuteOutcome, Package, PackageDetails, Variables};

use super::{format_arguments, primary_payload_path, run_translated};
use crate::context::EngineContext;
use crate::error::EngineError;

const SUCCESS: i32 = 0;
const PRODUCT_VERSION_INSTALLED: i32 = 1638;
const REBOOT_INITIATED: i32 = 1641;
const REBOOT_REQUIRED: i32 = 3010;

pub fn translate_exit_code(code: i32) -> ExecuteOutcome {
    match code {
        SUCCESS | PRODUCT_VERSION_INSTALLED => ExecuteOutcome::Success,
        REBOOT_REQUIRED => ExecuteOutcome::RebootRequired,
        REBOOT_INITIATED => ExecuteOutcome::RebootForced,
        other => ExecuteOutcome::Error(other),
    }
}

/// Flags every unattended installer-database invocation carries.
pub(crate) fn push_quiet_flags(command: &mut Command) {
    command
        .arg("/qn")
        .arg("/norestart")
        .arg("REBOOT=ReallySuppress");
}

pub(super) fn execute(
    ctx: &EngineContext,
    package: &Package,
    action: ActionState,
    variables: &Variables,
) -> Result<ExecuteOutcome> {
    let PackageDetails::Msi {
        product_code,
        properties,
    } = &package.details
    else {
        return Err(EngineError::InvalidPlan(format!("'{}' is not an msi", package.id)).into());
    };

    let mut command = Command::new("msiexec");
    match action {
        ActionState::None => return Ok(ExecuteOutcome::Success),
        ActionState::Install => {
            command.arg("/i").arg(primary_payload_path(ctx, package)?);
        }
        ActionState::Repair => {
            command.arg("/fvomus").arg(primary_payload_path(ctx, package)?);
        }
        ActionState::Uninstall => {
            command.arg("/x").arg(product_code);
        }
    }
    push_quiet_flags(&mut command);
    if action != ActionState::Uninstall {
        for property in properties {
            command.arg(format_arguments(property, variables));
        }
    }
    run_translated(ctx, &mut command, translate_exit_code)
}
