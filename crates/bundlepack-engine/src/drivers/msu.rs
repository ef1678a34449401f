use std::process::Command;

use anyhow::Result;
use bundlepack_core::{ActionState, ExecuteOutcome, Package, PackageDetails};

use super::{primary_payload_path, run_translated};
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::probe::normalize_kb;

const SUCCESS: i32 = 0;
const ALREADY_INSTALLED: i32 = 2_359_302;
const REBOOT_REQUIRED: i32 = 3010;

pub fn translate_exit_code(code: i32) -> ExecuteOutcome {
    match code {
        SUCCESS | ALREADY_INSTALLED => ExecuteOutcome::Success,
        REBOOT_REQUIRED => ExecuteOutcome::RebootRequired,
        other => ExecuteOutcome::Error(other),
    }
}

pub(super) fn execute(
    ctx: &EngineContext,
    package: &Package,
    action: ActionState,
) -> Result<ExecuteOutcome> {
    let PackageDetails::Msu { kb, .. } = &package.details else {
        return Err(EngineError::InvalidPlan(format!("'{}' is not an update", package.id)).into());
    };

    let mut command = Command::new("wusa");
    match action {
        ActionState::None => return Ok(ExecuteOutcome::Success),
        ActionState::Install | ActionState::Repair => {
            command.arg(primary_payload_path(ctx, package)?);
        }
        ActionState::Uninstall => {
            let kb = kb.as_deref().ok_or_else(|| {
                EngineError::InvalidPlan(format!(
                    "update '{}' cannot be removed without a KB number",
                    package.id
                ))
            })?;
            let kb = normalize_kb(kb);
            command
                .arg("/uninstall")
                .arg(format!("/kb:{}", kb.trim_start_matches("KB")));
        }
    }
    command.arg("/quiet").arg("/norestart");
    run_translated(ctx, &mut command, translate_exit_code)
}
