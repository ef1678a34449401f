use std::process::Command;

use anyhow::Result;
use bundlepack_core::{ActionState, ExecuteOutcome, Package, PackageDetails};

use super::msi::{push_quiet_flags, translate_exit_code};
use super::{primary_payload_path, run_translated, worst_outcome};
use crate::context::EngineContext;
use crate::error::EngineError;

pub(super) fn execute(
    ctx: &EngineContext,
    package: &Package,
    action: ActionState,
) -> Result<ExecuteOutcome> {
    let PackageDetails::Msp {
        patch_code,
        target_product_codes,
    } = &package.details
    else {
        return Err(EngineError::InvalidPlan(format!("'{}' is not a patch", package.id)).into());
    };

    match action {
        ActionState::None => Ok(ExecuteOutcome::Success),
        ActionState::Install | ActionState::Repair => {
            let mut command = Command::new("msiexec");
            command.arg("/p").arg(primary_payload_path(ctx, package)?);
            push_quiet_flags(&mut command);
            run_translated(ctx, &mut command, translate_exit_code)
        }
        ActionState::Uninstall => {
            if target_product_codes.is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "patch '{}' has no target products to remove it from",
                    package.id
                ))
                .into());
            }
            let mut outcome = ExecuteOutcome::Success;
            for product in target_product_codes {
                let mut command = Command::new("msiexec");
                command
                    .arg("/package")
                    .arg(product)
                    .arg(format!("MSIPATCHREMOVE={patch_code}"));
                push_quiet_flags(&mut command);
                let result = run_translated(ctx, &mut command, translate_exit_code)?;
                outcome = worst_outcome(outcome, result);
                if matches!(outcome, ExecuteOutcome::Error(_)) {
                    break;
                }
            }
            Ok(outcome)
        }
    }
}
