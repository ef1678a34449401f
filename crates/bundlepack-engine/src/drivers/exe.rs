use std::process::Command;

use anyhow::Result;
use bundlepack_core::{
    ActionState, ExecuteOutcome, ExitCodeBehavior, ExitCodeRule, Package, PackageDetails,
    Variables,
};

use super::{format_arguments, primary_payload_path, run_translated};
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::process::split_arguments;

/// Classifies `code` against the authored table: an exact match wins, then
/// a wildcard rule, then `0 => success`.
pub fn translate_exit_code(rules: &[ExitCodeRule], code: i32) -> ExecuteOutcome {
    let behavior = rules
        .iter()
        .find(|rule| rule.code == Some(code))
        .or_else(|| rules.iter().find(|rule| rule.code.is_none()))
        .map(|rule| rule.behavior);

    match behavior {
        Some(ExitCodeBehavior::Success) => ExecuteOutcome::Success,
        Some(ExitCodeBehavior::Error) => ExecuteOutcome::Error(code),
        Some(ExitCodeBehavior::RebootRequired) => ExecuteOutcome::RebootRequired,
        Some(ExitCodeBehavior::RebootForced) => ExecuteOutcome::RebootForced,
        None if code == 0 => ExecuteOutcome::Success,
        None => ExecuteOutcome::Error(code),
    }
}

pub(super) fn execute(
    ctx: &EngineContext,
    package: &Package,
    action: ActionState,
    variables: &Variables,
) -> Result<ExecuteOutcome> {
    let PackageDetails::Exe {
        install_arguments,
        repair_arguments,
        uninstall_arguments,
        exit_codes,
        ..
    } = &package.details
    else {
        return Err(
            EngineError::InvalidPlan(format!("'{}' is not an executable", package.id)).into(),
        );
    };

    let arguments = match action {
        ActionState::None => return Ok(ExecuteOutcome::Success),
        ActionState::Install => install_arguments.as_deref(),
        ActionState::Repair => Some(repair_arguments.as_deref().ok_or_else(|| {
            EngineError::InvalidPlan(format!("'{}' has no repair arguments", package.id))
        })?),
        ActionState::Uninstall => Some(uninstall_arguments.as_deref().ok_or_else(|| {
            EngineError::InvalidPlan(format!("'{}' has no uninstall arguments", package.id))
        })?),
    };

    let mut command = Command::new(primary_payload_path(ctx, package)?);
    if let Some(arguments) = arguments {
        command.args(split_arguments(&format_arguments(arguments, variables)));
    }
    run_translated(ctx, &mut command, |code| translate_exit_code(exit_codes, code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(code: Option<i32>, behavior: ExitCodeBehavior) -> ExitCodeRule {
        ExitCodeRule { code, behavior }
    }

    #[test]
    fn default_table_treats_zero_as_success() {
        assert_eq!(translate_exit_code(&[], 0), ExecuteOutcome::Success);
        assert_eq!(translate_exit_code(&[], 7), ExecuteOutcome::Error(7));
    }

    #[test]
    fn exact_rule_beats_wildcard() {
        let rules = vec![
            rule(None, ExitCodeBehavior::Success),
            rule(Some(5), ExitCodeBehavior::Error),
            rule(Some(3010), ExitCodeBehavior::RebootRequired),
            rule(Some(99), ExitCodeBehavior::RebootForced),
        ];
        assert_eq!(translate_exit_code(&rules, 5), ExecuteOutcome::Error(5));
        assert_eq!(translate_exit_code(&rules, 42), ExecuteOutcome::Success);
        assert_eq!(
            translate_exit_code(&rules, 3010),
            ExecuteOutcome::RebootRequired
        );
        assert_eq!(translate_exit_code(&rules, 99), ExecuteOutcome::RebootForced);
    }

    #[test]
    fn zero_can_be_declared_an_error() {
        let rules = vec![rule(Some(0), ExitCodeBehavior::Error)];
        assert_eq!(translate_exit_code(&rules, 0), ExecuteOutcome::Error(0));
    }
}
