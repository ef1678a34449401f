mod manifest;
mod package_kind;
mod state;
mod variables;

pub use manifest::{
    BundleInfo, BundleManifest, Container, ExitCodeBehavior, ExitCodeRule, Package,
    PackageDetails, Payload, RollbackBoundary, VariableDecl,
};
pub use package_kind::PackageKind;
pub use state::{
    ActionState, CurrentState, DisplayMode, ExecuteOutcome, LaunchAction, RequestState,
    RestartPolicy, ResumeMode,
};
pub use variables::{Variable, VariableValue, Variables, PERSISTED_VARIABLES_VERSION};

#[cfg(test)]
mod tests;
