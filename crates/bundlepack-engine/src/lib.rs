mod acquire;
mod apply;
mod cache;
mod condition;
mod config;
mod container;
mod context;
mod drivers;
mod elevation;
mod engine;
mod error;
mod fs_utils;
mod layout;
mod plan;
mod probe;
mod process;
mod progress;
mod registration;
mod ux;

pub use acquire::{
    acquire_artifact, artifact_matches, source_scheme, AcquireOutcome, AcquisitionTransport,
    Artifact, FileCopyTransport, HttpTransport, TransportRegistry,
};
pub use apply::{apply, ApplyContext, ApplySummary};
pub use cache::{
    cache_payload, is_package_cached, layout_bundle, layout_payload, remove_package_cache,
    verify_payload, CacheWorker, SyncEvents,
};
pub use condition::{ConditionEvaluator, VariableConditions};
pub use config::EngineConfig;
pub use container::{
    attach_containers, write_container, AttachedContainer, BundleSection, ContainerReader,
    ContainerSource,
};
pub use context::EngineContext;
pub use drivers::{
    capabilities, detect, execute, execute_action, format_arguments, plan_actions,
    translate_exe_exit_code, translate_msi_exit_code, translate_msu_exit_code, Capabilities,
};
pub use elevation::{
    new_secret, read_message, run_elevated, write_message, CachePayloadRequest, ElevatedServer,
    ElevationClient, ElevationLauncher, ElevationSlot, LaunchRequest, Message, Opcode,
    ProcessLauncher, MAX_MESSAGE_BYTES,
};
pub use engine::{
    declared_variables, set_context_variables, Engine, EngineCommand, EngineHandle,
    EngineOptions, Phase, RunOutcome,
};
pub use error::{
    engine_error, error_from_remote, is_fatal_to_run, is_user_cancel, result_code_of,
    EngineError, RESULT_FATAL, RESULT_RESTART_INITIATED, RESULT_RESTART_REQUIRED,
    RESULT_SUCCESS, RESULT_USER_EXIT,
};
pub use layout::{default_machine_root, default_user_root, EngineLayout};
pub use plan::{
    build_plan, default_request, CacheAction, CleanAction, ExecuteAction, PackagePlan,
    PackageState, Plan, PlanInput, RollbackCacheAction,
};
pub use probe::{RegistryProbe, SystemProbe};
pub use process::{describe_command, split_arguments, ProcessOutput, ProcessRunner, SystemProcessRunner};
pub use progress::ApplyProgress;
pub use registration::{
    begin_session, end_session, execute_related_bundle, list_related, load_variables,
    read_record, read_records, read_resume_state, remove_resume_state, resume_session,
    save_variables, write_record, write_resume_state, RegistrationRecord, RelatedBundle,
    ResumeState,
};
pub use ux::{
    check_reply, BootstrapperApplication, ErrorEvent, ErrorKind, ErrorReply, ResolveSourceReply,
    RestartState, SilentApplication, UxReply,
};

#[cfg(test)]
mod tests;
