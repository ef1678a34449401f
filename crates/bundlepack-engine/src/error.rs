use thiserror::Error;

pub const RESULT_SUCCESS: u32 = 0;
pub const RESULT_FATAL: u32 = 1603;
pub const RESULT_USER_EXIT: u32 = 1602;
pub const RESULT_RESTART_REQUIRED: u32 = 3010;
pub const RESULT_RESTART_INITIATED: u32 = 1641;

/// Failure classes the engine distinguishes when deciding whether to retry,
/// roll back, or stop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation cancelled by user")]
    UserCancelled,
    #[error("failed to acquire '{artifact}': {reason}")]
    Acquire { artifact: String, reason: String },
    #[error("verification failed for '{artifact}': {reason}")]
    Verify { artifact: String, reason: String },
    #[error("package '{package}' failed with code {code}")]
    PackageFailed { package: String, code: i32 },
    #[error("elevated process terminated unexpectedly")]
    ElevationTerminated,
    #[error("elevated process could not be started: {0}")]
    ElevationUnavailable(String),
    #[error("elevation protocol error: {0}")]
    Protocol(String),
    #[error("elevated {operation} failed with result {code}")]
    Remote { operation: String, code: u32 },
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("user interface failed: {0}")]
    Ux(String),
}

impl EngineError {
    pub fn result_code(&self) -> u32 {
        match self {
            Self::UserCancelled => RESULT_USER_EXIT,
            Self::Acquire { .. } => 1612,
            Self::Verify { .. } => 1330,
            Self::PackageFailed { code, .. } => {
                if *code > 0 {
                    *code as u32
                } else {
                    RESULT_FATAL
                }
            }
            Self::ElevationTerminated => 1067,
            Self::ElevationUnavailable(_) => 740,
            Self::Protocol(_) => 13,
            Self::Remote { code, .. } => *code,
            Self::InvalidPlan(_) | Self::Ux(_) => RESULT_FATAL,
        }
    }

    /// Errors after which no further step of the run may be attempted.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::ElevationTerminated | Self::Protocol(_) | Self::InvalidPlan(_)
        )
    }
}

pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.downcast_ref::<EngineError>().or_else(|| {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<EngineError>())
    })
}

pub fn result_code_of(err: &anyhow::Error) -> u32 {
    engine_error(err)
        .map(EngineError::result_code)
        .unwrap_or(RESULT_FATAL)
}

pub fn is_user_cancel(err: &anyhow::Error) -> bool {
    matches!(engine_error(err), Some(EngineError::UserCancelled))
}

pub fn is_fatal_to_run(err: &anyhow::Error) -> bool {
    engine_error(err).is_some_and(EngineError::is_fatal_to_run)
}

/// Rebuilds a classified error from a result code that crossed the
/// elevation channel.
pub fn error_from_remote(operation: &str, code: u32) -> EngineError {
    match code {
        RESULT_USER_EXIT => EngineError::UserCancelled,
        1067 => EngineError::ElevationTerminated,
        _ => EngineError::Remote {
            operation: operation.to_string(),
            code,
        },
    }
}
