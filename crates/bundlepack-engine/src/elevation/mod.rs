//! The two-process channel through which a non-elevated engine delegates
//! machine-scope work to an elevated copy of itself.

mod client;
mod protocol;
mod server;

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use bundlepack_core::{ActionState, ExecuteOutcome, LaunchAction, ResumeMode, Variables};
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::process::{describe_command, split_arguments};
use crate::registration::RelatedBundle;

pub use client::{new_secret, ElevationClient};
pub use protocol::{
    read_message, write_message, CachePayloadRequest, Message, Opcode, MAX_MESSAGE_BYTES,
};
pub use server::{run_elevated, ElevatedServer};

/// Where the elevated peer must connect and the secret it must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub address: SocketAddr,
    pub secret: String,
    pub parent_pid: u32,
}

/// Starts the elevated peer. Returns the child when there is a process to
/// supervise.
pub trait ElevationLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<Option<Child>>;
}

/// Relaunches this engine with `--elevated`, optionally through a privilege
/// broker such as `sudo` or `pkexec`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    engine_path: PathBuf,
    manifest_path: PathBuf,
    elevation_command: Option<String>,
    extra_args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(
        engine_path: PathBuf,
        manifest_path: PathBuf,
        elevation_command: Option<String>,
    ) -> Self {
        Self {
            engine_path,
            manifest_path,
            elevation_command,
            extra_args: Vec::new(),
        }
    }

    /// Arguments appended after the elevation switch, e.g. `--config`.
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn command(&self, request: &LaunchRequest) -> Command {
        let broker = self
            .elevation_command
            .as_deref()
            .map(split_arguments)
            .unwrap_or_default();
        let mut command = match broker.split_first() {
            Some((program, args)) => {
                let mut command = Command::new(program);
                command.args(args).arg(&self.engine_path);
                command
            }
            None => Command::new(&self.engine_path),
        };
        command
            .arg(&self.manifest_path)
            .arg("--elevated")
            .arg(request.address.to_string())
            .arg(&request.secret)
            .arg(request.parent_pid.to_string())
            .args(&self.extra_args)
            .stdin(Stdio::null());
        command
    }
}

impl ElevationLauncher for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<Option<Child>> {
        let mut command = self.command(request);
        let description = describe_command(&command).replace(&request.secret, "<secret>");
        info!(command = %description, "starting elevated peer");
        let child = command.spawn().map_err(|err| {
            EngineError::ElevationUnavailable(format!("failed to start {description}: {err}"))
        })?;
        Ok(Some(child))
    }
}

enum SlotState {
    Idle,
    Connected(ElevationClient),
    Lost,
}

/// Lazily started, shared handle on the elevated peer. The peer is launched
/// on first use and reused for the rest of the run; the lock keeps one
/// request in flight even when the cache and execute threads both need it.
pub struct ElevationSlot {
    ctx: EngineContext,
    state: Mutex<SlotState>,
}

impl ElevationSlot {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(SlotState::Idle),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SlotState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("elevation state poisoned"))
    }

    pub fn is_connected(&self) -> bool {
        self.lock()
            .map(|state| matches!(*state, SlotState::Connected(_)))
            .unwrap_or(false)
    }

    /// Starts the peer now if it is not running yet.
    pub fn ensure_started(&self) -> Result<()> {
        self.with_client(|_| Ok(()))
    }

    fn with_client<T>(&self, operation: impl FnOnce(&mut ElevationClient) -> Result<T>) -> Result<T> {
        let mut state = self.lock()?;
        if matches!(*state, SlotState::Idle) {
            *state = SlotState::Connected(ElevationClient::spawn(&self.ctx)?);
        }
        let client = match &mut *state {
            SlotState::Connected(client) => client,
            SlotState::Idle | SlotState::Lost => {
                return Err(EngineError::ElevationTerminated.into());
            }
        };

        let result = operation(client);
        if let Err(err) = &result {
            if crate::error::is_fatal_to_run(err) {
                warn!(error = %format!("{err:#}"), "elevation channel lost");
                *state = SlotState::Lost;
            }
        }
        result
    }

    pub fn session_begin(&self, action: LaunchAction) -> Result<()> {
        self.with_client(|client| client.session_begin(action))
    }

    pub fn session_resume(&self, mode: ResumeMode, action: LaunchAction) -> Result<()> {
        self.with_client(|client| client.session_resume(mode, action))
    }

    pub fn session_end(&self, keep: bool) -> Result<()> {
        self.with_client(|client| client.session_end(keep))
    }

    pub fn save_state(&self, variables: &[u8]) -> Result<()> {
        self.with_client(|client| client.save_state(variables))
    }

    pub fn cache_payload(&self, request: &CachePayloadRequest) -> Result<()> {
        self.with_client(|client| client.cache_payload(request))
    }

    pub fn clean_package(&self, package: &str) -> Result<()> {
        self.with_client(|client| client.clean_package(package))
    }

    pub fn execute_package(
        &self,
        package: &str,
        action: ActionState,
        rollback: bool,
        variables: &Variables,
    ) -> Result<ExecuteOutcome> {
        self.with_client(|client| client.execute_package(package, action, rollback, variables))
    }

    pub fn execute_related(
        &self,
        related: &RelatedBundle,
        action: ActionState,
    ) -> Result<ExecuteOutcome> {
        self.with_client(|client| client.execute_related(related, action))
    }

    /// Tells a running peer to exit. Safe to call when none was started;
    /// the slot refuses further requests afterwards.
    pub fn shutdown(&self) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if let SlotState::Connected(client) = std::mem::replace(&mut *state, SlotState::Lost) {
            if let Err(err) = client.terminate() {
                warn!(error = %format!("{err:#}"), "elevated peer did not terminate cleanly");
            }
        }
    }
}

impl Drop for ElevationSlot {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LaunchRequest {
        LaunchRequest {
            address: "127.0.0.1:4100".parse().expect("address"),
            secret: "s3cr3t".to_string(),
            parent_pid: 42,
        }
    }

    fn args(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn direct_launch_runs_the_engine_itself() {
        let launcher = ProcessLauncher::new(
            PathBuf::from("/opt/bundle/engine"),
            PathBuf::from("/opt/bundle/bundle.toml"),
            None,
        )
        .with_args(["--config", "/etc/bundle.toml"]);
        let command = launcher.command(&request());
        assert_eq!(command.get_program(), "/opt/bundle/engine");
        assert_eq!(
            args(&command),
            vec![
                "/opt/bundle/bundle.toml",
                "--elevated",
                "127.0.0.1:4100",
                "s3cr3t",
                "42",
                "--config",
                "/etc/bundle.toml"
            ]
        );
    }

    #[test]
    fn broker_wraps_the_engine_invocation() {
        let launcher = ProcessLauncher::new(
            PathBuf::from("/opt/bundle/engine"),
            PathBuf::from("/opt/bundle/bundle.toml"),
            Some("sudo -n".to_string()),
        );
        let command = launcher.command(&request());
        assert_eq!(command.get_program(), "sudo");
        let args = args(&command);
        assert_eq!(&args[..3], ["-n", "/opt/bundle/engine", "/opt/bundle/bundle.toml"]);
    }
}
