use std::io::ErrorKind as IoErrorKind;
use std::net::{TcpListener, TcpStream};
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bundlepack_core::{ActionState, ExecuteOutcome, LaunchAction, ResumeMode, Variables};
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::protocol::{
    complete_payload, decode_body, encode_body, read_message, split_complete, write_message,
    CachePayloadRequest, CleanPackageBody, ExecutePackageBody, ExecuteRelatedBody,
    HandshakeBody, LogBody, Opcode, SessionBeginBody, SessionEndBody, SessionResumeBody,
    StateBody,
};
use super::LaunchRequest;
use crate::context::EngineContext;
use crate::error::{error_from_remote, EngineError, RESULT_FATAL, RESULT_SUCCESS};
use crate::registration::RelatedBundle;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

pub fn new_secret() -> String {
    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The non-elevated end of the channel. Each call sends one request and
/// blocks until its `Complete` arrives; log lines forwarded by the peer
/// while it works are re-emitted locally.
#[derive(Debug)]
pub struct ElevationClient {
    stream: TcpStream,
    child: Option<Child>,
}

impl ElevationClient {
    /// Listens on loopback, asks the launcher to start the peer, and accepts
    /// it only if it presents the secret handed to it at launch.
    pub fn spawn(ctx: &EngineContext) -> Result<Self> {
        let listener =
            TcpListener::bind(("127.0.0.1", 0)).context("failed to bind elevation listener")?;
        listener
            .set_nonblocking(true)
            .context("failed to configure elevation listener")?;
        let address = listener
            .local_addr()
            .context("failed to read elevation listener address")?;
        let secret = new_secret();
        let request = LaunchRequest {
            address,
            secret: secret.clone(),
            parent_pid: std::process::id(),
        };

        info!(address = %address, "launching elevated peer");
        let mut child = ctx.launcher.launch(&request)?;
        let timeout = Duration::from_secs(ctx.config.elevation_timeout_secs);
        let stream = match accept_peer(&listener, child.as_mut(), timeout) {
            Ok(stream) => stream,
            Err(err) => {
                reap(child);
                return Err(err);
            }
        };

        let mut client = Self { stream, child };
        if let Err(err) = client.verify_handshake(&secret) {
            reap(client.child.take());
            return Err(err);
        }
        info!("elevated peer connected");
        Ok(client)
    }

    fn verify_handshake(&mut self, secret: &str) -> Result<()> {
        let message = read_message(&mut self.stream)?;
        if message.opcode != Opcode::Handshake {
            return Err(EngineError::Protocol(format!(
                "expected handshake, received {}",
                message.opcode.as_str()
            ))
            .into());
        }
        let body: HandshakeBody = decode_body(message.opcode, &message.payload)?;
        if body.secret != secret {
            let _ = write_message(
                &mut self.stream,
                Opcode::Complete,
                &complete_payload(RESULT_FATAL, &[]),
            );
            return Err(EngineError::Protocol("elevated peer presented a wrong secret".to_string()).into());
        }
        debug!(peer_pid = body.pid, "elevated peer handshake verified");
        write_message(
            &mut self.stream,
            Opcode::Complete,
            &complete_payload(RESULT_SUCCESS, &[]),
        )
    }

    fn request(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
        write_message(&mut self.stream, opcode, payload)?;
        loop {
            let message = read_message(&mut self.stream)?;
            match message.opcode {
                Opcode::Log => {
                    let body: LogBody = decode_body(message.opcode, &message.payload)?;
                    emit_remote_log(&body);
                }
                Opcode::Complete => {
                    let (code, data) = split_complete(&message.payload)?;
                    if code != RESULT_SUCCESS {
                        return Err(error_from_remote(opcode.as_str(), code).into());
                    }
                    return Ok(data.to_vec());
                }
                other => {
                    return Err(EngineError::Protocol(format!(
                        "unexpected {} while waiting for {} result",
                        other.as_str(),
                        opcode.as_str()
                    ))
                    .into())
                }
            }
        }
    }

    fn request_body<T: Serialize>(&mut self, opcode: Opcode, body: &T) -> Result<Vec<u8>> {
        let payload = encode_body(body)?;
        self.request(opcode, &payload)
    }

    pub fn session_begin(&mut self, action: LaunchAction) -> Result<()> {
        self.request_body(Opcode::SessionBegin, &SessionBeginBody { action })
            .map(|_| ())
    }

    pub fn session_resume(&mut self, mode: ResumeMode, action: LaunchAction) -> Result<()> {
        self.request_body(Opcode::SessionResume, &SessionResumeBody { mode, action })
            .map(|_| ())
    }

    pub fn session_end(&mut self, keep: bool) -> Result<()> {
        self.request_body(Opcode::SessionEnd, &SessionEndBody { keep })
            .map(|_| ())
    }

    pub fn save_state(&mut self, variables: &[u8]) -> Result<()> {
        let body = StateBody {
            variables: Some(hex::encode(variables)),
        };
        self.request_body(Opcode::SaveState, &body).map(|_| ())
    }

    pub fn cache_payload(&mut self, request: &CachePayloadRequest) -> Result<()> {
        self.request_body(Opcode::CachePayload, request).map(|_| ())
    }

    pub fn clean_package(&mut self, package: &str) -> Result<()> {
        let body = CleanPackageBody {
            package: package.to_string(),
        };
        self.request_body(Opcode::CleanPackage, &body).map(|_| ())
    }

    pub fn execute_package(
        &mut self,
        package: &str,
        action: ActionState,
        rollback: bool,
        variables: &Variables,
    ) -> Result<ExecuteOutcome> {
        let body = ExecutePackageBody {
            package: package.to_string(),
            action,
            rollback,
            variables: hex::encode(variables.serialize_persisted()),
        };
        let data = self.request_body(Opcode::ExecutePackage, &body)?;
        decode_body(Opcode::ExecutePackage, &data)
    }

    pub fn execute_related(
        &mut self,
        related: &RelatedBundle,
        action: ActionState,
    ) -> Result<ExecuteOutcome> {
        let body = ExecuteRelatedBody {
            related: related.clone(),
            action,
        };
        let data = self.request_body(Opcode::ExecuteRelatedBundle, &body)?;
        decode_body(Opcode::ExecuteRelatedBundle, &data)
    }

    /// Asks the peer to exit and reaps it.
    pub fn terminate(mut self) -> Result<()> {
        let result = self.request(Opcode::Terminate, &[]).map(|_| ());
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => debug!(%status, "elevated peer exited"),
                Err(err) => warn!(error = %err, "failed to wait for elevated peer"),
            }
        }
        result
    }
}

fn accept_peer(
    listener: &TcpListener,
    mut child: Option<&mut Child>,
    timeout: Duration,
) -> Result<TcpStream> {
    let started = Instant::now();
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream
                    .set_nonblocking(false)
                    .context("failed to configure elevation stream")?;
                debug!(peer = %peer, "elevated peer connected to listener");
                return Ok(stream);
            }
            Err(err) if err.kind() == IoErrorKind::WouldBlock => {
                if let Some(child) = child.as_deref_mut() {
                    if let Some(status) = child
                        .try_wait()
                        .context("failed to poll elevated peer")?
                    {
                        return Err(EngineError::ElevationUnavailable(format!(
                            "elevated peer exited before connecting ({status})"
                        ))
                        .into());
                    }
                }
                if started.elapsed() >= timeout {
                    return Err(EngineError::ElevationUnavailable(
                        "timed out waiting for elevated peer".to_string(),
                    )
                    .into());
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => return Err(err).context("failed to accept elevated peer"),
        }
    }
}

/// Kills a peer that never became usable and waits for it to exit.
fn reap(child: Option<Child>) {
    let Some(mut child) = child else {
        return;
    };
    if let Err(err) = child.kill() {
        debug!(error = %err, "elevated peer already exited");
    }
    match child.wait() {
        Ok(status) => debug!(%status, "reaped elevated peer"),
        Err(err) => warn!(error = %err, "failed to wait for elevated peer"),
    }
}

fn emit_remote_log(body: &LogBody) {
    match body.level.as_str() {
        "error" => error!(target: "bundlepack::elevated", "{}", body.message),
        "warn" => warn!(target: "bundlepack::elevated", "{}", body.message),
        "debug" => debug!(target: "bundlepack::elevated", "{}", body.message),
        _ => info!(target: "bundlepack::elevated", "{}", body.message),
    }
}
