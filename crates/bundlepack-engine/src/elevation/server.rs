use std::fmt::{self, Write as _};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bundlepack_core::Variables;
use tracing::field::{Field, Visit};
use tracing::{info, warn, Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};

use super::protocol::{
    complete_payload, decode_body, encode_body, read_message, split_complete, write_message,
    CachePayloadRequest, CleanPackageBody, ExecutePackageBody, ExecuteRelatedBody,
    HandshakeBody, LogBody, Message, Opcode, SessionBeginBody, SessionEndBody,
    SessionResumeBody, StateBody,
};
use crate::cache::{cache_payload, remove_package_cache};
use crate::context::EngineContext;
use crate::drivers;
use crate::engine::set_context_variables;
use crate::error::{engine_error, result_code_of, EngineError, RESULT_SUCCESS};
use crate::registration::{
    begin_session, end_session, execute_related_bundle, resume_session, save_variables,
};

/// Connects back to the parent at `address`, proves itself with `secret`,
/// then services requests until told to terminate or the parent goes away.
pub fn run_elevated(ctx: EngineContext, address: &str, secret: &str, parent_pid: u32) -> Result<()> {
    info!(address, parent_pid, "elevated peer starting");
    let stream = TcpStream::connect(address)
        .with_context(|| format!("failed to connect to parent at {address}"))?;
    let mut server = ElevatedServer::new(ctx.with_elevated(true), stream);
    server.handshake(secret)?;
    server.serve()
}

/// Services one request at a time over any byte stream; production uses a
/// loopback socket.
pub struct ElevatedServer<S> {
    ctx: EngineContext,
    stream: S,
}

impl<S: Read + Write> ElevatedServer<S> {
    pub fn new(ctx: EngineContext, stream: S) -> Self {
        Self { ctx, stream }
    }

    pub fn handshake(&mut self, secret: &str) -> Result<()> {
        let body = HandshakeBody {
            secret: secret.to_string(),
            pid: std::process::id(),
        };
        write_message(&mut self.stream, Opcode::Handshake, &encode_body(&body)?)?;
        let reply = read_message(&mut self.stream)?;
        if reply.opcode != Opcode::Complete {
            return Err(EngineError::Protocol(format!(
                "expected handshake result, received {}",
                reply.opcode.as_str()
            ))
            .into());
        }
        let (code, _) = split_complete(&reply.payload)?;
        if code != RESULT_SUCCESS {
            return Err(EngineError::Protocol("parent rejected handshake".to_string()).into());
        }
        Ok(())
    }

    pub fn serve(&mut self) -> Result<()> {
        loop {
            let message = match read_message(&mut self.stream) {
                Ok(message) => message,
                Err(err) if matches!(engine_error(&err), Some(EngineError::ElevationTerminated)) => {
                    info!("parent closed the elevation channel");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            match message.opcode {
                Opcode::Terminate => {
                    write_message(
                        &mut self.stream,
                        Opcode::Complete,
                        &complete_payload(RESULT_SUCCESS, &[]),
                    )?;
                    info!("elevated peer terminating");
                    return Ok(());
                }
                Opcode::Handshake | Opcode::Complete | Opcode::Log => {
                    return Err(EngineError::Protocol(format!(
                        "unexpected {} request",
                        message.opcode.as_str()
                    ))
                    .into());
                }
                _ => {}
            }

            let (result, lines) = capture_logs(|| self.dispatch(&message));
            for line in &lines {
                write_message(&mut self.stream, Opcode::Log, &encode_body(line)?)?;
            }
            let (code, data) = match result {
                Ok(data) => (RESULT_SUCCESS, data),
                Err(err) => {
                    let code = result_code_of(&err);
                    warn!(
                        operation = message.opcode.as_str(),
                        code,
                        error = %format!("{err:#}"),
                        "elevated request failed"
                    );
                    (code, Vec::new())
                }
            };
            write_message(
                &mut self.stream,
                Opcode::Complete,
                &complete_payload(code, &data),
            )?;
        }
    }

    fn dispatch(&self, message: &Message) -> Result<Vec<u8>> {
        let ctx = &self.ctx;
        let opcode = message.opcode;
        let payload = &message.payload;
        match opcode {
            Opcode::SessionBegin => {
                let body: SessionBeginBody = decode_body(opcode, payload)?;
                begin_session(ctx, body.action)?;
                Ok(Vec::new())
            }
            Opcode::SessionResume => {
                let body: SessionResumeBody = decode_body(opcode, payload)?;
                resume_session(ctx, body.mode, body.action)?;
                Ok(Vec::new())
            }
            Opcode::SessionEnd => {
                let body: SessionEndBody = decode_body(opcode, payload)?;
                end_session(ctx, body.keep)?;
                Ok(Vec::new())
            }
            Opcode::SaveState => {
                let body: StateBody = decode_body(opcode, payload)?;
                let bytes = decode_hex(body.variables.as_deref().unwrap_or_default())?;
                save_variables(ctx.registration_layout(), ctx.bundle_id(), &bytes)?;
                Ok(Vec::new())
            }
            Opcode::CachePayload => {
                let request: CachePayloadRequest = decode_body(opcode, payload)?;
                let package = ctx.package(&request.package)?;
                let payload = ctx.payload(&request.payload)?;
                cache_payload(ctx, package, payload, &request.source, request.move_file)?;
                Ok(Vec::new())
            }
            Opcode::CleanPackage => {
                let body: CleanPackageBody = decode_body(opcode, payload)?;
                remove_package_cache(ctx, ctx.package(&body.package)?)?;
                Ok(Vec::new())
            }
            Opcode::ExecutePackage => {
                let body: ExecutePackageBody = decode_body(opcode, payload)?;
                let mut variables = Variables::new();
                variables.deserialize_persisted(&decode_hex(&body.variables)?)?;
                set_context_variables(ctx, &mut variables);
                let package = ctx.package(&body.package)?;
                let outcome = drivers::execute(ctx, package, body.action, body.rollback, &variables)?;
                encode_body(&outcome)
            }
            Opcode::ExecuteRelatedBundle => {
                let body: ExecuteRelatedBody = decode_body(opcode, payload)?;
                let outcome = execute_related_bundle(ctx, &body.related, body.action)?;
                encode_body(&outcome)
            }
            Opcode::Handshake | Opcode::Complete | Opcode::Log | Opcode::Terminate => {
                Err(EngineError::Protocol(format!("{} is not a request", opcode.as_str())).into())
            }
        }
    }
}

/// Runs `operation` with a scoped subscriber that records this thread's
/// events at `info` and above for the parent, while still handing every
/// event to the process-wide subscriber.
fn capture_logs<T>(operation: impl FnOnce() -> T) -> (T, Vec<LogBody>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let layer = ForwardLayer {
        lines: Arc::clone(&lines),
        local: tracing::dispatcher::get_default(Dispatch::clone),
    };
    let subscriber = tracing_subscriber::registry().with(layer);
    let result = tracing::subscriber::with_default(subscriber, operation);
    let lines = lines
        .lock()
        .map(|mut lines| std::mem::take(&mut *lines))
        .unwrap_or_default();
    (result, lines)
}

struct ForwardLayer {
    lines: Arc<Mutex<Vec<LogBody>>>,
    local: Dispatch,
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        if self.local.enabled(event.metadata()) {
            self.local.event(event);
        }
        let level = *event.metadata().level();
        if level > Level::INFO {
            return;
        }
        let mut line = LineVisitor::default();
        event.record(&mut line);
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(LogBody {
                level: level.as_str().to_ascii_lowercase(),
                message: line.finish(),
            });
        }
    }
}

/// Renders an event as `message key=value ...`.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        format!("{}{}", self.message, self.fields)
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    hex::decode(value)
        .map_err(|err| EngineError::Protocol(format!("malformed hex body: {err}")).into())
}
