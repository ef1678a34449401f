use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use bundlepack_core::{ActionState, LaunchAction, ResumeMode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::registration::RelatedBundle;

pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Frame header: opcode then payload length, both little-endian `u32`.
const HEADER_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Handshake,
    SessionBegin,
    SessionResume,
    SessionEnd,
    SaveState,
    CachePayload,
    CleanPackage,
    ExecutePackage,
    ExecuteRelatedBundle,
    Log,
    Complete,
    Terminate,
}

impl Opcode {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Handshake => 1,
            Self::SessionBegin => 2,
            Self::SessionResume => 3,
            Self::SessionEnd => 4,
            Self::SaveState => 5,
            Self::CachePayload => 6,
            Self::CleanPackage => 7,
            Self::ExecutePackage => 8,
            Self::ExecuteRelatedBundle => 9,
            Self::Log => 10,
            Self::Complete => 11,
            Self::Terminate => 12,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Handshake,
            2 => Self::SessionBegin,
            3 => Self::SessionResume,
            4 => Self::SessionEnd,
            5 => Self::SaveState,
            6 => Self::CachePayload,
            7 => Self::CleanPackage,
            8 => Self::ExecutePackage,
            9 => Self::ExecuteRelatedBundle,
            10 => Self::Log,
            11 => Self::Complete,
            12 => Self::Terminate,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::SessionBegin => "session-begin",
            Self::SessionResume => "session-resume",
            Self::SessionEnd => "session-end",
            Self::SaveState => "save-state",
            Self::CachePayload => "cache-payload",
            Self::CleanPackage => "clean-package",
            Self::ExecutePackage => "execute-package",
            Self::ExecuteRelatedBundle => "execute-related-bundle",
            Self::Log => "log",
            Self::Complete => "complete",
            Self::Terminate => "terminate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

pub fn write_message<W: Write>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(EngineError::Protocol(format!(
            "{} message of {} bytes exceeds limit",
            opcode.as_str(),
            payload.len()
        ))
        .into());
    }
    let mut frame = Vec::with_capacity(HEADER_BYTES + payload.len());
    frame.extend_from_slice(&opcode.as_u32().to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);

    match writer.write_all(&frame).and_then(|()| writer.flush()) {
        Ok(()) => Ok(()),
        Err(err) if is_disconnect(&err) => Err(EngineError::ElevationTerminated.into()),
        Err(err) => Err(err)
            .with_context(|| format!("failed to send {} message", opcode.as_str())),
    }
}

/// Reads one frame. A closed peer surfaces as
/// [`EngineError::ElevationTerminated`].
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut header = [0_u8; HEADER_BYTES];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if is_disconnect(&err) => return Err(EngineError::ElevationTerminated.into()),
        Err(err) => return Err(err).context("failed to read message header"),
    }

    let raw_opcode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let opcode = Opcode::from_u32(raw_opcode)
        .ok_or_else(|| EngineError::Protocol(format!("unknown opcode {raw_opcode}")))?;
    if length > MAX_MESSAGE_BYTES {
        return Err(EngineError::Protocol(format!(
            "{} message of {length} bytes exceeds limit",
            opcode.as_str()
        ))
        .into());
    }

    let mut payload = vec![0_u8; length];
    match reader.read_exact(&mut payload) {
        Ok(()) => Ok(Message { opcode, payload }),
        Err(err) if is_disconnect(&err) => Err(EngineError::ElevationTerminated.into()),
        Err(err) => Err(err)
            .with_context(|| format!("failed to read {} payload", opcode.as_str())),
    }
}

pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(body).context("failed to encode message body")
}

pub fn decode_body<T: DeserializeOwned>(opcode: Opcode, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|err| {
        EngineError::Protocol(format!("malformed {} body: {err}", opcode.as_str())).into()
    })
}

/// `Complete` payload: the result code followed by operation data.
pub fn complete_payload(result: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + data.len());
    payload.extend_from_slice(&result.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

pub fn split_complete(payload: &[u8]) -> Result<(u32, &[u8])> {
    if payload.len() < 4 {
        return Err(EngineError::Protocol("complete message without result".to_string()).into());
    }
    let (code, data) = payload.split_at(4);
    Ok((u32::from_le_bytes([code[0], code[1], code[2], code[3]]), data))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeBody {
    pub secret: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBeginBody {
    pub action: LaunchAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResumeBody {
    pub mode: ResumeMode,
    pub action: LaunchAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEndBody {
    pub keep: bool,
}

/// Persisted variable stream, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBody {
    pub variables: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePayloadRequest {
    pub package: String,
    pub payload: String,
    pub source: PathBuf,
    pub move_file: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanPackageBody {
    pub package: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutePackageBody {
    pub package: String,
    pub action: ActionState,
    pub rollback: bool,
    pub variables: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRelatedBody {
    pub related: RelatedBundle,
    pub action: ActionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBody {
    pub level: String,
    pub message: String,
}
