//! Protocol types for kled hop-to-hop communication.
//!
//! Every hop in a workspace connection (client, host agent, container agent)
//! talks to the next one over a single stdio pipe. This crate defines:
//!
//! - the frame codec used to carry several logical channels over that pipe
//!   ([`frame`], [`mux`])
//! - length-prefixed JSON messages exchanged on the control channel
//! - the workspace payload handed from hop to hop ([`info`])
//! - credential exchange types ([`credentials`])

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod credentials;
pub mod frame;
pub mod info;
pub mod mux;

pub use credentials::{
    CredentialBundle, CredentialRequest, CredentialResponse, DockerCredentials, GitCredentials,
};
pub use frame::{Frame, FrameKind, MAX_FRAME_PAYLOAD};
pub use info::{
    BuildSpec, ContainerSpec, ForwardingFeatures, HookCommand, HookPhase, HookSpec, MountSpec,
    PlatformAccess, SessionMode, WorkspaceInfo, WorkspaceSource,
};
pub use mux::{
    bridge, relay, Channel, ChannelReader, ChannelWriter, MessageChannel, Mux, MuxError, Role,
    CONTROL_CHANNEL, INITIAL_WINDOW,
};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single control message (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Channel kinds announced in `Open` frames.
pub mod channels {
    /// Agent control channel (always channel 0).
    pub const CONTROL: &str = "control";
    /// An SSH session relayed to the container's SSH server.
    pub const SSH: &str = "ssh";
    /// A single credential request/response exchange.
    pub const CREDENTIALS: &str = "credentials";
}

/// Error codes carried in [`AgentResponse::Error`].
pub mod error_codes {
    pub const BOOTSTRAP_FAILED: &str = "BOOTSTRAP_FAILED";
    pub const HOOK_FAILED: &str = "HOOK_FAILED";
    pub const BUILD_FAILED: &str = "BUILD_FAILED";
    pub const PROVIDER_FAILED: &str = "PROVIDER_FAILED";
    pub const TRANSPORT: &str = "TRANSPORT";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

/// Errors produced while decoding frames or messages.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stream ended in the middle of a message")]
    Truncated,
}

/// Request sent upstream-to-downstream on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Liveness check.
    Ping,
    /// Report the agent's current state.
    Status,
    /// Ask the agent to close its session and exit.
    Shutdown,
}

/// Message sent downstream-to-upstream on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    /// Reply to [`AgentRequest::Ping`].
    Pong { version: u32 },

    /// Intermediate progress while the hop is bootstrapping.
    Progress { stage: String, message: String },

    /// The hop finished bootstrapping and accepts sessions.
    Ready {
        container_id: String,
        image: String,
        #[serde(default)]
        warnings: Vec<String>,
    },

    /// Generic success with optional payload.
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// The hop failed.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl AgentResponse {
    /// Build an error response with a code.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        AgentResponse::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    /// Build a progress response.
    pub fn progress(stage: impl Into<String>, message: impl Into<String>) -> Self {
        AgentResponse::Progress {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Encode a message with a 4-byte big-endian length header.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Try to decode one length-prefixed message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete message,
/// otherwise the message and the number of bytes consumed.
pub fn decode_message<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>, DecodeError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(DecodeError::PayloadTooLarge(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }

    let msg = serde_json::from_slice(&buf[4..4 + len])?;
    Ok(Some((msg, 4 + len)))
}
