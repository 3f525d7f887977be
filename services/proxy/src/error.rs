//! Error taxonomy for the proxy and its mapping onto WebSocket close codes.

use livewire_core::{auth::AuthError, weather::WeatherError};

/// Close code sent when credentials could not be obtained in time.
pub const CLOSE_AUTH_TIMEOUT: u16 = 1008;
/// Close code for any other unhandled session failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_NORMAL: u16 = 1000;

/// Close reasons must fit in a control frame alongside the code.
const MAX_CLOSE_REASON_BYTES: usize = 123;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Auth timeout")]
    AuthTimeout,
    #[error("Failed to connect upstream: {0}")]
    UpstreamConnect(String),
    #[error("Failed to send setup message: {0}")]
    SetupSend(String),
    #[error("Could not parse message: {0}")]
    Parse(String),
    #[error("Failed to send {kind} message ({direction}): {reason}")]
    Send {
        direction: &'static str,
        kind: &'static str,
        reason: String,
    },
    #[error("Transport error ({direction}): {reason}")]
    Transport {
        direction: &'static str,
        reason: String,
    },
    #[error("Upstream connection lost")]
    UpstreamLost,
    #[error("Client keep-alive timed out")]
    KeepAliveTimeout,
    #[error("Tool lookup failed: {0}")]
    ToolLookup(#[from] WeatherError),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// The close code a client socket receives when its session ends with this error.
    pub fn close_code(&self) -> u16 {
        match self {
            ProxyError::Auth(_) | ProxyError::AuthTimeout => CLOSE_AUTH_TIMEOUT,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }

    /// The close reason, truncated to the protocol limit on a char boundary.
    pub fn close_reason(&self) -> String {
        truncate_reason(&self.to_string())
    }

    /// Per-message errors that skip one message without ending the loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProxyError::Parse(_) | ProxyError::ToolLookup(_))
    }
}

pub(crate) fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
