use std::fmt;
use std::time::Duration;

/// Errors that can occur during Twitch operations
#[derive(Debug, Clone, PartialEq)]
pub enum TwitchError {
    /// A required configuration value or credential seed is absent
    ConfigMissing(String),

    /// The request never produced an HTTP response (DNS, TLS, connection reset)
    NetworkFailure(String),

    /// Helix answered, but no user matched the login
    UserNotFound(String),

    /// Non-2xx response with 401 or 403
    Unauthorized { status: u16, body: String },

    /// Any other non-2xx response
    HttpStatus { status: u16, body: String },

    /// Response or frame body could not be deserialized
    MalformedPayload(String),

    /// Unexpected EventSub frame while a session transition was pending
    ProtocolViolation(String),

    /// No EventSub frame arrived inside the tolerated keepalive window
    KeepaliveTimeout(Duration),

    /// WebSocket transport error
    WebSocketError(String),

    /// Channel send error
    ChannelError(String),
}

impl TwitchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TwitchError::Unauthorized { .. })
    }
}

impl fmt::Display for TwitchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TwitchError::ConfigMissing(msg) => write!(f, "Configuration missing: {}", msg),
            TwitchError::NetworkFailure(msg) => write!(f, "Network failure: {}", msg),
            TwitchError::UserNotFound(login) => write!(f, "User not found: {}", login),
            TwitchError::Unauthorized { status, body } => {
                write!(f, "Unauthorized: HTTP {} - {}", status, body)
            }
            TwitchError::HttpStatus { status, body } => write!(f, "HTTP {}: {}", status, body),
            TwitchError::MalformedPayload(msg) => write!(f, "Malformed payload: {}", msg),
            TwitchError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            TwitchError::KeepaliveTimeout(after) => {
                write!(f, "Keepalive timeout: no message for {:?}", after)
            }
            TwitchError::WebSocketError(msg) => write!(f, "WebSocket error: {}", msg),
            TwitchError::ChannelError(msg) => write!(f, "Channel error: {}", msg),
        }
    }
}

impl std::error::Error for TwitchError {}

impl From<serde_json::Error> for TwitchError {
    fn from(err: serde_json::Error) -> Self {
        TwitchError::MalformedPayload(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TwitchError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TwitchError::WebSocketError(err.to_string())
    }
}

impl From<reqwest::Error> for TwitchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TwitchError::MalformedPayload(err.to_string())
        } else {
            TwitchError::NetworkFailure(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, TwitchError>;
