use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("request was not authorized")]
    Unauthorized,
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Unexpected(String),
    #[error("session changed while the request was in flight")]
    Superseded,
    #[error("schedule store error: {0}")]
    Store(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Failures worth retrying on the next watchdog tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Network(_) | SessionError::Timeout | SessionError::Server { .. }
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SessionError::Unauthorized)
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            SessionError::Timeout
        } else if value.is_decode() {
            SessionError::Unexpected(value.to_string())
        } else {
            SessionError::Network(value.to_string())
        }
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(value: toml::de::Error) -> Self {
        SessionError::Store(value.to_string())
    }
}

impl From<toml::ser::Error> for SessionError {
    fn from(value: toml::ser::Error) -> Self {
        SessionError::Store(value.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(value: serde_json::Error) -> Self {
        SessionError::Unexpected(value.to_string())
    }
}
