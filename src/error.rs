use std::sync::Arc;
use std::time::Duration;

use crate::protocol::FrameError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Driver errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Socket failure, frame error or protocol violation. Fatal to the
    /// transport; every session on it fails with this.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Server-signalled statement error. Not fatal to the session unless
    /// the server flags it so.
    #[error("server error {code} ({sql_state}): {message}")]
    Server {
        code: u32,
        sql_state: String,
        message: String,
        fatal: bool,
    },

    #[error("session killed")]
    SessionKilled,

    #[error("no session available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("network timeout after {0:?}")]
    Timeout(Duration),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("handle closed")]
    Closed,

    #[error("handle not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Error::Transport(e.to_string())
    }

    /// True when the session that produced this error must not be reused.
    pub fn poisons_session(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Frame(_) | Error::SessionKilled => true,
            Error::Server { fatal, .. } => *fatal,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Shared form stored as a session's last exception.
pub type SharedError = Arc<Error>;
