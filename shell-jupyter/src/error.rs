//! Kernel error types
//!
//! Every failure a message loop can hit is a `KernelError`. None of them is
//! fatal to the process: the loop logs the error and moves on to the next
//! message.

use crate::transport::Channel;

/// Errors raised while decoding, handling or sending kernel messages
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("Malformed message: {reason}")]
    Malformed { reason: String },

    #[error("Signature verification failed")]
    SignatureMismatch,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported signature scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Socket error: {0}")]
    Transport(#[from] zeromq::ZmqError),

    #[error("{0:?} channel is closed")]
    ChannelClosed(Channel),

    #[error("Evaluator error: {0}")]
    Evaluator(String),

    #[error("No message has been received yet, nowhere to send output")]
    NoRecipient,

    #[error("Comm target '{target}' failed: {reason}")]
    Callback { target: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        KernelError::Malformed {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
