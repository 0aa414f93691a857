//! Error types for the vless-manager-core crate

use crate::ClientRecord;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Client '{}' was created but reloading the data plane failed: {source}", .record.id)]
    Reload {
        record: Box<ClientRecord>,
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Process failure with whatever the process wrote appended for diagnosis
    pub fn process(msg: impl Into<String>, output: &str) -> Self {
        let mut message = msg.into();
        let output = output.trim();
        if !output.is_empty() {
            message.push_str("\n--- data plane output ---\n");
            message.push_str(output);
        }
        Error::Process(message)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
