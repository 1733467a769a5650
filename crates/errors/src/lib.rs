#![warn(mismatched_lifetime_syntaxes)]
#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Error types for the prm resource arbiter
//!
//! This crate provides fine-grained error types organized by domain.
//! All error types implement Clone so they can cross thread boundaries
//! and be reported more than once.

use std::borrow::Cow;

use thiserror::Error;

pub mod config;
pub mod resource;

// Re-export all error types at the root
pub use config::ConfigError;
pub use resource::ResourceError;

/// Generic error type for cross-crate boundaries
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for prm operations
pub type Result<T> = std::result::Result<T, Error>;

/// Minimal interface for rendering user-facing error information without
/// requiring heavyweight envelopes.
pub trait UserFacingError {
    /// Short message suitable for CLI output.
    fn user_message(&self) -> Cow<'_, str>;

    /// Optional remediation hint.
    fn user_hint(&self) -> Option<&'static str> {
        None
    }

    /// Whether retrying the same operation is likely to succeed.
    fn is_retryable(&self) -> bool {
        false
    }

    /// Stable error code for analytics / structured reporting.
    fn user_code(&self) -> Option<&'static str> {
        None
    }
}

impl UserFacingError for Error {
    fn user_message(&self) -> Cow<'_, str> {
        match self {
            Error::Resource(err) => err.user_message(),
            Error::Config(err) => err.user_message(),
            Error::Io { message, .. } => Cow::Owned(message.clone()),
        }
    }

    fn user_hint(&self) -> Option<&'static str> {
        match self {
            Error::Resource(err) => err.user_hint(),
            Error::Config(err) => err.user_hint(),
            Error::Io { .. } => None,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Error::Resource(err) => err.is_retryable(),
            Error::Config(err) => err.is_retryable(),
            Error::Io { .. } => true,
        }
    }

    fn user_code(&self) -> Option<&'static str> {
        match self {
            Error::Resource(err) => err.user_code(),
            Error::Config(err) => err.user_code(),
            Error::Io { .. } => Some("error.io"),
        }
    }
}
