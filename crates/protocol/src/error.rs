//! Error taxonomy shared by the sandbox, engines and scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::redact::redact_secrets;

/// Classification of every failure a task can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthFailed,
    HostkeyUnknown,
    HostkeyChanged,
    PermissionDenied,
    PathNotFound,
    NetworkTimeout,
    RemoteDisconnect,
    ValidationFailed,
    UnknownError,
}

impl ErrorKind {
    /// Wire name of the kind, e.g. `NETWORK_TIMEOUT`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::HostkeyUnknown => "HOSTKEY_UNKNOWN",
            Self::HostkeyChanged => "HOSTKEY_CHANGED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::PathNotFound => "PATH_NOT_FOUND",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::RemoteDisconnect => "REMOTE_DISCONNECT",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Returns `true` for connection-level failures that may clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkTimeout | Self::RemoteDisconnect)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure with a user-facing message.
///
/// The message is passed through [`redact_secrets`] on construction, so a
/// `FerryError` can be logged or shown without leaking credentials.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FerryError {
    kind: ErrorKind,
    message: String,
}

impl FerryError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: redact_secrets(&message.into()),
        }
    }

    /// Shorthand for a `VALIDATION_FAILED` error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailed, message)
    }

    /// Shorthand for an `UNKNOWN_ERROR`.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prefixes the message with context, keeping the kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: redact_secrets(&format!("{context}: {}", self.message)),
        }
    }
}

impl From<std::io::Error> for FerryError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let kind = match err.kind() {
            Io::NotFound => ErrorKind::PathNotFound,
            Io::PermissionDenied | Io::ReadOnlyFilesystem => ErrorKind::PermissionDenied,
            Io::TimedOut => ErrorKind::NetworkTimeout,
            Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::ConnectionRefused
            | Io::BrokenPipe
            | Io::NotConnected
            | Io::UnexpectedEof => ErrorKind::RemoteDisconnect,
            _ => ErrorKind::UnknownError,
        };
        Self::new(kind, err.to_string())
    }
}
