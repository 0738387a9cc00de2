//! Error types for the classroom session layer
//!
//! Each component owns a narrow error enum (`MediaError`, `TransportError`,
//! `RelayError`, `AccessError`, `ScreenShareError`). [`ClassroomError`] is the
//! crate-level error returned by [`crate::ClassroomSession`] and carries an
//! [`ErrorKind`] so the UI can react to the category without matching on text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::AccessError;
use crate::media::screen_share::ScreenShareError;
use crate::media::MediaError;
use crate::peer::TransportError;
use crate::relay::RelayError;

/// Result alias used throughout the crate
pub type ClassroomResult<T> = Result<T, ClassroomError>;

/// Category of a surfaced error
///
/// Only [`ErrorKind::Negotiation`] and [`ErrorKind::Transport`] feed the
/// recovery controller. Device problems ask the user to pick another device
/// and screen-share problems never touch the primary link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Authorization,
    Negotiation,
    Transport,
    Device,
    ScreenShare,
    Signaling,
    Configuration,
    Internal,
}

impl ErrorKind {
    /// Whether a re-negotiation could plausibly fix this kind of failure
    pub fn triggers_recovery(&self) -> bool {
        matches!(self, ErrorKind::Negotiation | ErrorKind::Transport)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Authorization => "authorization",
            ErrorKind::Negotiation => "negotiation",
            ErrorKind::Transport => "transport",
            ErrorKind::Device => "device",
            ErrorKind::ScreenShare => "screen-share",
            ErrorKind::Signaling => "signaling",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Crate-level error
#[derive(Error, Debug)]
pub enum ClassroomError {
    #[error("Access denied: {reason}")]
    AccessDenied { reason: String },

    #[error("Negotiation failed: {reason}")]
    Negotiation { reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device error: {0}")]
    Device(#[from] MediaError),

    #[error("Screen share error: {0}")]
    ScreenShare(#[from] ScreenShareError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] RelayError),

    #[error("Access check error: {0}")]
    AccessCheck(#[from] AccessError),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Session already closed")]
    SessionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClassroomError {
    pub fn negotiation(reason: impl Into<String>) -> Self {
        ClassroomError::Negotiation { reason: reason.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ClassroomError::Internal(message.into())
    }

    /// Category used when this error is surfaced as an event
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClassroomError::AccessDenied { .. } | ClassroomError::AccessCheck(_) => {
                ErrorKind::Authorization
            }
            ClassroomError::Negotiation { .. } => ErrorKind::Negotiation,
            ClassroomError::Transport(_) => ErrorKind::Transport,
            ClassroomError::Device(_) => ErrorKind::Device,
            ClassroomError::ScreenShare(_) => ErrorKind::ScreenShare,
            ClassroomError::Signaling(_) => ErrorKind::Signaling,
            ClassroomError::InvalidConfiguration { .. } => ErrorKind::Configuration,
            ClassroomError::SessionClosed | ClassroomError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if retrying the same operation might succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClassroomError::Negotiation { .. } => true,
            ClassroomError::Transport(e) => !matches!(e, TransportError::Closed),
            ClassroomError::Signaling(_) => true,
            ClassroomError::AccessCheck(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<config::ConfigError> for ClassroomError {
    fn from(err: config::ConfigError) -> Self {
        ClassroomError::InvalidConfiguration {
            field: "config".to_string(),
            reason: err.to_string(),
        }
    }
}
