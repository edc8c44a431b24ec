use crate::types::{Capability, SessionHandle};
use std::time::Duration;
use thiserror::Error;

/// How a device rejected an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The operation or service is not implemented on the device.
    NotSupported,
    /// The target lies past a mechanical limit. The command itself works.
    InvalidPosition,
    /// Any other rejection (bad token, busy, auth on this operation...).
    Rejected,
}

/// Outcome of a failed transport call.
///
/// Transient variants are retried; a [`TransportError::Fault`] is the
/// device's own answer and never is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("device fault ({kind:?}): {reason}")]
    Fault { kind: FaultKind, reason: String },
}

impl TransportError {
    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::Fault {
            kind: FaultKind::NotSupported,
            reason: reason.into(),
        }
    }

    pub fn invalid_position(reason: impl Into<String>) -> Self {
        Self::Fault {
            kind: FaultKind::InvalidPosition,
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Fault {
            kind: FaultKind::Rejected,
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Fault { .. })
    }

    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Self::Fault { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Structured error kinds surfaced to the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PtzError {
    #[error("device unreachable: {0}")]
    DeviceUnreachable(TransportError),

    #[error("device exposes no profile with a video source")]
    NoUsableProfile,

    #[error("{0} is not supported by this device")]
    UnsupportedCapability(Capability),

    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter {
        field: &'static str,
        reason: &'static str,
    },

    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    #[error("{capability} command failed after {attempts} attempt(s)")]
    CommandFailed {
        capability: Capability,
        attempts: u32,
    },

    #[error("unknown session: {0}")]
    UnknownSession(SessionHandle),

    #[error("session has been disposed")]
    SessionClosed,
}

impl PtzError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::InvalidParameter { field, reason }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PtzError::DeviceUnreachable(_) => "device_unreachable",
            PtzError::NoUsableProfile => "no_usable_profile",
            PtzError::UnsupportedCapability(_) => "unsupported",
            PtzError::InvalidParameter { .. } => "invalid_parameter",
            PtzError::UnknownPreset(_) => "unknown_preset",
            PtzError::CommandFailed { .. } => "command_failed",
            PtzError::UnknownSession(_) => "unknown_session",
            PtzError::SessionClosed => "session_closed",
        }
    }
}
