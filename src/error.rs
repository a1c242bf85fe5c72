//! Bridge error taxonomy
//!
//! Component errors (`CodecError`, `ConfigError`, `EngineError`) are folded into
//! `BridgeError` at the session layer. `BridgeError::status` gives the stable code
//! reported across the C boundary.

use std::fmt;

use thiserror::Error;

use crate::codec::CodecError;

/// Which kind of object a handle was supposed to name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Session,
    Response,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Session => f.write_str("session"),
            HandleKind::Response => f.write_str("response"),
        }
    }
}

/// Why a handle was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleFault {
    /// The reserved zero value
    Null,
    /// Never issued, or already destroyed
    Stale,
    /// Live, but owned by a different session
    Foreign,
}

impl fmt::Display for HandleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleFault::Null => f.write_str("null"),
            HandleFault::Stale => f.write_str("stale"),
            HandleFault::Foreign => f.write_str("owned by another session"),
        }
    }
}

/// Errors reported by every boundary operation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Failed to initialize engine: {0}")]
    InitializationFailure(String),

    #[error("Invalid {kind} handle {handle:#x} ({reason})")]
    InvalidHandle {
        kind: HandleKind,
        handle: u64,
        reason: HandleFault,
    },

    #[error("Failed to create chat completion task: {0}")]
    TaskCreationFailure(String),

    #[error("Malformed text: {0}")]
    MalformedText(#[from] CodecError),

    #[error("Engine fault: {0}")]
    EngineFault(String),
}

impl BridgeError {
    /// Builds an `InvalidHandle` error, classifying zero as `Null`.
    pub fn invalid_handle(kind: HandleKind, handle: u64, reason: HandleFault) -> Self {
        let reason = if handle == 0 { HandleFault::Null } else { reason };
        BridgeError::InvalidHandle {
            kind,
            handle,
            reason,
        }
    }

    pub fn status(&self) -> BridgeStatus {
        match self {
            BridgeError::InitializationFailure(_) => BridgeStatus::InitializationFailure,
            BridgeError::InvalidHandle { .. } => BridgeStatus::InvalidHandle,
            BridgeError::TaskCreationFailure(_) => BridgeStatus::TaskCreationFailure,
            BridgeError::MalformedText(_) => BridgeStatus::MalformedText,
            BridgeError::EngineFault(_) => BridgeStatus::EngineFault,
        }
    }

    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, BridgeError::InvalidHandle { .. })
    }
}

/// Status codes for the C boundary
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Ok = 0,
    InitializationFailure = 1,
    InvalidHandle = 2,
    TaskCreationFailure = 3,
    MalformedText = 4,
    EngineFault = 5,
}
