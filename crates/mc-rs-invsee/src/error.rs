//! Error types for the inspection engine and its collaborators.

use thiserror::Error;

use crate::identity::ParticipantId;
use crate::kind::InventoryKind;

/// Errors surfaced to the operator-facing caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvseeError {
    #[error("no player known as '{0}'")]
    NotFound(String),

    #[error("permission denied: missing '{node}'")]
    PermissionDenied { node: String },

    #[error("player store unavailable for {target}: {reason}")]
    StoreUnavailable {
        target: ParticipantId,
        reason: String,
    },

    #[error("corrupt {kind} data for {target} at slot {slot:?}: {reason}")]
    CorruptData {
        target: ParticipantId,
        kind: InventoryKind,
        slot: Option<usize>,
        reason: String,
    },

    #[error("slot {slot} out of range (size {size})")]
    OutOfRange { slot: usize, size: usize },

    #[error("item rejected for slot {slot}: {reason}")]
    InvalidItem { slot: usize, reason: String },

    #[error("inventory source for {target} ({kind}) is detached")]
    SourceDetached {
        target: ParticipantId,
        kind: InventoryKind,
    },

    #[error("view is already closed")]
    ViewClosed,

    #[error("host rejected the request: {0}")]
    Host(#[from] HostError),
}

impl InvseeError {
    /// Stable result code, as reported to the command layer.
    pub fn code(&self) -> &'static str {
        match self {
            InvseeError::NotFound(_) => "NotFound",
            InvseeError::PermissionDenied { .. } => "PermissionDenied",
            InvseeError::StoreUnavailable { .. } => "StoreUnavailable",
            InvseeError::CorruptData { .. } => "CorruptData",
            InvseeError::OutOfRange { .. } => "OutOfRange",
            InvseeError::InvalidItem { .. } => "InvalidItem",
            InvseeError::SourceDetached { .. } => "SourceDetached",
            InvseeError::ViewClosed => "ViewClosed",
            InvseeError::Host(_) => "HostError",
        }
    }

    /// Attach target context to a store failure.
    pub fn from_store(err: StoreError, target: &ParticipantId, kind: InventoryKind) -> Self {
        match err {
            StoreError::NoData => InvseeError::NotFound(target.to_string()),
            StoreError::Unavailable(reason) => InvseeError::StoreUnavailable {
                target: target.clone(),
                reason,
            },
            StoreError::TimedOut(ms) => InvseeError::StoreUnavailable {
                target: target.clone(),
                reason: format!("timed out after {ms} ms"),
            },
            StoreError::Corrupt { slot, reason } => InvseeError::CorruptData {
                target: target.clone(),
                kind,
                slot,
                reason,
            },
        }
    }
}

/// Errors returned by a [`PlayerStore`](crate::host::PlayerStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no stored data")]
    NoData,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0} ms")]
    TimedOut(u64),

    #[error("corrupt data at slot {slot:?}: {reason}")]
    Corrupt { slot: Option<usize>, reason: String },
}

/// Errors returned by a [`HostWorld`](crate::host::HostWorld) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("player {0} is not connected")]
    NotConnected(ParticipantId),

    #[error("unknown view {0}")]
    UnknownView(u64),

    #[error("{0}")]
    Rejected(String),
}
