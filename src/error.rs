//! Error types for the ledger, codec registry and runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The result type used throughout earlysign.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors raised by the ledger core.
///
/// "Upstream event not yet available" is not an error: readers return
/// `None` and components report [`crate::component::StepOutcome::Skipped`].
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Backend I/O failure or timeout. Retryable.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No codec registered for the payload type.
    #[error("unknown payload type: {payload_type}")]
    UnknownPayloadType { payload_type: String },

    /// Payload type differs from what the caller expected.
    #[error("schema mismatch: expected {expected}, found {actual}")]
    SchemaMismatch { expected: String, actual: String },

    /// A different codec is already registered under this payload type.
    #[error("codec conflict for payload type {payload_type}: {existing} already registered, refusing {attempted}")]
    CodecConflict {
        payload_type: String,
        existing: String,
        attempted: String,
    },

    /// Structurally invalid draft, rejected before reaching the store.
    #[error("invalid event draft: {reason}")]
    InvalidDraft { reason: String },

    /// Payload content could not be encoded or decoded by its codec.
    #[error("malformed {payload_type} payload: {message}")]
    MalformedPayload {
        payload_type: String,
        message: String,
    },

    /// A component tried to write outside the namespaces it owns.
    #[error("component '{component}' is not authorized to write namespace '{namespace}'")]
    UnauthorizedNamespace { component: String, namespace: String },

    /// Computation inside a component failed.
    #[error("component '{component}' failed: {message}")]
    ComponentFailed { component: String, message: String },

    /// The orchestration plan is not runnable.
    #[error("invalid plan: {reason}")]
    InvalidPlan { reason: String },

    /// A run attempted an illegal state change.
    #[error("invalid run state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl LedgerError {
    /// Creates a store error without an underlying cause.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a store error wrapping its cause.
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_draft(reason: impl Into<String>) -> Self {
        Self::InvalidDraft {
            reason: reason.into(),
        }
    }

    pub fn component(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ComponentFailed {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Classification recorded in `lifecycle/error` events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::UnknownPayloadType { .. } => ErrorKind::UnknownPayloadType,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::CodecConflict { .. } => ErrorKind::CodecConflict,
            Self::InvalidDraft { .. } => ErrorKind::InvalidDraft,
            Self::MalformedPayload { .. } => ErrorKind::MalformedPayload,
            Self::UnauthorizedNamespace { .. } => ErrorKind::UnauthorizedNamespace,
            Self::ComponentFailed { .. } => ErrorKind::ComponentFailed,
            Self::InvalidPlan { .. } => ErrorKind::InvalidPlan,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
        }
    }

    /// Only backend failures are worth retrying without a code change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

/// Stable classification of a [`LedgerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StoreUnavailable,
    UnknownPayloadType,
    SchemaMismatch,
    CodecConflict,
    InvalidDraft,
    MalformedPayload,
    UnauthorizedNamespace,
    ComponentFailed,
    InvalidPlan,
    InvalidStateTransition,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreUnavailable => "store_unavailable",
            Self::UnknownPayloadType => "unknown_payload_type",
            Self::SchemaMismatch => "schema_mismatch",
            Self::CodecConflict => "codec_conflict",
            Self::InvalidDraft => "invalid_draft",
            Self::MalformedPayload => "malformed_payload",
            Self::UnauthorizedNamespace => "unauthorized_namespace",
            Self::ComponentFailed => "component_failed",
            Self::InvalidPlan => "invalid_plan",
            Self::InvalidStateTransition => "invalid_state_transition",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
