//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure. Every variant is a
//! validation failure: the input is rejected and no state changes.

use thiserror::Error;

use super::amount::AmountError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Amount or currency failed validation
    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    /// Event type is not part of the closed taxonomy
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Envelope is structurally invalid
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Payload does not match the shape of its event family
    #[error("Malformed payload for {event_type}: {reason}")]
    MalformedPayload { event_type: String, reason: String },

    /// A field required by this particular operation is absent
    #[error("Missing field '{field}' for {event_type}")]
    MissingField {
        event_type: String,
        field: &'static str,
    },

    /// Request that cannot be expressed against the model
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl DomainError {
    pub fn missing_field(event_type: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            event_type: event_type.into(),
            field,
        }
    }

    pub fn malformed_payload(event_type: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedPayload {
            event_type: event_type.into(),
            reason: reason.to_string(),
        }
    }
}
