//! Operation Context
//!
//! Metadata about the current operation, carried for tracing.
//! The actor id is supplied by the upstream authentication layer; it is never
//! derived here.

use serde::{Deserialize, Serialize};

/// Context for an operation, used for tracing and event correlation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationContext {
    /// Owning user id as asserted by the caller's auth layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_user_id: Option<String>,

    /// Correlation id propagated onto emitted events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, user_id: impl Into<String>) -> Self {
        self.actor_user_id = Some(user_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> String {
        self.correlation_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let context = OperationContext::new()
            .with_actor("user-1")
            .with_correlation_id("corr-1");

        assert_eq!(context.actor_user_id.as_deref(), Some("user-1"));
        assert_eq!(context.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn test_ensure_correlation_id() {
        let mut context = OperationContext::new();
        assert!(context.correlation_id.is_none());

        let id = context.ensure_correlation_id();
        assert_eq!(context.correlation_id.as_deref(), Some(id.as_str()));

        // Calling again should return the same ID
        assert_eq!(context.ensure_correlation_id(), id);
    }
}
