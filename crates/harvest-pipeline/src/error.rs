//! Error types for the harvest pipeline
//!
//! Per-record and per-message errors (source fetch, transform, validation, publish) are
//! logged and routed along the retry chain by the stages. Registry and configuration
//! errors are fatal to the stage invocation that raised them.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Remote record source unavailable or returned something unusable
    #[error("Source fetch failed: {0}")]
    SourceFetch(String),

    /// Record could not be converted into its canonical document
    #[error("Transform failed: {0}")]
    Transform(String),

    /// Candidate document is malformed for its declared format
    #[error("Invalid document: {0}")]
    Validation(String),

    /// Downstream store rejected or failed a read or write
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The queue's "has any message" probe failed
    #[error("Queue probe failed: {0}")]
    TransportProbe(String),

    /// Enqueue, claim or acknowledge failed
    #[error("Queue transport error: {0}")]
    Transport(String),

    /// Run or publish registry persistence failed
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Parent walk did not converge
    #[error("Promotion failed for '{identity}': {reason}")]
    Promotion { identity: String, reason: String },
}

impl PipelineError {
    pub fn source_fetch(msg: impl Into<String>) -> Self {
        Self::SourceFetch(msg.into())
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    pub fn probe(msg: impl Into<String>) -> Self {
        Self::TransportProbe(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn promotion(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Promotion {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must abort the enclosing stage invocation
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Registry(_) | Self::Config(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::registry("disk full").is_fatal());
        assert!(PipelineError::config("bad url").is_fatal());
        assert!(!PipelineError::transform("404").is_fatal());
        assert!(!PipelineError::probe("timeout").is_fatal());
    }

    #[test]
    fn test_promotion_message_names_identity() {
        let err = PipelineError::promotion("abc12", "depth exceeded");
        assert_eq!(err.to_string(), "Promotion failed for 'abc12': depth exceeded");
    }
}
