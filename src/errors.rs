// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Consumption Engine
//!
//! Two families of errors live here. `ProcessingError` is what a message handler
//! returns when it fails; it never leaves the engine, it is classified and turned
//! into an acknowledgment decision. `EngineError` covers everything the engine
//! itself can fail at: configuration, lifecycle, and talking to the transport.

use thiserror::Error;

/// Failure reported by a message handler.
///
/// `Transient` and `Permanent` let the handler state the failure kind directly.
/// `Other` carries an unqualified error message that the classifier matches
/// against its ordered rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Retrying may succeed (dependency timeout, connection refused, ...)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying will not help (invalid or malformed payload)
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Failure of a kind the handler did not qualify
    #[error("{0}")]
    Other(String),
}

impl ProcessingError {
    /// Raw message carried by the error, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            ProcessingError::Transient(msg)
            | ProcessingError::Permanent(msg)
            | ProcessingError::Other(msg) => msg,
        }
    }
}

/// Represents errors that can occur while consuming and resolving deliveries.
///
/// Handler failures are not part of this enum. Only problems that prevent the
/// engine from guaranteeing the resolution of a delivery, or from starting at
/// all, are reported here.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Engine or consumer configuration rejected at construction
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The engine no longer admits deliveries
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message without requeue
    #[error("failure to nack message")]
    NackMessageError,

    /// Error negative-acknowledging a message with requeue
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDLQError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_error_message_strips_kind() {
        assert_eq!(ProcessingError::Transient("timeout".into()).message(), "timeout");
        assert_eq!(
            ProcessingError::Permanent("bad json".into()).to_string(),
            "permanent failure: bad json"
        );
        assert_eq!(ProcessingError::Other("boom".into()).to_string(), "boom");
    }
}
