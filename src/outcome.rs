// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Processing Outcomes and Acknowledgment Decisions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a processing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Retrying may succeed
    Transient,
    /// Retrying will not help
    Permanent,
    /// The handler panicked
    Poison,
    /// The error matched no classifier rule
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Poison => "poison",
            FailureKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Result of invoking the processing function for one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure { kind: FailureKind, detail: String },
}

impl Outcome {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Outcome {
        Outcome::Failure {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Failure kind, `None` on success.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// How a delivery is settled with the transport.
///
/// - `Ack`: processed, remove from the queue
/// - `Requeue`: negative-acknowledge and make it eligible for redelivery
/// - `Reject`: negative-acknowledge without requeue, discard permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckDecision {
    Ack,
    Requeue,
    Reject,
}

impl AckDecision {
    /// Whether the decision ends the message's life (no further delivery).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckDecision::Requeue)
    }
}
