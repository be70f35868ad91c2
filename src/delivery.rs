// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A `Delivery` is one inbound unit of work handed to the engine by a transport.
//! It carries the transport handle used to settle exactly this delivery, the
//! stable business identity used for retry counting, and an opaque payload the
//! engine never inspects.

use lapin::BasicProperties;
use opentelemetry::Context;
use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
};

/// Transport-assigned handle of a single delivery (the AMQP delivery tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(pub u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DeliveryId {
    fn from(tag: u64) -> Self {
        DeliveryId(tag)
    }
}

/// An inbound message instance waiting to be processed and resolved.
///
/// Several deliveries may share a `correlation_key` when the same message is
/// redelivered; each of them has its own `id`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: DeliveryId,
    pub correlation_key: String,
    pub payload: Vec<u8>,
    /// Broker redelivery flag, when the transport provides one.
    pub attempt_hint: Option<bool>,
    pub(crate) props: BasicProperties,
    pub(crate) ctx: Context,
}

impl Delivery {
    /// Creates a delivery with an empty trace context and no redelivery hint.
    pub fn new(id: u64, correlation_key: &str, payload: &[u8]) -> Delivery {
        Delivery {
            id: DeliveryId(id),
            correlation_key: correlation_key.to_owned(),
            payload: payload.to_vec(),
            attempt_hint: None,
            props: BasicProperties::default(),
            ctx: Context::new(),
        }
    }

    /// Sets the broker-supplied redelivery flag.
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.attempt_hint = Some(redelivered);
        self
    }

    /// Attaches the trace context the delivery was published under.
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    /// Keeps the message properties the delivery arrived with, so that a
    /// dead-lettered copy can be republished with them.
    pub fn with_properties(mut self, props: BasicProperties) -> Self {
        self.props = props;
        self
    }

    /// Trace context the delivery was published under.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Message properties the delivery arrived with.
    pub fn properties(&self) -> &BasicProperties {
        &self.props
    }
}

/// Derives a correlation key from the payload bytes.
///
/// Used when a message carries neither a message id nor a correlation id, so
/// that identical redelivered payloads still share a retry budget.
///
/// The digest comes from `DefaultHasher`, whose algorithm may change between
/// Rust releases. Keys are only comparable within one build of the worker,
/// which is all the in-memory `RetryLedger` needs; do not persist them or
/// compare them across differently built processes.
pub fn correlation_key_from_payload(payload: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_key_is_stable_for_identical_payloads() {
        let a = correlation_key_from_payload(br#"{"task_id":7}"#);
        let b = correlation_key_from_payload(br#"{"task_id":7}"#);
        let c = correlation_key_from_payload(br#"{"task_id":8}"#);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn builder_sets_redelivery_hint() {
        let delivery = Delivery::new(42, "k1", b"payload").redelivered(true);

        assert_eq!(delivery.id, DeliveryId(42));
        assert_eq!(delivery.correlation_key, "k1");
        assert_eq!(delivery.attempt_hint, Some(true));
        assert_eq!(delivery.id.to_string(), "42");
        assert!(delivery.properties().headers().is_none());
    }
}
