// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Sinks
//!
//! Destinations for deliveries the engine rejects for good. The engine calls a
//! sink best-effort: a sink error is logged and counted, and the delivery is
//! still resolved with the transport.

use crate::{
    delivery::Delivery,
    errors::EngineError,
    otel::RabbitMQTracePropagator,
    outcome::{FailureKind, Outcome},
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, LongUInt, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::global;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, warn};

/// Header carrying the failure kind of a dead-lettered message
pub const AMQP_HEADERS_FAILURE_KIND: &str = "x-failure-kind";
/// Header carrying the failure detail of a dead-lettered message
pub const AMQP_HEADERS_FAILURE_DETAIL: &str = "x-failure-detail";
/// Header carrying the number of processing attempts made
pub const AMQP_HEADERS_ATTEMPTS: &str = "x-attempts";
/// Header carrying the correlation key of a dead-lettered message
pub const AMQP_HEADERS_CORRELATION_KEY: &str = "x-correlation-key";

/// Records permanently rejected deliveries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Records `delivery` together with the outcome that got it rejected and the
    /// number of attempts made for its correlation key.
    async fn record(
        &self,
        delivery: &Delivery,
        outcome: &Outcome,
        attempts: u32,
    ) -> Result<(), EngineError>;
}

/// Serializable summary of a dead-lettered delivery.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub delivery_id: u64,
    pub correlation_key: String,
    pub kind: Option<FailureKind>,
    pub detail: Option<String>,
    pub attempts: u32,
    pub payload_len: usize,
}

impl DeadLetterRecord {
    /// Summarizes a rejected delivery; the payload itself is not copied.
    pub fn new(delivery: &Delivery, outcome: &Outcome, attempts: u32) -> DeadLetterRecord {
        let detail = match outcome {
            Outcome::Success => None,
            Outcome::Failure { detail, .. } => Some(detail.clone()),
        };

        DeadLetterRecord {
            delivery_id: delivery.id.0,
            correlation_key: delivery.correlation_key.clone(),
            kind: outcome.kind(),
            detail,
            attempts,
            payload_len: delivery.payload.len(),
        }
    }
}

/// Sink that writes dead letters to the log. The default when no queue is configured.
#[derive(Debug, Default, Clone)]
pub struct TracingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for TracingDeadLetterSink {
    async fn record(
        &self,
        delivery: &Delivery,
        outcome: &Outcome,
        attempts: u32,
    ) -> Result<(), EngineError> {
        let record = DeadLetterRecord::new(delivery, outcome, attempts);

        match serde_json::to_string(&record) {
            Ok(json) => {
                error!(record = json, "message dead-lettered");
                Ok(())
            }
            Err(err) => {
                warn!(error = err.to_string(), "failure to serialize dead letter");
                Err(EngineError::InternalError)
            }
        }
    }
}

/// Sink that republishes rejected payloads to a dead-letter queue through the
/// default exchange, annotated with failure headers.
pub struct AmqpDeadLetterSink {
    channel: Arc<Channel>,
    dlq_name: String,
}

impl AmqpDeadLetterSink {
    /// Creates a sink publishing to the queue `dlq_name` on `channel`.
    pub fn new(channel: Arc<Channel>, dlq_name: &str) -> AmqpDeadLetterSink {
        AmqpDeadLetterSink {
            channel,
            dlq_name: dlq_name.to_owned(),
        }
    }

    /// Original headers of `delivery` with the trace context and failure
    /// metadata merged in. Failure headers overwrite same-named originals.
    fn headers(
        delivery: &Delivery,
        outcome: &Outcome,
        attempts: u32,
    ) -> BTreeMap<ShortString, AMQPValue> {
        let mut btree = delivery
            .properties()
            .headers()
            .as_ref()
            .map(|headers| headers.inner().clone())
            .unwrap_or_default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(
                delivery.context(),
                &mut RabbitMQTracePropagator::new(&mut btree),
            )
        });

        if let Outcome::Failure { kind, detail } = outcome {
            btree.insert(
                ShortString::from(AMQP_HEADERS_FAILURE_KIND),
                AMQPValue::LongString(LongString::from(kind.to_string())),
            );
            btree.insert(
                ShortString::from(AMQP_HEADERS_FAILURE_DETAIL),
                AMQPValue::LongString(LongString::from(detail.clone())),
            );
        }

        btree.insert(
            ShortString::from(AMQP_HEADERS_ATTEMPTS),
            AMQPValue::LongUInt(LongUInt::from(attempts)),
        );
        btree.insert(
            ShortString::from(AMQP_HEADERS_CORRELATION_KEY),
            AMQPValue::LongString(LongString::from(delivery.correlation_key.clone())),
        );

        btree
    }

    /// Properties of the republished copy: the delivery's own properties with
    /// merged headers, and the correlation key as message id when it had none.
    fn properties(delivery: &Delivery, outcome: &Outcome, attempts: u32) -> BasicProperties {
        let headers = Self::headers(delivery, outcome, attempts);
        let props = delivery
            .properties()
            .clone()
            .with_headers(FieldTable::from(headers));

        if props.message_id().is_some() {
            return props;
        }

        props.with_message_id(ShortString::from(delivery.correlation_key.clone()))
    }
}

#[async_trait]
impl DeadLetterSink for AmqpDeadLetterSink {
    async fn record(
        &self,
        delivery: &Delivery,
        outcome: &Outcome,
        attempts: u32,
    ) -> Result<(), EngineError> {
        let props = Self::properties(delivery, outcome, attempts);

        match self
            .channel
            .basic_publish(
                "",
                &self.dlq_name,
                BasicPublishOptions::default(),
                &delivery.payload,
                props,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    dlq = self.dlq_name,
                    "error whiling sending to dlq"
                );
                Err(EngineError::PublishingToDLQError(self.dlq_name.clone()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_summarizes_failure() {
        let delivery = Delivery::new(9, "k2", b"{}");
        let outcome = Outcome::failure(FailureKind::Permanent, "invalid_data");

        let record = DeadLetterRecord::new(&delivery, &outcome, 1);

        assert_eq!(
            record,
            DeadLetterRecord {
                delivery_id: 9,
                correlation_key: "k2".to_owned(),
                kind: Some(FailureKind::Permanent),
                detail: Some("invalid_data".to_owned()),
                attempts: 1,
                payload_len: 2,
            }
        );
    }

    #[test]
    fn amqp_headers_carry_failure_metadata() {
        let delivery = Delivery::new(1, "k1", b"x");
        let outcome = Outcome::failure(FailureKind::Transient, "timeout");

        let headers = AmqpDeadLetterSink::headers(&delivery, &outcome, 3);

        assert_eq!(
            headers.get(AMQP_HEADERS_FAILURE_KIND),
            Some(&AMQPValue::LongString(LongString::from("transient")))
        );
        assert_eq!(
            headers.get(AMQP_HEADERS_ATTEMPTS),
            Some(&AMQPValue::LongUInt(3))
        );
        assert_eq!(
            headers.get(AMQP_HEADERS_CORRELATION_KEY),
            Some(&AMQPValue::LongString(LongString::from("k1")))
        );
    }

    #[test]
    fn republished_copy_keeps_original_properties() {
        let mut original = BTreeMap::new();
        original.insert(
            ShortString::from("tenant"),
            AMQPValue::LongString(LongString::from("acme")),
        );
        let delivery = Delivery::new(4, "corr-7", b"{}").with_properties(
            BasicProperties::default()
                .with_correlation_id(ShortString::from("corr-7"))
                .with_content_type(ShortString::from("application/json"))
                .with_delivery_mode(2)
                .with_headers(FieldTable::from(original)),
        );
        let outcome = Outcome::failure(FailureKind::Permanent, "invalid_data");

        let props = AmqpDeadLetterSink::properties(&delivery, &outcome, 1);

        assert_eq!(props.correlation_id(), &Some(ShortString::from("corr-7")));
        assert_eq!(
            props.content_type(),
            &Some(ShortString::from("application/json"))
        );
        assert_eq!(props.delivery_mode(), &Some(2));
        assert_eq!(props.message_id(), &Some(ShortString::from("corr-7")));

        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get("tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
        assert_eq!(
            headers.inner().get(AMQP_HEADERS_FAILURE_KIND),
            Some(&AMQPValue::LongString(LongString::from("permanent")))
        );
    }

    #[test]
    fn original_message_id_is_not_replaced() {
        let delivery = Delivery::new(4, "hash", b"{}").with_properties(
            BasicProperties::default().with_message_id(ShortString::from("order-1")),
        );

        let props = AmqpDeadLetterSink::properties(
            &delivery,
            &Outcome::failure(FailureKind::Unknown, "boom"),
            3,
        );

        assert_eq!(props.message_id(), &Some(ShortString::from("order-1")));
    }

    #[tokio::test]
    async fn tracing_sink_accepts_records() {
        let sink = TracingDeadLetterSink;
        let delivery = Delivery::new(1, "k", b"");

        let res = sink
            .record(&delivery, &Outcome::failure(FailureKind::Poison, "panic"), 2)
            .await;

        assert!(res.is_ok());
    }
}
