// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Dispatcher
//!
//! Transport adapter between a lapin consumer and the `ConsumptionEngine`.
//! It aligns the broker prefetch with the engine's in-flight budget, pulls a new
//! delivery only once the engine has a free slot, processes every delivery on its
//! own task, and settles it through `LapinAcknowledger`.

use crate::{
    classifier::ErrorClassifier,
    config::{AckMode, EngineConfig},
    delivery::{correlation_key_from_payload, Delivery},
    engine::{Acknowledger, ConsumptionEngine, StatsSnapshot},
    errors::EngineError,
    handler::ConsumerHandler,
    otel,
    outcome::AckDecision,
    queue::QueueDefinition,
    sink::{AmqpDeadLetterSink, DeadLetterSink, TracingDeadLetterSink},
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions,
    },
    protocol::basic::AMQPProperties,
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Settles engine decisions on a lapin channel.
pub struct LapinAcknowledger {
    channel: Arc<Channel>,
}

impl LapinAcknowledger {
    /// Creates an acknowledger settling on `channel`, the channel the deliveries
    /// were consumed from.
    pub fn new(channel: Arc<Channel>) -> Arc<LapinAcknowledger> {
        Arc::new(LapinAcknowledger { channel })
    }
}

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn resolve(&self, delivery: &Delivery, decision: AckDecision) -> Result<(), EngineError> {
        let tag = delivery.id.0;

        match decision {
            AckDecision::Ack => self
                .channel
                .basic_ack(tag, BasicAckOptions { multiple: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling ack msg");
                    EngineError::AckMessageError
                }),
            AckDecision::Requeue => self
                .channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    },
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling requeuing");
                    EngineError::RequeuingMessageError
                }),
            AckDecision::Reject => self
                .channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    },
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling nack msg");
                    EngineError::NackMessageError
                }),
        }
    }
}

/// Stable identity of an AMQP message: `message_id`, else `correlation_id`,
/// else a hash of the payload.
pub fn correlation_key(props: &AMQPProperties, payload: &[u8]) -> String {
    props
        .message_id()
        .as_ref()
        .or(props.correlation_id().as_ref())
        .map(|id| id.as_str().to_owned())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| correlation_key_from_payload(payload))
}

/// Converts a lapin delivery into an engine delivery.
pub fn into_delivery(delivery: &lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.delivery_tag,
        &correlation_key(&delivery.properties, &delivery.data),
        &delivery.data,
    )
    .redelivered(delivery.redelivered)
    .with_properties(delivery.properties.clone())
    .with_context(otel::extract_context(&delivery.properties))
}

/// Feeds `deliveries` to `engine` until the stream ends or `stop` is notified.
///
/// A delivery is pulled only after the engine granted an in-flight permit for
/// it, and each one is processed on its own task.
///
/// # Parameters
/// * `engine` - Engine deciding and settling every delivery
/// * `stop` - Shutdown signal, checked while waiting for a permit or a delivery
/// * `deliveries` - Inbound stream; item errors are logged and skipped
/// * `handler` - Business processing invoked once per delivery
async fn dispatch<S, E>(
    engine: &Arc<ConsumptionEngine>,
    stop: &Notify,
    mut deliveries: S,
    handler: &Arc<dyn ConsumerHandler>,
) where
    S: Stream<Item = Result<Delivery, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let permit = tokio::select! {
            _ = stop.notified() => break,
            permit = engine.admit() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = stop.notified() => break,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            None => {
                debug!("consumer stream closed");
                break;
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), "errors consume msg");
                continue;
            }
            Some(Ok(delivery)) => delivery,
        };

        let engine = engine.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.process(permit, delivery, handler.as_ref()).await {
                error!(error = err.to_string(), "error consume msg");
            }
        });
    }
}

/// Requests a running dispatcher to stop consuming.
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    /// Stops the dispatcher. A request made before the dispatcher waits is kept.
    pub fn shutdown(&self) {
        self.notify.notify_one();
    }
}

/// Consumes one queue and feeds its deliveries to a `ConsumptionEngine`.
pub struct RabbitMQDispatcher {
    channel: Arc<Channel>,
    queue_def: QueueDefinition,
    engine: Arc<ConsumptionEngine>,
    stop: Arc<Notify>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher whose engine settles on `channel` and dead-letters
    /// to the queue's DLQ when one is defined, to the log otherwise.
    pub fn new(
        channel: Arc<Channel>,
        queue_def: QueueDefinition,
        config: EngineConfig,
    ) -> Result<RabbitMQDispatcher, EngineError> {
        Self::new_with_classifier(channel, queue_def, config, ErrorClassifier::default())
    }

    /// Same as `new`, with custom classification rules.
    ///
    /// # Parameters
    /// * `channel` - Channel used to consume, settle and dead-letter
    /// * `queue_def` - Queue to consume and its optional DLQ
    /// * `config` - Engine tunables, validated here
    /// * `classifier` - Ordered rules for unqualified handler errors
    ///
    /// # Returns
    /// The dispatcher, or `EngineError::InvalidConfiguration` for an invalid `config`
    pub fn new_with_classifier(
        channel: Arc<Channel>,
        queue_def: QueueDefinition,
        config: EngineConfig,
        classifier: ErrorClassifier,
    ) -> Result<RabbitMQDispatcher, EngineError> {
        let sink: Arc<dyn DeadLetterSink> = match queue_def.dlq_name() {
            Some(dlq) => Arc::new(AmqpDeadLetterSink::new(channel.clone(), dlq)),
            None => Arc::new(TracingDeadLetterSink),
        };

        let engine = ConsumptionEngine::new(config, LapinAcknowledger::new(channel.clone()))?
            .with_classifier(classifier)
            .with_dead_letter_sink(sink);

        Ok(RabbitMQDispatcher {
            channel,
            queue_def,
            engine: Arc::new(engine),
            stop: Arc::new(Notify::new()),
        })
    }

    /// Engine the dispatcher feeds, e.g. to read its stats while consuming.
    pub fn engine(&self) -> &Arc<ConsumptionEngine> {
        &self.engine
    }

    /// Handle stopping `consume_blocking` from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: self.stop.clone(),
        }
    }

    fn prefetch(&self) -> Result<u16, EngineError> {
        u16::try_from(self.engine.config().get_max_in_flight()).map_err(|_| {
            EngineError::InvalidConfiguration("max_in_flight exceeds the AMQP prefetch range".into())
        })
    }

    /// Consumes until the queue's consumer is cancelled or a shutdown is requested,
    /// then drains in-flight deliveries and returns the final engine counters.
    pub async fn consume_blocking(
        &self,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<StatsSnapshot, EngineError> {
        let prefetch = self.prefetch()?;
        let tag = self
            .queue_def
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.queue_def.name, Uuid::new_v4()));

        if let Err(err) = self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(EngineError::QoSDeclarationError(err.to_string()));
        }

        let auto_ack = self.engine.config().get_ack_mode() == AckMode::Auto;

        let consumer = match self
            .channel
            .basic_consume(
                &self.queue_def.name,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: self.queue_def.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(EngineError::ConsumerDeclarationError)
            }
            Ok(c) => Ok(c),
        }?;

        info!(
            queue = self.queue_def.name,
            consumer_tag = tag,
            prefetch,
            auto_ack,
            "consumer started"
        );

        let deliveries = consumer.map(|next| next.map(|delivery| into_delivery(&delivery)));
        dispatch(&self.engine, &self.stop, deliveries, &handler).await;

        if let Err(err) = self
            .channel
            .basic_cancel(&tag, BasicCancelOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "failure to cancel the consumer");
        }

        Ok(self.engine.shutdown().await)
    }
}
