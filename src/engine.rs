// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption Engine
//!
//! Drives each delivery through `Received -> Processing -> Resolved`:
//!
//! 1. take a flow-control permit and record the attempt for the correlation key
//! 2. run the handler (panics become `Poison`, timeouts become `Transient`)
//! 3. classify a failure and ask the policy for a decision
//! 4. clear the retry record on terminal decisions, dead-letter rejects
//! 5. settle the delivery with the transport, then release the permit
//!
//! Handler failures never escape as errors. Only a failure to settle the delivery
//! with the transport is returned to the caller, since the engine can then no
//! longer vouch for the delivery's fate.

use crate::{
    classifier::ErrorClassifier,
    config::{AckMode, EngineConfig},
    delivery::Delivery,
    errors::EngineError,
    flow::{FlowController, FlowPermit},
    handler::ConsumerHandler,
    ledger::RetryLedger,
    otel,
    outcome::{AckDecision, FailureKind, Outcome},
    policy,
    sink::{DeadLetterSink, TracingDeadLetterSink},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::Serialize;
use std::{
    any::Any,
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, warn};

/// Settles deliveries with the transport they came from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Performs the protocol-level ack, nack-with-requeue or nack-without-requeue.
    async fn resolve(&self, delivery: &Delivery, decision: AckDecision) -> Result<(), EngineError>;
}

#[derive(Debug, Default)]
struct EngineStats {
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    dead_lettered: AtomicU64,
    sink_failures: AtomicU64,
    lost: AtomicU64,
}

impl EngineStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn decision(&self, decision: AckDecision) {
        match decision {
            AckDecision::Ack => Self::incr(&self.acked),
            AckDecision::Requeue => Self::incr(&self.requeued),
            AckDecision::Reject => Self::incr(&self.rejected),
        }
    }
}

/// Point-in-time view of engine counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub sink_failures: u64,
    /// Failures in auto-ack mode, unrecoverable by construction
    pub lost: u64,
    pub in_flight: u32,
    /// Correlation keys waiting for a redelivery
    pub pending_retries: usize,
}

/// Decides and applies the fate of every delivery a worker receives.
pub struct ConsumptionEngine {
    config: EngineConfig,
    classifier: ErrorClassifier,
    ledger: RetryLedger,
    flow: FlowController,
    acknowledger: Arc<dyn Acknowledger>,
    sink: Arc<dyn DeadLetterSink>,
    stats: EngineStats,
}

impl ConsumptionEngine {
    /// Creates an engine with the default classifier and a log-only dead-letter sink.
    pub fn new(
        config: EngineConfig,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Result<ConsumptionEngine, EngineError> {
        config.validate()?;

        Ok(ConsumptionEngine {
            flow: FlowController::new(config.get_max_in_flight())?,
            config,
            classifier: ErrorClassifier::default(),
            ledger: RetryLedger::new(),
            acknowledger,
            sink: Arc::new(TracingDeadLetterSink),
            stats: EngineStats::default(),
        })
    }

    /// Replaces the error classifier.
    ///
    /// # Parameters
    /// * `classifier` - Ordered rules applied to unqualified handler errors
    ///
    /// # Returns
    /// The engine, for chaining
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replaces the dead-letter sink rejected deliveries are recorded to.
    ///
    /// # Parameters
    /// * `sink` - Destination called once per `Reject` decision, best-effort
    ///
    /// # Returns
    /// The engine, for chaining
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validated configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attempt counters per correlation key.
    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// In-flight permits handed out by `admit`.
    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Waits for an in-flight slot. Transport loops call this before pulling the
    /// next delivery so backpressure reaches the broker.
    pub async fn admit(&self) -> Result<FlowPermit, EngineError> {
        self.flow.acquire().await
    }

    /// Admits, processes and settles one delivery.
    pub async fn submit<H>(&self, delivery: Delivery, handler: &H) -> Result<AckDecision, EngineError>
    where
        H: ConsumerHandler + ?Sized,
    {
        let permit = self.admit().await?;
        self.process(permit, delivery, handler).await
    }

    /// Processes and settles a delivery already holding a permit from `admit`.
    pub async fn process<H>(
        &self,
        permit: FlowPermit,
        delivery: Delivery,
        handler: &H,
    ) -> Result<AckDecision, EngineError>
    where
        H: ConsumerHandler + ?Sized,
    {
        match self.config.get_ack_mode() {
            AckMode::Manual => self.process_manual(permit, delivery, handler).await,
            AckMode::Auto => Ok(self.process_auto(permit, delivery, handler).await),
        }
    }

    async fn process_manual<H>(
        &self,
        permit: FlowPermit,
        delivery: Delivery,
        handler: &H,
    ) -> Result<AckDecision, EngineError>
    where
        H: ConsumerHandler + ?Sized,
    {
        let tracer = global::tracer("amqp consumer");
        let mut span = otel::new_span(delivery.context(), &tracer, "consume");

        let key = delivery.correlation_key.as_str();
        let attempts = self.ledger.record_attempt(key);

        debug!(
            delivery_id = %delivery.id,
            correlation_key = key,
            attempts,
            redelivered = ?delivery.attempt_hint,
            "received"
        );

        let outcome = self.invoke(handler, &delivery).await;
        let decision = policy::decide(&outcome, attempts, self.config.get_max_attempts());

        if decision.is_terminal() {
            self.ledger.clear(key);
        }

        match (&outcome, decision) {
            (Outcome::Success, _) => {
                debug!(correlation_key = key, "message successfully processed");
                span.set_status(Status::Ok);
            }
            (Outcome::Failure { kind, detail }, AckDecision::Requeue) => {
                warn!(
                    correlation_key = key,
                    attempts,
                    kind = %kind,
                    detail = %detail,
                    "error whiling handling msg, requeuing for latter"
                );
                Self::record_failure(&mut span, detail);
            }
            (Outcome::Failure { kind, detail }, _) => {
                error!(
                    correlation_key = key,
                    attempts,
                    kind = %kind,
                    detail = %detail,
                    "rejecting message permanently"
                );
                Self::record_failure(&mut span, detail);
            }
        }

        if decision == AckDecision::Reject {
            self.dead_letter(&delivery, &outcome, attempts).await;
        }

        if let Err(err) = self.acknowledger.resolve(&delivery, decision).await {
            error!(
                error = err.to_string(),
                delivery_id = %delivery.id,
                ?decision,
                "failure to resolve delivery"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to resolve msg"),
            });
            permit.release();
            return Err(err);
        }

        self.stats.decision(decision);

        if decision.is_terminal() {
            self.sweep_expired();
        }

        // counters must be final before a draining shutdown can observe the slot
        permit.release();

        Ok(decision)
    }

    async fn process_auto<H>(&self, permit: FlowPermit, delivery: Delivery, handler: &H) -> AckDecision
    where
        H: ConsumerHandler + ?Sized,
    {
        let outcome = self.invoke(handler, &delivery).await;

        match outcome {
            Outcome::Success => EngineStats::incr(&self.stats.acked),
            Outcome::Failure { kind, detail } => {
                EngineStats::incr(&self.stats.lost);
                error!(
                    correlation_key = %delivery.correlation_key,
                    kind = %kind,
                    detail = %detail,
                    "message lost: delivery was auto-acknowledged before processing failed"
                );
            }
        }

        permit.release();
        AckDecision::Ack
    }

    /// Runs the handler, turning every way it can fail into an `Outcome`.
    async fn invoke<H>(&self, handler: &H, delivery: &Delivery) -> Outcome
    where
        H: ConsumerHandler + ?Sized,
    {
        let call = AssertUnwindSafe(handler.exec(delivery.context(), delivery)).catch_unwind();

        let result = match self.config.get_processing_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return Outcome::failure(
                        FailureKind::Transient,
                        format!("processing timed out after {}ms", limit.as_millis()),
                    )
                }
            },
            None => call.await,
        };

        match result {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(err)) => self.classifier.classify(&err),
            Err(panic) => ErrorClassifier::poison(&panic_message(panic.as_ref())),
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, outcome: &Outcome, attempts: u32) {
        match self.sink.record(delivery, outcome, attempts).await {
            Ok(()) => EngineStats::incr(&self.stats.dead_lettered),
            Err(err) => {
                EngineStats::incr(&self.stats.sink_failures);
                error!(
                    error = err.to_string(),
                    correlation_key = %delivery.correlation_key,
                    "dead-letter sink unavailable, rejecting without record"
                );
            }
        }
    }

    fn sweep_expired(&self) {
        if let Some(ttl) = self.config.get_retry_record_ttl() {
            let expired = self.ledger.expire_older_than(ttl);
            if expired > 0 {
                debug!(expired, "expired stale retry records");
            }
        }
    }

    fn record_failure(span: &mut impl Span, detail: &str) {
        span.record_error(&EngineError::ConsumerError(detail.to_owned()));
        span.set_status(Status::Error {
            description: Cow::from(detail.to_owned()),
        });
    }

    /// Reads the current counters. Counters are updated before a delivery's
    /// permit is released, so a snapshot taken after `shutdown` is final.
    pub fn stats(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        StatsSnapshot {
            acked: load(&self.stats.acked),
            requeued: load(&self.stats.requeued),
            rejected: load(&self.stats.rejected),
            dead_lettered: load(&self.stats.dead_lettered),
            sink_failures: load(&self.stats.sink_failures),
            lost: load(&self.stats.lost),
            in_flight: self.flow.in_flight(),
            pending_retries: self.ledger.len(),
        }
    }

    /// Stops admitting deliveries, waits for in-flight ones to be settled and
    /// returns the final counters.
    pub async fn shutdown(&self) -> StatsSnapshot {
        info!("stopping consumption engine...");
        self.flow.drain().await;

        let stats = self.stats();
        info!(
            acked = stats.acked,
            requeued = stats.requeued,
            rejected = stats.rejected,
            dead_lettered = stats.dead_lettered,
            lost = stats.lost,
            pending_retries = stats.pending_retries,
            "consumption engine stopped"
        );
        stats
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_owned()
    }
}
