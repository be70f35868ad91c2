// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The processing function the engine invokes once per delivery. Handlers report
//! failures as `ProcessingError` values; they never settle deliveries themselves.

use crate::{delivery::Delivery, errors::ProcessingError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::future::Future;

/// Business processing for one delivery.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes `delivery` under the trace context `ctx`.
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), ProcessingError>;
}

/// Adapts an async closure into a `ConsumerHandler`.
///
/// The closure receives its own copy of the delivery so the returned future
/// does not borrow from the engine.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), ProcessingError> {
        (self.f)(delivery.clone()).await
    }
}
