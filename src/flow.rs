// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Flow Control
//!
//! Bounds the number of deliveries a worker holds unresolved at once, the
//! in-process counterpart of the AMQP `basic.qos` prefetch count. A permit is
//! taken before a delivery is processed and handed back once the delivery has
//! been settled with the transport. Permits release on drop, so every acquired
//! permit is released exactly once, including on error paths.

use crate::errors::EngineError;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Proof that one in-flight slot is held.
#[derive(Debug)]
pub struct FlowPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicU32>,
}

impl FlowPermit {
    /// Gives the slot back. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for FlowPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counting gate admitting at most `max_in_flight` concurrent deliveries.
#[derive(Debug)]
pub struct FlowController {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicU32>,
    max_in_flight: u32,
    accepting: AtomicBool,
}

impl FlowController {
    /// Creates a controller; `max_in_flight` must be at least 1.
    pub fn new(max_in_flight: u32) -> Result<FlowController, EngineError> {
        if max_in_flight == 0 {
            return Err(EngineError::InvalidConfiguration(
                "max_in_flight must be at least 1".to_owned(),
            ));
        }

        Ok(FlowController {
            semaphore: Arc::new(Semaphore::new(max_in_flight as usize)),
            in_flight: Arc::new(AtomicU32::new(0)),
            max_in_flight,
            accepting: AtomicBool::new(true),
        })
    }

    /// Waits for a free slot and takes it.
    ///
    /// Fails with `EngineError::ShuttingDown` once `close` has been called,
    /// including for callers that were already waiting.
    pub async fn acquire(&self) -> Result<FlowPermit, EngineError> {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;

        // close() may have happened while we were queued
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }

        Ok(self.admit(permit))
    }

    /// Takes a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<FlowPermit> {
        if !self.is_accepting() {
            return None;
        }

        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> FlowPermit {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        FlowPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Number of permits currently held.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stops admitting new permits. Outstanding permits stay valid.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Closes the controller and waits until every outstanding permit is released.
    pub async fn drain(&self) {
        self.close();
        debug!(in_flight = self.in_flight(), "draining in-flight deliveries");

        if let Ok(all) = self.semaphore.acquire_many(self.max_in_flight).await {
            self.semaphore.close();
            drop(all);
        }

        debug!("flow controller drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            FlowController::new(0),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn in_flight_stays_within_bounds() {
        let flow = FlowController::new(3).unwrap();
        let mut held = vec![];

        for step in 0..20 {
            if step % 3 == 2 {
                held.pop();
            } else if let Some(permit) = flow.try_acquire() {
                held.push(permit);
            }

            assert!(flow.in_flight() <= flow.max_in_flight());
            assert_eq!(flow.in_flight() as usize, held.len());
        }

        held.clear();
        assert_eq!(flow.in_flight(), 0);
    }

    #[tokio::test]
    async fn acquire_blocks_at_capacity_until_release() {
        let flow = FlowController::new(1).unwrap();
        let first = flow.acquire().await.unwrap();

        assert!(flow.try_acquire().is_none());
        assert!(timeout(Duration::from_millis(50), flow.acquire()).await.is_err());

        first.release();

        let second = timeout(Duration::from_millis(50), flow.acquire())
            .await
            .expect("slot should be free")
            .unwrap();
        assert_eq!(flow.in_flight(), 1);
        drop(second);
    }

    #[tokio::test]
    async fn closed_controller_refuses_permits() {
        let flow = FlowController::new(2).unwrap();
        flow.close();

        assert_eq!(flow.acquire().await.unwrap_err(), EngineError::ShuttingDown);
        assert!(flow.try_acquire().is_none());
    }

    #[tokio::test]
    async fn drain_waits_for_outstanding_permits() {
        let flow = Arc::new(FlowController::new(2).unwrap());
        let permit = flow.acquire().await.unwrap();

        let draining = tokio::spawn({
            let flow = flow.clone();
            async move { flow.drain().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!draining.is_finished());

        permit.release();
        timeout(Duration::from_secs(1), draining)
            .await
            .expect("drain should finish")
            .unwrap();

        assert_eq!(flow.in_flight(), 0);
        assert_eq!(flow.acquire().await.unwrap_err(), EngineError::ShuttingDown);
    }
}
