// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! Token-bucket rate limiting for link operations (§4.C "Rate limiter").
//!
//! Publish and subscribe slots on a [`crate::link::Link`] are gated by one of
//! these per operation kind. The limiter is starvation-free: waiters are
//! served in FIFO order because [`tokio::sync::Semaphore`] itself queues
//! fairly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{Error, ErrorKind};

/// A token-bucket limiter with a background refill task.
///
/// `permits_per_second == 0` means effectively unlimited: no refill task is
/// spawned and `acquire` never blocks.
pub struct RateLimiter {
    semaphore: std::sync::Arc<Semaphore>,
    unlimited: bool,
    refill_task: Option<JoinHandle<()>>,
    closed: std::sync::Arc<AtomicBool>,
}

impl RateLimiter {
    /// Builds a limiter with `burst` initial tokens, refilling by
    /// `permits_per_second` once per second.
    #[must_use]
    pub fn new(permits_per_second: u32, burst: u32) -> Self {
        if permits_per_second == 0 {
            return RateLimiter {
                semaphore: std::sync::Arc::new(Semaphore::new(0)),
                unlimited: true,
                refill_task: None,
                closed: std::sync::Arc::new(AtomicBool::new(false)),
            };
        }

        let semaphore = std::sync::Arc::new(Semaphore::new(burst as usize));
        let closed = std::sync::Arc::new(AtomicBool::new(false));
        let task_semaphore = semaphore.clone();
        let task_closed = closed.clone();
        let max_permits = burst as usize;
        let refill_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if task_closed.load(Ordering::Relaxed) {
                    return;
                }
                let available = task_semaphore.available_permits();
                let to_add = max_permits.saturating_sub(available).min(permits_per_second as usize);
                if to_add > 0 {
                    task_semaphore.add_permits(to_add);
                }
            }
        });

        RateLimiter {
            semaphore,
            unlimited: false,
            refill_task: Some(refill_task),
            closed,
        }
    }

    /// Builds a limiter with effectively unlimited throughput.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// Waits for one permit, queueing FIFO behind any earlier waiters.
    ///
    /// # Errors
    /// `Closed` if the limiter has been shut down while waiting.
    pub async fn acquire(&self) -> Result<(), Error> {
        if self.unlimited {
            return Ok(());
        }
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::closed())?;
        permit.forget();
        Ok(())
    }

    /// Stops the background refill task. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.refill_task.take() {
            handle.abort();
        }
    }
}
