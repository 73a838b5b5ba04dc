/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Shared runtime utilities for Covenant services.
//!
//! Provides common building blocks that are duplicated across services:
//! - [`RetryPolicy`]: explicit retry loop with pluggable backoff
//! - [`shutdown_signal`]: graceful SIGINT/SIGTERM handler

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]

use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Outcome of a single attempt inside a retry loop.
///
/// `Transient` errors are retried after the policy's backoff; `Fatal`
/// errors abort the loop and surface immediately.
#[derive(Debug)]
pub enum Attempt<E> {
    Transient(E),
    Fatal(E),
}

/// An explicit retry loop with fixed backoff and an optional attempt cap.
///
/// The exchange transport retries transient failures every 10 seconds,
/// forever — by design, as backpressure against a down directory. That
/// loop lives here rather than inside the transport call so tests can
/// substitute a bounded policy with a short backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry transient failures forever, sleeping `backoff` between attempts.
    #[must_use]
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    /// Retry transient failures at most `max_attempts` times in total.
    #[must_use]
    pub fn bounded(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts),
        }
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Drive `op` until it succeeds, fails fatally, or exhausts the
    /// attempt cap. The last transient error is returned on exhaustion.
    ///
    /// # Errors
    ///
    /// Returns the operation's error on a fatal outcome or once the
    /// attempt cap is reached.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt<E>>>,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match op().await {
                Ok(v) => return Ok(v),
                Err(Attempt::Fatal(e)) => {
                    error!(error = %e, attempt, "operation failed, not retryable");
                    return Err(e);
                }
                Err(Attempt::Transient(e)) => {
                    if let Some(max) = self.max_attempts {
                        if attempt >= max {
                            warn!(error = %e, attempt, "retries exhausted");
                            return Err(e);
                        }
                    }
                    warn!(error = %e, attempt, backoff_secs = self.backoff.as_secs(), "transient failure, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Wait for SIGINT (ctrl-c) or SIGTERM, then return.
///
/// Use with `tokio::select!` around the service's main loop.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(1));
        let result: Result<u32, &str> = policy.run(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_retry_fatal_aborts_immediately() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(Attempt::Fatal("bad request")) }
            })
            .await;
        assert_eq!(result.unwrap_err(), "bad request");
        assert_eq!(calls.load(Ordering::Relaxed), 1, "fatal must not retry");
    }

    #[tokio::test]
    async fn test_retry_transient_then_success() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if n < 2 {
                        Err(Attempt::Transient("503"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_bounded_exhausts() {
        let policy = RetryPolicy::bounded(Duration::from_millis(1), 3);
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(Attempt::Transient("timeout")) }
            })
            .await;
        assert_eq!(result.unwrap_err(), "timeout");
        assert_eq!(calls.load(Ordering::Relaxed), 3, "should stop at the cap");
    }
}
