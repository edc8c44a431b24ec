use crate::error::TransportError;
use crate::transport::{PtzTransport, TransportOp};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::PTZ_TRANSPORT_RETRIES;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base, 2*base, 4*base...
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

/// A call that did not succeed, with the number of attempts made.
#[derive(Debug, Clone)]
pub(crate) struct CallFailure {
    pub error: TransportError,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub(crate) struct CallCounters {
    pub retries: AtomicU64,
    pub resets: AtomicU64,
}

/// Wraps a device's transport with the mandatory timeout and the bounded
/// retry loop. Shared by the probe and the dispatcher of one session.
pub(crate) struct TransportCaller {
    device: String,
    transport: Arc<dyn PtzTransport>,
    policy: RetryPolicy,
    counters: CallCounters,
}

impl TransportCaller {
    pub fn new(device: String, transport: Arc<dyn PtzTransport>, policy: RetryPolicy) -> Self {
        Self {
            device,
            transport,
            policy,
            counters: CallCounters::default(),
        }
    }

    pub fn transport(&self) -> &dyn PtzTransport {
        self.transport.as_ref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn retries(&self) -> u64 {
        self.counters.retries.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> u64 {
        self.counters.resets.load(Ordering::Relaxed)
    }

    /// Run `call` until it succeeds, fails with a device fault, or
    /// `retries` extra attempts are used up on transient failures.
    pub async fn call<T, F, Fut>(
        &self,
        op: TransportOp,
        retries: u32,
        mut call: F,
    ) -> Result<T, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match timeout(self.policy.call_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout(self.policy.call_timeout)),
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() || attempt > retries {
                return Err(CallFailure {
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.policy.backoff(attempt - 1);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            PTZ_TRANSPORT_RETRIES
                .with_label_values(&[op.as_str()])
                .inc();
            debug!(
                device = %self.device,
                operation = %op,
                attempt,
                max_attempts = retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient transport failure, retrying"
            );

            if matches!(error, TransportError::ConnectionReset(_)) {
                self.reset_transport().await;
            }

            sleep(delay).await;
        }
    }

    async fn reset_transport(&self) {
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        match timeout(self.policy.call_timeout, self.transport.reset()).await {
            Ok(Ok(())) => debug!(device = %self.device, "transport reset after dropped connection"),
            Ok(Err(e)) => warn!(device = %self.device, error = %e, "transport reset failed"),
            Err(_) => warn!(device = %self.device, "transport reset timed out"),
        }
    }
}
