//! Retry policies for external calls.
//!
//! A [`RetryPolicy`] is a plain value composed at each call site: the LLM
//! policy retries transient failures with exponential backoff, the DB-RPC
//! policy retries connection failures only, with a small fixed budget.
//! Sleeping happens on the tokio timer, so a backing-off fragment never blocks
//! the others.
//!
//! Every retry logs a `warn!` and every exhaustion an `error!`, both tagged
//! with `service`, `phase`, `attempt` and `max_attempts`. The alert manager
//! matches on these fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::config::RetrySettings;
use crate::error::{truncate_message, ApiError, ApiErrorKind, TerminalApiError};

/// External service a call goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Llm,
    DbRpc,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Llm => "llm",
            Service::DbRpc => "db_rpc",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay between two attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base * 2^retry`, capped at `max`
    Exponential { base: Duration, max: Duration },
    Fixed(Duration),
}

impl Backoff {
    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry.min(16));
                base.saturating_mul(factor).min(max)
            }
            Backoff::Fixed(delay) => delay,
        }
    }
}

/// How many times a call is attempted, how long to wait in between and which
/// errors are worth another attempt.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub service: Service,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub is_retryable: fn(&ApiError) -> bool,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("service", &self.service)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Timeouts, rate limits and connection failures, exponential backoff.
    pub fn llm(settings: &RetrySettings) -> Self {
        Self {
            service: Service::Llm,
            max_attempts: settings.llm_max_attempts.max(1),
            backoff: Backoff::Exponential {
                base: Duration::from_millis(settings.llm_base_delay_ms),
                max: Duration::from_millis(settings.llm_max_delay_ms),
            },
            is_retryable: ApiError::is_transient,
        }
    }

    /// Connection failures only; validation and business errors fail at once.
    pub fn db_rpc(settings: &RetrySettings) -> Self {
        Self {
            service: Service::DbRpc,
            max_attempts: settings.rpc_max_attempts.max(1),
            backoff: Backoff::Fixed(Duration::from_millis(settings.rpc_retry_delay_ms)),
            is_retryable: |e: &ApiError| e.kind == ApiErrorKind::Connection,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or the
    /// attempt budget is spent.
    pub async fn call<T, F, Fut>(&self, phase: &str, mut op: F) -> Result<T, TerminalApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !(self.is_retryable)(&err) || attempt >= self.max_attempts {
                tracing::error!(
                    service = %self.service,
                    phase,
                    attempt,
                    max_attempts = self.max_attempts,
                    error_kind = %err.kind,
                    error = %truncate_message(&err.message),
                    "External call failed"
                );
                return Err(TerminalApiError {
                    service: self.service,
                    phase: phase.to_string(),
                    attempts: attempt,
                    last_cause: err,
                });
            }

            let delay = self.backoff.delay_for(attempt - 1);
            tracing::warn!(
                service = %self.service,
                phase,
                attempt,
                max_attempts = self.max_attempts,
                error_kind = %err.kind,
                error = %truncate_message(&err.message),
                delay_ms = delay.as_millis() as u64,
                "External call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_settings() -> RetrySettings {
        RetrySettings {
            llm_max_attempts: 3,
            llm_base_delay_ms: 0,
            llm_max_delay_ms: 0,
            rpc_max_attempts: 2,
            rpc_retry_delay_ms: 0,
            llm_requests_per_second: 0,
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(350));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn first_success_needs_no_retry() {
        let policy = RetryPolicy::db_rpc(&fast_settings());
        let result = tokio_test::block_on(policy.call("persistencia", || async { Ok::<_, ApiError>(7) }));
        assert_eq!(tokio_test::assert_ok!(result), 7);
    }

    #[tokio::test]
    async fn llm_policy_retries_transient_errors_until_success() {
        let policy = RetryPolicy::llm(&fast_settings());
        let calls = AtomicU32::new(0);

        let result = policy
            .call("fase_1_triaje", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ApiError::rate_limited("429"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn llm_policy_exhaustion_reports_phase_attempts_and_cause() {
        let policy = RetryPolicy::llm(&fast_settings());

        let err = policy
            .call::<(), _, _>("fase_2_extraccion", || async {
                Err(ApiError::connection("refused"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.service, Service::Llm);
        assert_eq!(err.phase, "fase_2_extraccion");
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_cause.kind, ApiErrorKind::Connection);
    }

    #[tokio::test]
    async fn validation_errors_fail_immediately() {
        let policy = RetryPolicy::llm(&fast_settings());
        let calls = AtomicU32::new(0);

        let err = policy
            .call::<(), _, _>("fase_1_triaje", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::validation("bad prompt")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn db_rpc_policy_retries_connection_errors_once() {
        let policy = RetryPolicy::db_rpc(&fast_settings());
        let calls = AtomicU32::new(0);

        let err = policy
            .call::<(), _, _>("fase_4_normalizacion", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::connection("reset")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.service, Service::DbRpc);
        assert_eq!(err.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn db_rpc_policy_does_not_retry_timeouts() {
        let policy = RetryPolicy::db_rpc(&fast_settings());
        let calls = AtomicU32::new(0);

        let _ = policy
            .call::<(), _, _>("fase_4_normalizacion", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::timeout("slow")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
