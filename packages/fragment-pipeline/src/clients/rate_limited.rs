//! Rate-limited LLM client wrapper.
//!
//! Wraps any [`LlmClient`] with a client-side quota using the governor crate,
//! so bursts of fragments do not run straight into provider rate limits.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::RetrySettings;
use crate::error::ApiError;
use crate::traits::llm::{LlmClient, ResponseFormat};

type DefaultRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Burst allowed when none is configured.
const DEFAULT_BURST: NonZeroU32 = nonzero!(1u32);

/// An LLM client that waits for a permit before every call.
pub struct RateLimitedLlm<C: LlmClient> {
    inner: C,
    limiter: Arc<DefaultRateLimiter>,
}

impl<C: LlmClient> RateLimitedLlm<C> {
    /// Limit `client` to `requests_per_second`. Returns `None` when the rate is 0.
    pub fn new(client: C, requests_per_second: u32) -> Option<Self> {
        Self::with_burst(client, requests_per_second, DEFAULT_BURST.get())
    }

    /// Sustained rate plus a burst allowance. Returns `None` when either is 0.
    pub fn with_burst(client: C, requests_per_second: u32, burst: u32) -> Option<Self> {
        let rate = NonZeroU32::new(requests_per_second)?;
        let burst = NonZeroU32::new(burst)?;
        Some(Self::with_quota(client, Quota::per_second(rate).allow_burst(burst)))
    }

    /// Create with a custom quota.
    pub fn with_quota(client: C, quota: Quota) -> Self {
        Self {
            inner: client,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

/// Wrap `client` according to the retry settings, boxing either way.
pub fn from_settings<C>(client: C, settings: &RetrySettings) -> Arc<dyn LlmClient>
where
    C: LlmClient + 'static,
{
    limit_shared(Arc::new(client), settings)
}

/// Apply `llm_requests_per_second` to a shared client. A rate of 0 returns
/// the client unchanged.
pub fn limit_shared(client: Arc<dyn LlmClient>, settings: &RetrySettings) -> Arc<dyn LlmClient> {
    let Some(rate) = NonZeroU32::new(settings.llm_requests_per_second) else {
        return client;
    };
    tracing::debug!(requests_per_second = rate.get(), "LLM rate limit enabled");
    Arc::new(RateLimitedLlm::with_quota(
        client,
        Quota::per_second(rate).allow_burst(DEFAULT_BURST),
    ))
}

#[async_trait]
impl<C: LlmClient> LlmClient for RateLimitedLlm<C> {
    async fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String, ApiError> {
        self.limiter.until_ready().await;
        self.inner.complete(prompt, format).await
    }

    fn model_name(&self) -> String {
        self.inner.model_name()
    }
}
