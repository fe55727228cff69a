//! Retry with exponential backoff plus a per-collaborator circuit breaker.
//!
//! Every call into the language model or the vector search goes through a
//! [`ResiliencePolicy`]. The breaker is the only process-wide mutable state
//! in the pipeline; it is shared by all concurrent tickets through an `Arc`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use triage_llm::{LanguageModel, LlmRequest, LlmResponse};
use triage_rag::{SearchHit, VectorSearch};

use crate::config::ResilienceConfig;
use crate::error::{Result, TriageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    LanguageModel,
    Search,
}

impl Collaborator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collaborator::LanguageModel => "language_model",
            Collaborator::Search => "vector_search",
        }
    }
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    collaborator: Collaborator,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(collaborator: Collaborator, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            collaborator,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn collaborator(&self) -> Collaborator {
        self.collaborator
    }

    /// Current state. An open breaker whose cooldown has elapsed reports
    /// `HalfOpen`: the next call is let through as a trial.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if self.cooldown_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn cooldown_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at
            .map(|opened| opened.elapsed() >= self.recovery_timeout)
            .unwrap_or(true)
    }

    /// Decides under the lock whether a call may proceed. The returned
    /// permit must be settled with the call's outcome; a permit dropped
    /// unsettled (cancelled call) releases a half-open trial and reopens.
    fn acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let trial = match state {
            CircuitState::Closed => false,
            CircuitState::Open if self.cooldown_elapsed(&inner) => {
                inner.state = CircuitState::HalfOpen;
                debug!(collaborator = %self.collaborator, "circuit half-open, trial call");
                true
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => true,
            CircuitState::Open | CircuitState::HalfOpen => {
                return Err(TriageError::CircuitOpen {
                    collaborator: self.collaborator,
                })
            }
        };
        if trial {
            inner.trial_in_flight = true;
        }
        Ok(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            debug!(collaborator = %self.collaborator, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        if trial {
            inner.trial_in_flight = false;
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if trial {
            inner.trial_in_flight = false;
        }
        let trip = match inner.state {
            CircuitState::HalfOpen => trial,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            self.open(&mut inner);
            warn!(
                collaborator = %self.collaborator,
                failures = inner.consecutive_failures,
                "circuit opened"
            );
        }
    }

    fn release_abandoned_trial(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        if inner.state == CircuitState::HalfOpen {
            self.open(&mut inner);
            warn!(collaborator = %self.collaborator, "trial call abandoned, circuit reopened");
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }
}

/// Admission for one collaborator call.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_abandoned_trial();
        }
    }
}

/// Retry-and-breaker wrapper applied around a single collaborator call.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    max_attempts: u32,
    min_wait: Duration,
    max_wait: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl ResiliencePolicy {
    pub fn new(config: &ResilienceConfig, collaborator: Collaborator) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            min_wait: config.min_wait(),
            max_wait: config.max_wait(),
            breaker: Arc::new(CircuitBreaker::new(
                collaborator,
                config.failure_threshold,
                config.recovery_timeout(),
            )),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Wait after the `attempt`-th failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = Duration::from_secs(1u64 << exponent);
        raw.clamp(self.min_wait, self.max_wait.max(self.min_wait))
    }

    pub async fn call<T, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let collaborator = self.breaker.collaborator();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let permit = self.breaker.acquire()?;
            match f().await {
                Ok(value) => {
                    permit.succeed();
                    return Ok(value);
                }
                Err(err) => {
                    permit.fail();
                    warn!(
                        collaborator = %collaborator,
                        operation,
                        attempt,
                        error = %err,
                        "collaborator call failed"
                    );
                    if attempt >= self.max_attempts {
                        return Err(TriageError::RetriesExhausted {
                            collaborator,
                            attempts: attempt,
                            source: err,
                        });
                    }
                    sleep(self.backoff(attempt)).await;
                }
            }
        }
    }
}

/// Language model behind the resilience policy. Clones share one breaker.
#[derive(Clone)]
pub struct GuardedModel {
    inner: Arc<dyn LanguageModel>,
    policy: ResiliencePolicy,
}

impl GuardedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, config: &ResilienceConfig) -> Self {
        Self {
            inner,
            policy: ResiliencePolicy::new(config, Collaborator::LanguageModel),
        }
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub async fn complete(&self, operation: &'static str, req: &LlmRequest) -> Result<LlmResponse> {
        self.policy
            .call(operation, || self.inner.complete(req))
            .await
    }
}

/// Vector search behind the resilience policy. Clones share one breaker.
#[derive(Clone)]
pub struct GuardedSearch {
    inner: Arc<dyn VectorSearch>,
    policy: ResiliencePolicy,
}

impl GuardedSearch {
    pub fn new(inner: Arc<dyn VectorSearch>, config: &ResilienceConfig) -> Self {
        Self {
            inner,
            policy: ResiliencePolicy::new(config, Collaborator::Search),
        }
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub async fn query(&self, text: &str, category: Option<&str>, k: usize) -> Result<Vec<SearchHit>> {
        self.policy
            .call("search", || self.inner.query(text, category, k))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> ResilienceConfig {
        ResilienceConfig::default()
    }

    #[test]
    fn backoff_is_clamped() {
        let policy = ResiliencePolicy::new(&config(), Collaborator::LanguageModel);
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_opens_circuit() {
        let policy = ResiliencePolicy::new(&config(), Collaborator::Search);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = Instant::now();
        let result: Result<()> = policy
            .call("probe", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("connection refused"))
            })
            .await;
        assert!(matches!(
            result,
            Err(TriageError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(8) && waited < Duration::from_secs(9));
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        let refused: Result<()> = policy
            .call("probe", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(refused, Err(TriageError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_closes_on_success() {
        let policy = ResiliencePolicy::new(&config(), Collaborator::LanguageModel);
        let _: Result<()> = policy
            .call("probe", || async { Err(anyhow!("boom")) })
            .await;
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(policy.breaker().state(), CircuitState::HalfOpen);

        let value = policy.call("probe", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
        assert_eq!(policy.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let policy = ResiliencePolicy::new(&config(), Collaborator::LanguageModel);
        let _: Result<()> = policy.call("probe", || async { Err(anyhow!("down")) }).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = policy
            .call("probe", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("still down"))
            })
            .await;
        // The trial fails, the breaker reopens and the retry is refused.
        assert!(matches!(result, Err(TriageError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(policy.breaker().state(), CircuitState::Open);
    }

    async fn trip(policy: &ResiliencePolicy) {
        let _: Result<()> = policy.call("probe", || async { Err(anyhow!("down")) }).await;
        assert_eq!(policy.breaker().state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_reopens_instead_of_blocking() {
        let policy = ResiliencePolicy::new(&config(), Collaborator::LanguageModel);
        trip(&policy).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let slow = policy.call("probe", || async {
            sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(5), slow).await;
        assert!(timed_out.is_err());
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        let refused: Result<u32> = policy.call("probe", || async { Ok(1) }).await;
        assert!(matches!(refused, Err(TriageError::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_secs(61)).await;
        let value = policy.call("probe", || async { Ok(2) }).await.unwrap();
        assert_eq!(value, 2);
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial() {
        let policy = ResiliencePolicy::new(&config(), Collaborator::Search);
        trip(&policy).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let release = tokio::sync::Notify::new();
        let gate = &release;
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let trial = policy.call("trial", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            Ok(1u32)
        });
        let competitor = async {
            let result: Result<u32> = policy
                .call("competitor", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(2)
                })
                .await;
            gate.notify_one();
            result
        };
        let (trial, competitor) = tokio::join!(trial, competitor);
        assert_eq!(trial.unwrap(), 1);
        assert!(matches!(competitor, Err(TriageError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let policy = ResiliencePolicy::new(&config(), Collaborator::Search);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = policy
            .call("probe", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(anyhow!("flaky"))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
        assert_eq!(policy.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_clones_share_breaker() {
        struct Down;

        #[async_trait::async_trait]
        impl LanguageModel for Down {
            async fn complete(&self, _req: &LlmRequest) -> anyhow::Result<LlmResponse> {
                Err(anyhow!("503"))
            }
        }

        let model = GuardedModel::new(Arc::new(Down), &config());
        let clone = model.clone();
        let req = LlmRequest::new("sys", "user");
        assert!(model.complete("analyze", &req).await.is_err());
        assert_eq!(clone.policy().breaker().state(), CircuitState::Open);
        let err = clone.complete("compose", &req).await.unwrap_err();
        assert!(matches!(err, TriageError::CircuitOpen { .. }));
    }
}
