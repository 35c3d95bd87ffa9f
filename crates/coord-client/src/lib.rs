//! The Inference Client (C4): a uniform contract over N backends with
//! retry/backoff, a per-backend circuit breaker, and atomic cost recording
//! on success. Grounded in the teacher's `Provider` trait and
//! `OpenAICompatibleProvider` wire-format handling
//! (`crates/tandem-providers/src/lib.rs`); the circuit breaker and
//! retry/backoff layer on top, as the teacher's provider registry does not
//! yet have them.

mod breaker;
mod http_backend;

pub use breaker::{BreakerSnapshot, BreakerState};
pub use http_backend::HttpBackend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coord_ledger::CostLedger;
use coord_types::{CoreError, CoreResult, ProjectId};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use breaker::Breaker;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop_sequences: Vec<String>,
    pub deadline: Option<Duration>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            stop_sequences: Vec::new(),
            deadline: Some(Duration::from_secs(600)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub text: String,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub backend_id: String,
    pub latency: Duration,
}

/// How a backend failure classifies for retry/fallback purposes (§4.4).
#[derive(Debug, Clone)]
pub enum BackendError {
    /// 5xx, network errors, timeouts: retried in place before advancing
    /// the fallback chain.
    Transient(String),
    /// 4xx other than 429: no retries, advance the chain immediately.
    Permanent(String),
    /// 429 with an optional server-supplied `Retry-After`.
    RateLimited { retry_after: Option<Duration> },
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Transient(msg) => write!(f, "transient backend error: {msg}"),
            BackendError::Permanent(msg) => write!(f, "permanent backend error: {msg}"),
            BackendError::RateLimited { retry_after } => {
                write!(f, "rate limited, retry_after={retry_after:?}")
            }
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerateResult, BackendError>;
}

const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_CAP: Duration = Duration::from_secs(2);
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(5);

/// Runs a fallback chain of backends, applying retry/backoff classification
/// and a per-backend circuit breaker, recording cost atomically on success.
pub struct InferenceClient {
    backends: HashMap<String, Arc<dyn Backend>>,
    breakers: HashMap<String, Mutex<Breaker>>,
    ledger: Arc<CostLedger>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl InferenceClient {
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        ledger: Arc<CostLedger>,
        failure_threshold: u32,
        reset_timeout: Duration,
    ) -> Self {
        let mut breakers = HashMap::new();
        let mut map = HashMap::new();
        for backend in backends {
            breakers.insert(backend.id().to_string(), Mutex::new(Breaker::new()));
            map.insert(backend.id().to_string(), backend);
        }
        Self {
            backends: map,
            breakers,
            ledger,
            failure_threshold,
            reset_timeout,
        }
    }

    pub fn breaker_snapshot(&self, backend_id: &str) -> Option<BreakerSnapshot> {
        self.breakers
            .get(backend_id)
            .map(|b| b.try_lock().map(|b| b.snapshot()).unwrap_or(BreakerSnapshot::closed()))
    }

    /// Walks `chain` in order, skipping backends whose breaker is open (and
    /// not yet due for a half-open probe). Retries transient/429 failures in
    /// place per backend before advancing; permanent failures advance
    /// immediately. Emits a `CostRecord` atomically with a successful
    /// return. `request_id` makes the cost write idempotent under retries at
    /// the orchestrator level.
    pub async fn generate_with_fallback(
        &self,
        chain: &[String],
        project_id: ProjectId,
        prompt: &str,
        options: &GenerateOptions,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<GenerateResult> {
        if chain.is_empty() {
            return Err(CoreError::Internal("empty backend chain".to_string()));
        }

        let mut last_err: Option<String> = None;
        for backend_id in chain {
            if cancel.is_cancelled() {
                return Err(CoreError::DeadlineExceeded("generation cancelled".to_string()));
            }
            let Some(backend) = self.backends.get(backend_id) else {
                last_err = Some(format!("backend {backend_id} not registered"));
                continue;
            };

            if let Some(breaker) = self.breakers.get(backend_id) {
                let mut guard = breaker.lock().await;
                if !guard.allow_call(self.reset_timeout) {
                    last_err = Some(format!("circuit breaker open for {backend_id}"));
                    continue;
                }
            }

            match self.call_with_retry(backend.as_ref(), prompt, options, cancel).await {
                Ok(result) => {
                    if let Some(breaker) = self.breakers.get(backend_id) {
                        breaker.lock().await.record_success();
                    }
                    self.ledger
                        .record_cost(project_id, &result.backend_id, result.in_tokens, result.out_tokens, request_id)
                        .await?;
                    return Ok(result);
                }
                Err(err) => {
                    if let Some(breaker) = self.breakers.get(backend_id) {
                        breaker.lock().await.record_failure(self.failure_threshold);
                    }
                    tracing::warn!(backend = %backend_id, error = %err, "backend_call_failed");
                    last_err = Some(err.to_string());
                }
            }
        }

        Err(CoreError::DependencyUnavailable(format!(
            "all backends in chain exhausted: {}",
            last_err.unwrap_or_else(|| "no attempts made".to_string())
        )))
    }

    /// Retries a single backend per §4.4's classification: transient/429
    /// get up to two retries with jittered exponential backoff (base 200ms,
    /// capped at 2s; 429 instead waits the server's `Retry-After` up to 5s);
    /// permanent failures return immediately.
    async fn call_with_retry(
        &self,
        backend: &dyn Backend,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerateResult, BackendError> {
        let mut attempt = 0u32;
        loop {
            let call = backend.generate(prompt, options, cancel);
            let outcome = match options.deadline {
                Some(deadline) => match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Transient("deadline exceeded".to_string())),
                },
                None => call.await,
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(BackendError::Permanent(msg)) => return Err(BackendError::Permanent(msg)),
                Err(BackendError::RateLimited { retry_after }) if attempt < 2 => {
                    let wait = retry_after.unwrap_or(RETRY_BASE).min(MAX_RATE_LIMIT_WAIT);
                    attempt += 1;
                    tokio::time::sleep(wait).await;
                }
                Err(BackendError::Transient(msg)) if attempt < 2 => {
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    let _ = &msg;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE.saturating_mul(1u32 << attempt.min(4));
    let capped = exp.min(RETRY_CAP);
    let jitter_ms = rand::random::<u64>() % 100;
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_types::{LatencyClass, ModelDescriptor, Tier};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct ScriptedBackend {
        id: String,
        responses: Mutex<Vec<Result<GenerateResult, BackendError>>>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(id: &str, responses: Vec<Result<GenerateResult, BackendError>>) -> Self {
            Self {
                id: id.to_string(),
                responses: Mutex::new(responses.into_iter().rev().collect()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
            _cancel: &CancellationToken,
        ) -> Result<GenerateResult, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .await
                .pop()
                .unwrap_or_else(|| Err(BackendError::Permanent("exhausted script".to_string())))
        }
    }

    fn result(backend_id: &str) -> GenerateResult {
        GenerateResult {
            text: "ok".to_string(),
            in_tokens: 10,
            out_tokens: 5,
            backend_id: backend_id.to_string(),
            latency: Duration::from_millis(1),
        }
    }

    fn backend_descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            tier: Tier::Elastic,
            price_in_per_million: 1.0,
            price_out_per_million: 2.0,
            context_window: 32_000,
            latency_class: LatencyClass::Medium,
            capability_tags: vec![],
            endpoint: "https://example.invalid".to_string(),
        }
    }

    fn ledger(dir: &std::path::Path, backend_ids: &[&str]) -> Arc<CostLedger> {
        Arc::new(
            CostLedger::new(
                dir.to_path_buf(),
                backend_ids.iter().map(|id| backend_descriptor(id)).collect(),
                1000.0,
                10_000.0,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn falls_back_to_next_backend_after_exhausting_retries() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), &["primary", "secondary"]);
        let primary = Arc::new(ScriptedBackend::new(
            "primary",
            vec![
                Err(BackendError::Transient("503".to_string())),
                Err(BackendError::Transient("503".to_string())),
                Err(BackendError::Transient("503".to_string())),
            ],
        ));
        let secondary = Arc::new(ScriptedBackend::new("secondary", vec![Ok(result("secondary"))]));
        let client = InferenceClient::new(
            vec![primary.clone(), secondary.clone()],
            ledger.clone(),
            5,
            Duration::from_secs(30),
        );

        let cancel = CancellationToken::new();
        let outcome = client
            .generate_with_fallback(
                &["primary".to_string(), "secondary".to_string()],
                ProjectId::new(),
                "hello",
                &GenerateOptions::default(),
                "req-1",
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.backend_id, "secondary");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries_and_advances_chain() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), &["primary", "secondary"]);
        let primary = Arc::new(ScriptedBackend::new(
            "primary",
            vec![Err(BackendError::Permanent("400 bad request".to_string()))],
        ));
        let secondary = Arc::new(ScriptedBackend::new("secondary", vec![Ok(result("secondary"))]));
        let client = InferenceClient::new(vec![primary.clone(), secondary], ledger, 5, Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let outcome = client
            .generate_with_fallback(
                &["primary".to_string(), "secondary".to_string()],
                ProjectId::new(),
                "hello",
                &GenerateOptions::default(),
                "req-1",
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.backend_id, "secondary");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_five_consecutive_failures() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), &["flaky", "backup"]);
        let flaky = Arc::new(ScriptedBackend::new(
            "flaky",
            (0..10).map(|_| Err(BackendError::Transient("boom".to_string()))).collect(),
        ));
        let backup = Arc::new(ScriptedBackend::new("backup", vec![Ok(result("backup")); 5]));
        let client = InferenceClient::new(vec![flaky.clone(), backup], ledger, 5, Duration::from_secs(30));

        for _ in 0..5 {
            let cancel = CancellationToken::new();
            let _ = client
                .generate_with_fallback(
                    &["flaky".to_string(), "backup".to_string()],
                    ProjectId::new(),
                    "hello",
                    &GenerateOptions::default(),
                    "req",
                    &cancel,
                )
                .await;
        }

        let snapshot = client.breaker_snapshot("flaky").unwrap();
        assert_eq!(snapshot.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_the_call_is_made() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), &["primary"]);
        let primary = Arc::new(ScriptedBackend::new("primary", vec![Ok(result("primary"))]));
        let client = InferenceClient::new(vec![primary], ledger, 5, Duration::from_secs(30));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .generate_with_fallback(
                &["primary".to_string()],
                ProjectId::new(),
                "hello",
                &GenerateOptions::default(),
                "req",
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "deadline_exceeded");
    }
}
