use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use evoloop_llm::provider::{CompletionRequest, LlmError, LlmProvider};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use super::extract::extract_document;
use super::quota::{QuotaBook, quota_day};
use crate::config::{BackendSpec, LoopCfg};
use crate::prompts::{self, PromptKey};
use crate::store;

const QUOTA_PREFIX: &str = "model_quota_";
const EXHAUSTED_PREFIX: &str = "model_exhausted_";

/// Backends ranked in the top two of the pool get this many attempts.
const TOP_ATTEMPTS: u32 = 3;
const OTHER_ATTEMPTS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("all models exhausted for today")]
    AllModelsExhausted,
    #[error("all models failed: {last}")]
    AllModelsFailed { last: String },
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Timing knobs. Tests shrink these to milliseconds.
#[derive(Debug, Clone)]
pub struct ManagerTuning {
    pub rpm_cooldown: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub min_call_interval: Duration,
    pub reset_hour_utc: u32,
}

impl ManagerTuning {
    pub fn from_cfg(cfg: &LoopCfg) -> Self {
        Self {
            rpm_cooldown: Duration::from_millis(cfg.rpm_cooldown_ms),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_cap: Duration::from_millis(cfg.backoff_cap_ms),
            min_call_interval: Duration::from_millis(cfg.min_call_interval_ms),
            reset_hour_utc: cfg.quota_reset_hour_utc,
        }
    }

    /// Wait before retrying attempt `attempt` (1-based) after an overload.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedUsage {
    used_today: u32,
    day: NaiveDate,
}

/// Outcome of working one backend.
enum Attempt {
    Done(Value),
    Next(String),
}

/// Ranked pool of generative backends with quota, RPM and pacing governance.
/// One instance is owned by the scheduler and lent to each stage.
pub struct ModelManager {
    pool: SqlitePool,
    book: QuotaBook,
    providers: Vec<Arc<dyn LlmProvider>>,
    tuning: ManagerTuning,
    day: NaiveDate,
    last_dispatch: Option<Instant>,
}

impl ModelManager {
    pub fn new(
        pool: SqlitePool,
        backends: Vec<(BackendSpec, Arc<dyn LlmProvider>)>,
        tuning: ManagerTuning,
    ) -> Self {
        let (specs, providers): (Vec<_>, Vec<_>) = backends.into_iter().unzip();
        let day = quota_day(Utc::now(), tuning.reset_hour_utc);
        Self { pool, book: QuotaBook::new(specs), providers, tuning, day, last_dispatch: None }
    }

    /// Load today's usage and exhaustion from `system_state`. Entries from
    /// other days are ignored.
    pub async fn restore(&mut self) -> Result<(), sqlx::Error> {
        for (key, value) in store::state::list_prefix(&self.pool, QUOTA_PREFIX).await? {
            let name = &key[QUOTA_PREFIX.len()..];
            let (Some(idx), Ok(usage)) = (self.book.find(name), serde_json::from_str::<PersistedUsage>(&value))
            else {
                continue;
            };
            if usage.day == self.day {
                let exhausted = self.book.is_exhausted(idx);
                self.book.restore(idx, usage.used_today, exhausted);
            }
        }
        for (key, value) in store::state::list_prefix(&self.pool, EXHAUSTED_PREFIX).await? {
            let name = &key[EXHAUSTED_PREFIX.len()..];
            let Some(idx) = self.book.find(name) else { continue };
            if value.parse::<NaiveDate>().ok() == Some(self.day) {
                let used = self.book.used_today(idx);
                self.book.restore(idx, used, true);
            }
        }
        for (name, used, quota, exhausted) in self.usage() {
            tracing::info!(backend = %name, used, quota, exhausted, "quota restored");
        }
        Ok(())
    }

    /// `(name, used_today, daily_quota, exhausted)` per backend, configuration order.
    pub fn usage(&self) -> Vec<(String, u32, u32, bool)> {
        (0..self.book.len())
            .map(|i| {
                let spec = self.book.spec(i);
                (spec.name.clone(), self.book.used_today(i), spec.daily_quota, self.book.is_exhausted(i))
            })
            .collect()
    }

    /// Reset every backend when `now` falls in a later quota day.
    pub async fn roll_over_if_needed(&mut self, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        let day = quota_day(now, self.tuning.reset_hour_utc);
        if day <= self.day {
            return Ok(false);
        }
        self.day = day;
        self.book.reset();
        store::state::delete_prefixes(&self.pool, &[QUOTA_PREFIX, EXHAUSTED_PREFIX]).await?;
        tracing::info!(%day, "quota day rolled over, all backends reset");
        Ok(true)
    }

    /// Send the `key` prompt with `context` and return the structured document.
    pub async fn complete(&mut self, key: PromptKey, context: &str) -> Result<Value, ModelError> {
        self.roll_over_if_needed(Utc::now()).await?;
        let prompt = prompts::render(key, context);

        let mut candidates = self.book.select_available(Instant::now());
        if candidates.is_empty() {
            if self.book.any_under_quota() {
                tracing::warn!(cooldown_ms = self.tuning.rpm_cooldown.as_millis() as u64, "all backends at RPM limit, cooling down");
                tokio::time::sleep(self.tuning.rpm_cooldown).await;
                candidates = self.book.select_available(Instant::now());
            }
            if candidates.is_empty() {
                return Err(ModelError::AllModelsExhausted);
            }
        }

        let mut last = String::from("no backend attempted");
        for idx in candidates {
            match self.work_backend(idx, key, &prompt).await? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Next(reason) => last = reason,
            }
        }
        if self.book.all_exhausted() {
            return Err(ModelError::AllModelsExhausted);
        }
        Err(ModelError::AllModelsFailed { last })
    }

    async fn work_backend(&mut self, idx: usize, key: PromptKey, prompt: &str) -> Result<Attempt, ModelError> {
        let name = self.book.spec(idx).name.clone();
        let attempts = if self.book.rank(idx) < 2 { TOP_ATTEMPTS } else { OTHER_ATTEMPTS };
        let provider = Arc::clone(&self.providers[idx]);

        for attempt in 1..=attempts {
            self.pace().await;
            self.book.record_dispatch(idx, Instant::now());
            tracing::debug!(backend = %name, prompt = key.as_str(), attempt, "dispatching");

            match provider.complete(CompletionRequest::prompt(prompt)).await {
                Ok(resp) => match extract_document(&resp.content) {
                    Ok(value) => {
                        let used = self.book.record_success(idx);
                        self.persist_usage(idx).await?;
                        tracing::info!(
                            backend = %name,
                            prompt = key.as_str(),
                            used,
                            quota = self.book.spec(idx).daily_quota,
                            "model call succeeded"
                        );
                        return Ok(Attempt::Done(value));
                    }
                    Err(e) => {
                        tracing::warn!(backend = %name, error = %e, "unparsable response, abandoning backend");
                        return Ok(Attempt::Next(format!("{name}: {e}")));
                    }
                },
                Err(LlmError::QuotaExhausted) => {
                    self.book.mark_exhausted(idx);
                    self.persist_exhaustion(idx).await?;
                    tracing::warn!(backend = %name, "quota exhausted, marked for the day");
                    return Ok(Attempt::Next(format!("{name}: quota exhausted")));
                }
                Err(LlmError::Overloaded) if attempt < attempts => {
                    let wait = self.tuning.backoff(attempt);
                    tracing::warn!(backend = %name, attempt, wait_ms = wait.as_millis() as u64, "backend overloaded, backing off");
                    tokio::time::sleep(wait).await;
                }
                Err(LlmError::Overloaded) => {
                    return Ok(Attempt::Next(format!("{name}: overloaded after {attempts} attempts")));
                }
                Err(e) => {
                    tracing::warn!(backend = %name, prompt = key.as_str(), error = %e, "model call failed");
                    return Ok(Attempt::Next(format!("{name}: {e}")));
                }
            }
        }
        Ok(Attempt::Next(format!("{name}: attempts exhausted")))
    }

    /// Sleep out whatever remains of the minimum inter-call interval.
    async fn pace(&mut self) {
        if let Some(last) = self.last_dispatch {
            let elapsed = last.elapsed();
            if elapsed < self.tuning.min_call_interval {
                tokio::time::sleep(self.tuning.min_call_interval - elapsed).await;
            }
        }
        self.last_dispatch = Some(Instant::now());
    }

    async fn persist_usage(&self, idx: usize) -> Result<(), sqlx::Error> {
        let usage = PersistedUsage { used_today: self.book.used_today(idx), day: self.day };
        let value = serde_json::to_string(&usage).unwrap_or_default();
        let key = format!("{QUOTA_PREFIX}{}", self.book.spec(idx).name);
        store::state::put(&self.pool, &key, &value).await
    }

    async fn persist_exhaustion(&self, idx: usize) -> Result<(), sqlx::Error> {
        let key = format!("{EXHAUSTED_PREFIX}{}", self.book.spec(idx).name);
        store::state::put(&self.pool, &key, &self.day.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoloop_llm::provider::ScriptedProvider;

    const DOC: &str = "```yaml\nlesson: ok\n```";

    fn tuning() -> ManagerTuning {
        ManagerTuning {
            rpm_cooldown: Duration::from_millis(5),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            min_call_interval: Duration::ZERO,
            reset_hour_utc: 8,
        }
    }

    fn manager(pool: &SqlitePool, backends: Vec<(BackendSpec, Arc<ScriptedProvider>)>) -> ModelManager {
        let backends = backends
            .into_iter()
            .map(|(s, p)| (s, p as Arc<dyn LlmProvider>))
            .collect();
        ModelManager::new(pool.clone(), backends, tuning())
    }

    #[tokio::test]
    async fn quota_failover_then_exhaustion() {
        let pool = store::in_memory().await.unwrap();
        let a = Arc::new(ScriptedProvider::repeating("a", DOC, 10));
        let b = Arc::new(ScriptedProvider::repeating("b", DOC, 10));
        let mut m = manager(
            &pool,
            vec![(BackendSpec::new("a", 1, 60, 2), a.clone()), (BackendSpec::new("b", 2, 60, 1), b.clone())],
        );

        for _ in 0..3 {
            m.complete(PromptKey::MemoryCompressor, "ctx").await.unwrap();
        }
        assert_eq!((a.calls(), b.calls()), (2, 1));
        assert!(matches!(
            m.complete(PromptKey::MemoryCompressor, "ctx").await,
            Err(ModelError::AllModelsExhausted)
        ));
        assert_eq!((a.calls(), b.calls()), (2, 1));

        let stored = store::state::get(&pool, "model_quota_a").await.unwrap().unwrap();
        assert!(stored.contains("\"used_today\":2"));
    }

    #[tokio::test]
    async fn rate_limited_backend_is_skipped_and_restored() {
        let pool = store::in_memory().await.unwrap();
        let a = Arc::new(ScriptedProvider::new("a", vec![Err(LlmError::QuotaExhausted)]));
        let b = Arc::new(ScriptedProvider::repeating("b", DOC, 1));
        let mut m = manager(
            &pool,
            vec![(BackendSpec::new("a", 1, 60, 100), a.clone()), (BackendSpec::new("b", 2, 60, 100), b.clone())],
        );
        let v = m.complete(PromptKey::MemoryCompressor, "ctx").await.unwrap();
        assert_eq!(v["lesson"], "ok");
        assert_eq!(a.calls(), 1);

        let mut fresh = manager(
            &pool,
            vec![
                (BackendSpec::new("a", 1, 60, 100), Arc::new(ScriptedProvider::repeating("a", DOC, 1))),
                (BackendSpec::new("b", 2, 60, 100), Arc::new(ScriptedProvider::repeating("b", DOC, 1))),
            ],
        );
        fresh.restore().await.unwrap();
        let usage = fresh.usage();
        assert!(usage[0].3, "exhaustion restored");
        assert_eq!(usage[1].1, 1, "usage restored");
    }

    #[tokio::test]
    async fn overload_retries_same_backend() {
        let pool = store::in_memory().await.unwrap();
        let a = Arc::new(ScriptedProvider::new(
            "a",
            vec![Err(LlmError::Overloaded), Err(LlmError::Overloaded), Ok(DOC.into())],
        ));
        let mut m = manager(&pool, vec![(BackendSpec::new("a", 1, 60, 100), a.clone())]);
        m.complete(PromptKey::MemoryCompressor, "ctx").await.unwrap();
        assert_eq!(a.calls(), 3);
    }

    #[tokio::test]
    async fn lower_ranked_backends_get_two_attempts() {
        let pool = store::in_memory().await.unwrap();
        let hard = |n: &str| Arc::new(ScriptedProvider::new(n, vec![Err(LlmError::RequestFailed("400".into()))]));
        let c = Arc::new(ScriptedProvider::new("c", vec![Err(LlmError::Overloaded); 5]));
        let mut m = manager(
            &pool,
            vec![
                (BackendSpec::new("a", 1, 60, 100), hard("a")),
                (BackendSpec::new("b", 2, 60, 100), hard("b")),
                (BackendSpec::new("c", 3, 60, 100), c.clone()),
            ],
        );
        let err = m.complete(PromptKey::MemoryCompressor, "ctx").await.unwrap_err();
        assert!(matches!(err, ModelError::AllModelsFailed { .. }));
        assert_eq!(c.calls(), 2);
    }

    #[tokio::test]
    async fn unparsable_response_abandons_backend() {
        let pool = store::in_memory().await.unwrap();
        let a = Arc::new(ScriptedProvider::repeating("a", "I'd rather not.", 3));
        let b = Arc::new(ScriptedProvider::repeating("b", DOC, 1));
        let mut m = manager(
            &pool,
            vec![(BackendSpec::new("a", 1, 60, 100), a.clone()), (BackendSpec::new("b", 2, 60, 100), b.clone())],
        );
        m.complete(PromptKey::MemoryCompressor, "ctx").await.unwrap();
        assert_eq!((a.calls(), b.calls()), (1, 1));
        assert_eq!(m.usage()[0].1, 0);
    }

    #[tokio::test]
    async fn rpm_limited_pool_cools_down_once() {
        let pool = store::in_memory().await.unwrap();
        let a = Arc::new(ScriptedProvider::repeating("a", DOC, 5));
        let mut m = manager(&pool, vec![(BackendSpec::new("a", 1, 1, 100), a.clone())]);
        m.complete(PromptKey::MemoryCompressor, "ctx").await.unwrap();
        let started = Instant::now();
        let err = m.complete(PromptKey::MemoryCompressor, "ctx").await.unwrap_err();
        assert!(matches!(err, ModelError::AllModelsExhausted));
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn day_rollover_resets_and_clears_persisted_state() {
        let pool = store::in_memory().await.unwrap();
        let a = Arc::new(ScriptedProvider::new("a", vec![Err(LlmError::QuotaExhausted)]));
        let mut m = manager(&pool, vec![(BackendSpec::new("a", 1, 60, 100), a)]);
        assert!(m.complete(PromptKey::MemoryCompressor, "ctx").await.is_err());
        assert!(m.usage()[0].3);

        let rolled = m.roll_over_if_needed(Utc::now() + chrono::Duration::days(2)).await.unwrap();
        assert!(rolled);
        assert!(!m.usage()[0].3);
        assert!(store::state::list_prefix(&pool, "model_").await.unwrap().is_empty());
    }

    #[test]
    fn backoff_is_capped() {
        let t = ManagerTuning {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(8),
            ..tuning()
        };
        assert_eq!(t.backoff(1), Duration::from_secs(2));
        assert_eq!(t.backoff(2), Duration::from_secs(4));
        assert_eq!(t.backoff(5), Duration::from_secs(8));
    }
}
