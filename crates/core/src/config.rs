use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::store;

/// Key prefix for tunables in `system_state`.
const CFG_PREFIX: &str = "cfg.";

/// Loop tunables. Loaded from `system_state` (keys prefixed `cfg.`) at startup.
/// First boot writes defaults; subsequent boots read existing values.
#[derive(Debug, Clone)]
pub struct LoopCfg {
    // scheduling
    pub loop_interval_ms: u64,
    pub self_patch_every: u64,

    // risk gate
    pub risk_threshold: f64,
    pub max_steps_per_loop: usize,

    // model manager
    pub min_call_interval_ms: u64,
    pub rpm_cooldown_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub quota_reset_hour_utc: u32,

    // memory
    pub memory_compression_threshold: i64,
    pub observation_max_chars: usize,
    pub context_memories: i64,
    pub context_failures: i64,

    // self-patch
    pub patch_min_failures: i64,
    pub sandbox_timeout_secs: u64,
}

impl Default for LoopCfg {
    fn default() -> Self {
        Self {
            loop_interval_ms: 5000,
            self_patch_every: 5,
            risk_threshold: 0.5,
            max_steps_per_loop: 5,
            min_call_interval_ms: 2000,
            rpm_cooldown_ms: 10_000,
            backoff_base_ms: 1000,
            backoff_cap_ms: 8000,
            quota_reset_hour_utc: 8,
            memory_compression_threshold: 20,
            observation_max_chars: 200,
            context_memories: 5,
            context_failures: 3,
            patch_min_failures: 3,
            sandbox_timeout_secs: 900,
        }
    }
}

impl LoopCfg {
    /// Load tunables, seeding any missing key with its default.
    pub async fn load(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        Self::default().seed(pool).await?;
        let rows = store::state::list_prefix(pool, CFG_PREFIX).await?;
        let map: HashMap<String, String> = rows
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(CFG_PREFIX).map(|k| (k.to_owned(), v)))
            .collect();
        Ok(Self::from_map(&map))
    }

    async fn seed(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        for (key, value) in self.to_entries() {
            store::state::put_if_absent(pool, &format!("{CFG_PREFIX}{key}"), &value).await?;
        }
        Ok(())
    }

    fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        Self {
            loop_interval_ms: get_or(m, "loop_interval_ms", d.loop_interval_ms),
            self_patch_every: get_or(m, "self_patch_every", d.self_patch_every),
            risk_threshold: get_or(m, "risk_threshold", d.risk_threshold),
            max_steps_per_loop: get_or(m, "max_steps_per_loop", d.max_steps_per_loop),
            min_call_interval_ms: get_or(m, "min_call_interval_ms", d.min_call_interval_ms),
            rpm_cooldown_ms: get_or(m, "rpm_cooldown_ms", d.rpm_cooldown_ms),
            backoff_base_ms: get_or(m, "backoff_base_ms", d.backoff_base_ms),
            backoff_cap_ms: get_or(m, "backoff_cap_ms", d.backoff_cap_ms),
            quota_reset_hour_utc: get_or(m, "quota_reset_hour_utc", d.quota_reset_hour_utc),
            memory_compression_threshold: get_or(m, "memory_compression_threshold", d.memory_compression_threshold),
            observation_max_chars: get_or(m, "observation_max_chars", d.observation_max_chars),
            context_memories: get_or(m, "context_memories", d.context_memories),
            context_failures: get_or(m, "context_failures", d.context_failures),
            patch_min_failures: get_or(m, "patch_min_failures", d.patch_min_failures),
            sandbox_timeout_secs: get_or(m, "sandbox_timeout_secs", d.sandbox_timeout_secs),
        }
    }

    fn to_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("loop_interval_ms", self.loop_interval_ms.to_string()),
            ("self_patch_every", self.self_patch_every.to_string()),
            ("risk_threshold", self.risk_threshold.to_string()),
            ("max_steps_per_loop", self.max_steps_per_loop.to_string()),
            ("min_call_interval_ms", self.min_call_interval_ms.to_string()),
            ("rpm_cooldown_ms", self.rpm_cooldown_ms.to_string()),
            ("backoff_base_ms", self.backoff_base_ms.to_string()),
            ("backoff_cap_ms", self.backoff_cap_ms.to_string()),
            ("quota_reset_hour_utc", self.quota_reset_hour_utc.to_string()),
            ("memory_compression_threshold", self.memory_compression_threshold.to_string()),
            ("observation_max_chars", self.observation_max_chars.to_string()),
            ("context_memories", self.context_memories.to_string()),
            ("context_failures", self.context_failures.to_string()),
            ("patch_min_failures", self.patch_min_failures.to_string()),
            ("sandbox_timeout_secs", self.sandbox_timeout_secs.to_string()),
        ]
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms.max(1))
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_secs)
    }
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Docker,
    Process,
}

/// Process wiring, read from the environment.
#[derive(Debug, Clone)]
pub struct InfraCfg {
    pub database_url: String,
    pub model_primary: Option<String>,
    pub model_secondary: Option<String>,
    pub runner: PathBuf,
    pub execution_path: String,
    pub exec_policy: PathBuf,
    pub source_root: PathBuf,
    pub sandbox: SandboxKind,
    pub sandbox_image: String,
    pub mission: String,
}

pub const DEFAULT_MISSION: &str = "Explore the execution environment, build useful tools and reports, \
and learn from every cycle to become more capable.";

impl Default for InfraCfg {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/evoloop.db".into(),
            model_primary: None,
            model_secondary: None,
            runner: PathBuf::from("./run_steps.sh"),
            execution_path: "./data".into(),
            exec_policy: PathBuf::from("./exec_policy.json"),
            source_root: PathBuf::from("."),
            sandbox: SandboxKind::Docker,
            sandbox_image: "rust:1-slim".into(),
            mission: DEFAULT_MISSION.into(),
        }
    }
}

impl InfraCfg {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let var = |k: &str| var(k).filter(|v| !v.trim().is_empty());
        Self {
            database_url: var("DATABASE_URL").unwrap_or(d.database_url),
            model_primary: var("EVOLOOP_MODEL_PRIMARY"),
            model_secondary: var("EVOLOOP_MODEL_SECONDARY"),
            runner: var("EVOLOOP_RUNNER").map(PathBuf::from).unwrap_or(d.runner),
            execution_path: var("EVOLOOP_EXECUTION_PATH").unwrap_or(d.execution_path),
            exec_policy: var("EVOLOOP_EXEC_POLICY").map(PathBuf::from).unwrap_or(d.exec_policy),
            source_root: var("EVOLOOP_SOURCE_ROOT").map(PathBuf::from).unwrap_or(d.source_root),
            sandbox: match var("EVOLOOP_SANDBOX").as_deref() {
                Some("process") => SandboxKind::Process,
                _ => SandboxKind::Docker,
            },
            sandbox_image: var("EVOLOOP_SANDBOX_IMAGE").unwrap_or(d.sandbox_image),
            mission: var("EVOLOOP_MISSION").unwrap_or(d.mission),
        }
    }
}

/// Static description of one backend in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub name: String,
    /// Lower ranks first.
    pub priority: u32,
    pub rpm: u32,
    pub daily_quota: u32,
}

impl BackendSpec {
    pub fn new(name: impl Into<String>, priority: u32, rpm: u32, daily_quota: u32) -> Self {
        Self { name: name.into(), priority, rpm, daily_quota }
    }
}

/// Default pool: `(model, priority, rpm, daily quota)`. The first two model
/// names can be overridden from the environment.
pub fn default_backends(infra: &InfraCfg) -> Vec<BackendSpec> {
    let primary = infra.model_primary.clone().unwrap_or_else(|| "gemini-2.5-pro".into());
    let secondary = infra.model_secondary.clone().unwrap_or_else(|| "gemini-2.5-flash".into());
    vec![
        BackendSpec::new(primary, 1, 5, 100),
        BackendSpec::new(secondary, 2, 10, 250),
        BackendSpec::new("gemini-2.5-flash-lite", 3, 15, 1000),
        BackendSpec::new("gemini-2.0-flash", 4, 15, 200),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_load_seeds_defaults_and_keeps_overrides() {
        let pool = store::in_memory().await.unwrap();
        store::state::put(&pool, "cfg.risk_threshold", "0.25").await.unwrap();
        store::state::put(&pool, "cfg.max_steps_per_loop", "lots").await.unwrap();

        let cfg = LoopCfg::load(&pool).await.unwrap();
        assert_eq!(cfg.risk_threshold, 0.25);
        // unparsable falls back to default
        assert_eq!(cfg.max_steps_per_loop, 5);
        assert_eq!(cfg.memory_compression_threshold, 20);

        let seeded = store::state::list_prefix(&pool, "cfg.").await.unwrap();
        assert_eq!(seeded.len(), LoopCfg::default().to_entries().len());
    }

    #[test]
    fn infra_reads_overrides_and_ignores_blanks() {
        let env: HashMap<&str, &str> = [
            ("EVOLOOP_SANDBOX", "process"),
            ("EVOLOOP_MODEL_PRIMARY", "claude-sonnet-4-6"),
            ("EVOLOOP_MISSION", "  "),
        ]
        .into_iter()
        .collect();
        let infra = InfraCfg::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(infra.sandbox, SandboxKind::Process);
        assert_eq!(infra.mission, DEFAULT_MISSION);
        assert_eq!(infra.database_url, "sqlite://data/evoloop.db");

        let pool = default_backends(&infra);
        assert_eq!(pool[0].name, "claude-sonnet-4-6");
        assert_eq!(pool.iter().map(|b| b.daily_quota).collect::<Vec<_>>(), vec![100, 250, 1000, 200]);
    }
}
