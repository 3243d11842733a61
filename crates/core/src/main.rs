use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use evoloop_core::config::{self, InfraCfg, LoopCfg, SandboxKind};
use evoloop_core::evolve::{DockerSandbox, PatchSandbox, ProcessSandbox};
use evoloop_core::model::{ManagerTuning, ModelManager};
use evoloop_core::pipeline::execute::ScriptRunner;
use evoloop_core::runtime::{LoopScheduler, ShutdownGuard};
use evoloop_core::store;
use evoloop_llm::provider::LlmProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    evoloop_core::init_tracing()?;
    let infra = InfraCfg::from_env();

    ensure_db_dir(&infra.database_url)?;
    let pool = store::connect(&infra.database_url)
        .await
        .with_context(|| format!("durable store unreachable at {}", infra.database_url))?;

    let mut args = std::env::args().skip(1);
    if let Some(cmd) = args.next() {
        return match cmd.as_str() {
            "export-source" => {
                let dir = args.next().context("usage: evoloop export-source <dir>")?;
                let written = store::sources::export_to(&pool, Path::new(&dir)).await?;
                tracing::info!(files = written, dir = %dir, "source tree exported");
                Ok(())
            }
            other => anyhow::bail!("unknown command {other:?}; expected `export-source <dir>`"),
        };
    }

    let cfg = LoopCfg::load(&pool).await?;
    let mission = store::missions::ensure_core(&pool, &infra.mission).await?;
    tracing::info!(mission_id = mission.id, "core mission ready");

    let root = infra.source_root.clone();
    let tree = tokio::task::spawn_blocking(move || store::sources::collect_tree(&root)).await??;
    let seeded = store::sources::seed(&pool, &tree).await?;
    if seeded > 0 {
        tracing::info!(files = seeded, "source tree persisted");
    }

    let stale = store::loops::fail_stale_running(&pool).await?;
    if stale > 0 {
        tracing::warn!(count = stale, "marked loops interrupted by a restart as failed");
    }

    let mut backends: Vec<(config::BackendSpec, Arc<dyn LlmProvider>)> = Vec::new();
    for spec in config::default_backends(&infra) {
        match evoloop_llm::http::for_model(&spec.name) {
            Some(provider) => backends.push((spec, Arc::new(provider) as Arc<dyn LlmProvider>)),
            None => tracing::warn!(backend = %spec.name, "EVOLOOP_LLM_API_KEY not set, backend disabled"),
        }
    }
    let mut models = ModelManager::new(pool.clone(), backends, ManagerTuning::from_cfg(&cfg));
    models.restore().await?;

    let runner = Arc::new(ScriptRunner::new(infra.runner.clone(), PathBuf::from(&infra.execution_path)));
    let sandbox: Arc<dyn PatchSandbox> = match infra.sandbox {
        SandboxKind::Docker => Arc::new(DockerSandbox::new(infra.sandbox_image.clone(), cfg.sandbox_timeout())),
        SandboxKind::Process => Arc::new(ProcessSandbox::new(cfg.sandbox_timeout())),
    };

    let shutdown = ShutdownGuard::new();
    shutdown.spawn_signal_listener();

    let scheduler = Arc::new(LoopScheduler::new(pool.clone(), cfg, infra, models, runner, sandbox));
    scheduler.run(shutdown.token()).await;

    pool.close().await;
    Ok(())
}

/// Create the parent directory of a file-backed sqlite URL.
fn ensure_db_dir(url: &str) -> anyhow::Result<()> {
    let Some(path) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}
