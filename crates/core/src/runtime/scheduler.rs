use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{InfraCfg, LoopCfg};
use crate::context;
use crate::conversation;
use crate::evolve::{PatchOutcome, PatchSandbox, SelfPatchEngine};
use crate::model::ModelManager;
use crate::pipeline::execute::{self, StepRunner};
use crate::pipeline::{memorize, plan, reflect, review};
use crate::store::activity::{ActivityLog, Level};
use crate::store::loops::{self, Field};
use crate::store::missions;

/// Reentrancy flag: at most one iteration holds it at a time.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight(Arc<AtomicBool>);

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another holder is active.
    pub fn try_acquire(&self) -> Option<FlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(Arc::clone(&self.0)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the flag when dropped, whichever way the iteration ends.
#[derive(Debug)]
pub struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous iteration was still active.
    Skipped,
    Completed(i64),
    /// `loop_id` is `None` when the loop row itself could not be created.
    Failed { loop_id: Option<i64>, error: String },
}

/// Drives plan → review → execute → reflect → memorize → evolve on a fixed
/// interval, one iteration at a time.
pub struct LoopScheduler {
    pool: SqlitePool,
    cfg: LoopCfg,
    infra: InfraCfg,
    models: Mutex<ModelManager>,
    runner: Arc<dyn StepRunner>,
    evolve: SelfPatchEngine,
    activity: ActivityLog,
    flight: SingleFlight,
    successes: AtomicU64,
}

impl LoopScheduler {
    pub fn new(
        pool: SqlitePool,
        cfg: LoopCfg,
        infra: InfraCfg,
        models: ModelManager,
        runner: Arc<dyn StepRunner>,
        sandbox: Arc<dyn PatchSandbox>,
    ) -> Self {
        let evolve = SelfPatchEngine::new(pool.clone(), sandbox, cfg.patch_min_failures);
        Self {
            activity: ActivityLog::new(pool.clone()),
            pool,
            cfg,
            infra,
            models: Mutex::new(models),
            runner,
            evolve,
            flight: SingleFlight::new(),
            successes: AtomicU64::new(0),
        }
    }

    /// Handle to the reentrancy flag, shared with this scheduler.
    pub fn flight(&self) -> SingleFlight {
        self.flight.clone()
    }

    /// Tick every `loop_interval` until `cancel` fires, then wait for the
    /// in-flight iteration to finish.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.cfg.loop_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<TickOutcome>> = None;

        tracing::info!(interval_ms = self.cfg.loop_interval_ms, "loop scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown signal received, leaving tick loop");
                    break;
                }
                _ = interval.tick() => {
                    let Some(guard) = self.flight.try_acquire() else {
                        tracing::debug!("previous iteration still active, tick skipped");
                        continue;
                    };
                    let this = Arc::clone(&self);
                    in_flight = Some(tokio::spawn(async move { this.iterate_with(guard).await }));
                }
            }
        }

        if let Some(handle) = in_flight.filter(|h| !h.is_finished()) {
            tracing::info!("waiting for in-flight iteration");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "iteration task aborted");
            }
        }
        tracing::info!("loop scheduler stopped");
    }

    /// Run one iteration now unless another is active.
    pub async fn tick(&self) -> TickOutcome {
        match self.flight.try_acquire() {
            Some(guard) => self.iterate_with(guard).await,
            None => {
                tracing::debug!("previous iteration still active, tick skipped");
                TickOutcome::Skipped
            }
        }
    }

    async fn iterate_with(&self, _guard: FlightGuard) -> TickOutcome {
        let loop_id = match self.start_loop().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "could not start loop");
                return TickOutcome::Failed { loop_id: None, error: e.to_string() };
            }
        };

        let span = tracing::info_span!("iteration", loop_id);
        match self.iterate(loop_id).instrument(span).await {
            Ok(()) => {
                if let Err(e) = loops::complete(&self.pool, loop_id).await {
                    tracing::error!(loop_id, error = %e, "could not mark loop completed");
                }
                self.activity.record(Some(loop_id), "Orchestrator", "Loop completed", None, Level::Success).await;
                tracing::info!(loop_id, "iteration completed");
                TickOutcome::Completed(loop_id)
            }
            Err(e) => {
                let error = format!("{e:#}");
                tracing::error!(loop_id, error = %error, "iteration failed");
                if let Err(e) = loops::fail(&self.pool, loop_id, &error).await {
                    tracing::error!(loop_id, error = %e, "could not mark loop failed");
                }
                self.activity
                    .record(Some(loop_id), "Orchestrator", "Loop failed", Some(json!({ "error": error })), Level::Error)
                    .await;
                TickOutcome::Failed { loop_id: Some(loop_id), error }
            }
        }
    }

    async fn start_loop(&self) -> Result<i64, sqlx::Error> {
        let mission = missions::active(&self.pool).await?;
        let id = loops::start(&self.pool, mission.map(|m| m.id)).await?;
        self.activity.record(Some(id), "Orchestrator", "Loop started", None, Level::Info).await;
        Ok(id)
    }

    async fn iterate(&self, loop_id: i64) -> anyhow::Result<()> {
        let pool = &self.pool;
        let cfg = &self.cfg;
        let mut models = self.models.lock().await;

        let ctx = context::build(pool, loop_id, cfg, &self.infra).await?;
        self.log(loop_id, "Orchestrator", "Context assembled", json!({ "unread_messages": ctx.human_messages.len() }), Level::Debug)
            .await;

        if !ctx.human_messages.is_empty() {
            if let Some(reply) = conversation::respond(pool, &mut models, &ctx).await {
                self.log(loop_id, "Conversation", "Replied to operator", json!({ "reply": reply }), Level::Info).await;
            }
        }

        let plan = plan::generate(&mut models, &ctx).await;
        loops::set(pool, loop_id, Field::PlanSpec, &plan.spec).await?;
        self.log(loop_id, "Planner", "Plan generated", json!({ "steps": plan.steps.len() }), Level::Info).await;

        let review = review::review(&mut models, &plan).await;
        let retained = review::filter_by_risk(&review.steps, cfg.risk_threshold, cfg.max_steps_per_loop);
        loops::set(pool, loop_id, Field::ReviewSummary, &review.summary).await?;
        self.log(
            loop_id,
            "Reviewer",
            "Plan reviewed",
            json!({
                "approved": review.steps.len(),
                "rejected": review.rejected,
                "retained": retained.len(),
                "threshold": cfg.risk_threshold,
            }),
            Level::Info,
        )
        .await;

        let result = execute::execute(self.runner.as_ref(), pool, &retained).await?;
        loops::set(pool, loop_id, Field::ExecutionReport, &result.report).await?;
        let level = if result.failed.is_empty() { Level::Success } else { Level::Warning };
        self.log(
            loop_id,
            "Executor",
            "Steps executed",
            json!({ "succeeded": result.succeeded.len(), "failed": result.failed.len() }),
            level,
        )
        .await;

        let reflection = reflect::reflect(&mut models, &plan, &review, &result).await;
        loops::set(pool, loop_id, Field::Reflection, &reflection).await?;
        self.log(loop_id, "Reflector", "Reflection written", json!({ "chars": reflection.len() }), Level::Info).await;

        let lesson = memorize::memorize(
            pool,
            &mut models,
            loop_id,
            &reflection,
            &result,
            cfg.observation_max_chars,
            cfg.memory_compression_threshold,
        )
        .await?;
        if let Some(lesson_id) = lesson {
            self.log(loop_id, "Memory", "Memories compressed", json!({ "lesson_id": lesson_id }), Level::Success).await;
        }

        let done = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
        if cfg.self_patch_every > 0 && done % cfg.self_patch_every == 0 {
            tracing::info!(iteration = done, "running self-patch check");
            let outcome = self.evolve.run_check(&mut models, Some(loop_id)).await?;
            if let PatchOutcome::Applied { file, version } = &outcome {
                tracing::warn!(%file, version, "source changed; an external restart picks it up");
            }
        }
        Ok(())
    }

    async fn log(&self, loop_id: i64, agent: &str, action: &str, details: serde_json::Value, level: Level) {
        self.activity.record(Some(loop_id), agent, action, Some(details), level).await;
    }
}
