use std::fmt::Write;
use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::config::{InfraCfg, LoopCfg};
use crate::store;
use crate::types::Message;

/// Everything the stages need to know about the world at iteration start.
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub mission: String,
    pub full_context: String,
    pub human_messages: Vec<Message>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecPolicy {
    #[serde(default)]
    allow_bins: Vec<String>,
    #[serde(default)]
    allow_net_bins: Vec<String>,
}

async fn allowed_commands(path: &Path) -> Option<Vec<String>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "execution policy unreadable");
            return None;
        }
    };
    match serde_json::from_str::<ExecPolicy>(&raw) {
        Ok(p) => Some(p.allow_bins.into_iter().chain(p.allow_net_bins).collect()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "execution policy is not valid JSON");
            None
        }
    }
}

/// Assemble the context for iteration `loop_id`. Read-only.
pub async fn build(pool: &SqlitePool, loop_id: i64, cfg: &LoopCfg, infra: &InfraCfg) -> anyhow::Result<LoopContext> {
    let mission = store::missions::active(pool)
        .await?
        .context("no active mission")?;
    let last = store::loops::last_before(pool, loop_id).await?;
    let memories = store::memories::recent(pool, cfg.context_memories).await?;
    let failures = store::failures::recent(pool, cfg.context_failures).await?;
    let human_messages = store::messages::unread_human(pool).await?;

    let mut ctx = String::new();

    if let Some(report) = last.and_then(|l| l.execution_report).filter(|r| r.contains("FAILED")) {
        ctx.push_str("## CRITICAL: PREVIOUS EXECUTION FAILED\n");
        ctx.push_str("The last plan failed with errors. Your primary goal is to fix these errors.\n\n");
        let _ = writeln!(ctx, "LAST EXECUTION REPORT:\n```\n{report}\n```\n");
        ctx.push_str("Analyze the errors above and adapt your approach to avoid the same failure.\n\n");
    }

    let _ = writeln!(ctx, "## Core Mission\n{}\n", mission.text);

    if !memories.is_empty() {
        ctx.push_str("## Recent Memories / Lessons\n");
        for m in &memories {
            let _ = writeln!(ctx, "- {}", m.content);
        }
        ctx.push('\n');
    }

    if !failures.is_empty() {
        ctx.push_str("## Recurring Failures to Avoid\n");
        for f in &failures {
            let _ = writeln!(ctx, "- '{}' failed {} times with error: {}", f.command_pattern, f.count, f.error_message);
        }
        ctx.push('\n');
    }

    if !human_messages.is_empty() {
        ctx.push_str("## New Messages from Human Operator\n");
        for m in &human_messages {
            let _ = writeln!(ctx, "- {}", m.content);
        }
        ctx.push('\n');
    }

    let path = &infra.execution_path;
    ctx.push_str("## System Environment\n");
    let _ = writeln!(ctx, "EXECUTION_PATH: {path}");
    let _ = writeln!(ctx, "All file operations MUST use the path '{path}'.");
    let _ = writeln!(ctx, "TIP: use 'ls -la {path}' to see files created so far.\n");

    if let Some(allowed) = allowed_commands(&infra.exec_policy).await {
        ctx.push_str("## System Execution Policy\n");
        let _ = writeln!(ctx, "You may only use the following commands: {}.", allowed.join(", "));
        ctx.push_str("All other commands will be rejected.\n\n");
    }

    Ok(LoopContext { mission: mission.text, full_context: ctx, human_messages })
}
