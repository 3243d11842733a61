use serde::{Deserialize, Serialize};

// ── Persisted records ──────────────────────────────────────────

/// The goal the loop works toward. Exactly one core mission is seeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mission {
    pub id: i64,
    pub text: String,
    pub is_core: bool,
    pub is_complete: bool,
}

/// Lifecycle of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopStatus {
    Running,
    Completed,
    Failed,
}

impl LoopStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One row of the `loops` table. Created at iteration start, filled in by
/// each stage, terminal once completed or failed.
#[derive(Debug, Clone)]
pub struct LoopRecord {
    pub id: i64,
    pub status: LoopStatus,
    pub plan_spec: Option<String>,
    pub review_summary: Option<String>,
    pub execution_report: Option<String>,
    pub reflection: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryKind {
    Reflection,
    Observation,
    /// Synthesized from a batch of raw memories. Never compressed again.
    CompressedLesson,
}

impl MemoryKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Reflection => "reflection",
            Self::Observation => "observation",
            Self::CompressedLesson => "compressed_lesson",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "reflection" => Some(Self::Reflection),
            "observation" => Some(Self::Observation),
            "compressed_lesson" => Some(Self::CompressedLesson),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Memory {
    pub id: i64,
    pub kind: MemoryKind,
    pub content: String,
    pub loop_id: Option<i64>,
}

/// Aggregated execution failures keyed by the first token of the command.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub id: i64,
    pub command_pattern: String,
    pub command_example: String,
    pub error_message: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSource {
    Human,
    Agent,
}

impl MessageSource {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// Operator ↔ agent conversation entry.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub source: MessageSource,
    pub content: String,
    pub is_read: bool,
}

/// Persisted copy of one of the loop's own source files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub id: i64,
    pub filepath: String,
    pub content: String,
    pub version: i64,
}

// ── Pipeline documents ─────────────────────────────────────────

fn default_timeout_sec() -> u64 {
    60
}

/// One shell step proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub title: String,
    #[serde(alias = "bash")]
    pub command: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub allow_net: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, alias = "spec_md")]
    pub spec: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Stand-in used when the planner could not produce anything.
    pub fn placeholder() -> Self {
        Self { spec: "Failed to generate a plan.".into(), steps: Vec::new() }
    }
}

/// A step annotated by the reviewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewedStep {
    pub step: PlanStep,
    /// Always within `[0, 1]`; a missing or invalid score reads as 1.0.
    pub risk_score: f64,
    pub risk_category: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default)]
pub struct Review {
    pub steps: Vec<ReviewedStep>,
    pub rejected: usize,
    pub summary: String,
}

/// Result of one executed step as reported by the shell runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "bash")]
    pub command: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, alias = "success")]
    pub succeeded: Vec<StepOutcome>,
    #[serde(default)]
    pub failed: Vec<StepOutcome>,
    #[serde(default, alias = "final_report_md")]
    pub report: String,
}

impl ExecutionResult {
    pub fn nothing_executed() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            report: "No steps were approved for execution.".into(),
        }
    }

    /// Single synthetic failure, used when the runner itself misbehaves.
    pub fn runner_failure(title: &str, stderr: impl Into<String>, report: &str) -> Self {
        Self {
            succeeded: Vec::new(),
            failed: vec![StepOutcome {
                title: title.into(),
                command: title.into(),
                stdout: String::new(),
                stderr: stderr.into(),
            }],
            report: report.into(),
        }
    }
}
