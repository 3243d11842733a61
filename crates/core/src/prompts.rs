//! Prompt templates, one per pipeline stage.
//!
//! Every template asks for a single YAML document; the stage that owns the
//! key knows the expected fields.

/// Identifies which template a model call uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKey {
    Planner,
    Reviewer,
    Reflector,
    MemoryCompressor,
    Conversation,
    SelfPatch,
}

impl PromptKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Reviewer => "reviewer",
            Self::Reflector => "reflector",
            Self::MemoryCompressor => "memory_compressor",
            Self::Conversation => "conversation",
            Self::SelfPatch => "self_patch",
        }
    }

    pub fn template(self) -> &'static str {
        match self {
            Self::Planner => PLANNER,
            Self::Reviewer => REVIEWER,
            Self::Reflector => REFLECTOR,
            Self::MemoryCompressor => MEMORY_COMPRESSOR,
            Self::Conversation => CONVERSATION,
            Self::SelfPatch => SELF_PATCH,
        }
    }
}

/// Full prompt text sent to a backend.
pub fn render(key: PromptKey, context: &str) -> String {
    format!("{}\n\n---\n\nCONTEXT:\n{}", key.template().trim(), context)
}

const PLANNER: &str = r#"
You are a planning assistant for an autonomous agent. Produce plans whose steps
create real artifacts: files, reports, scripts, analysis.

RULES:
1. Break the mission into shell steps that each produce a tangible output.
2. Prefer multi-line commands using `cat << 'EOF'` heredocs over bare echo.
3. Use the EXECUTION_PATH from the context for every file operation.
4. Use only commands from the execution policy listed in the context.
5. Output ONLY one YAML document in this shape:

```yaml
spec: |
  One paragraph describing what this plan achieves.
steps:
  - title: "Create system inventory report"
    command: |
      cat << 'EOF' > ./data/inventory.md
      # Inventory
      Files: $(ls -1 ./data | wc -l)
      EOF
    timeout_sec: 60
    allow_net: false
```
"#;

const REVIEWER: &str = r#"
You are the code reviewer and security officer for an autonomous agent. Assess
every planned step for risk before it runs.

RULES:
1. For each step give a risk score from 0.0 (harmless) to 1.0 (dangerous), a
   category and one line of reasoning.
2. Reading any file is allowed. Pipes and redirects are allowed.
3. Only reject truly destructive commands: rm -rf /, sudo, chmod 777, package
   managers that alter the system.
4. If a step is risky but well intended, rewrite it to be safer.
5. Output ONLY one YAML document in this shape:

```yaml
approved_steps:
  - title: "Step title"
    command: "safe command"
    timeout_sec: 60
    allow_net: false
    risk:
      score: 0.1
      category: "safe"
      reasoning: "read-only listing"
rejected: []
summary: |
  Review summary.
```
"#;

const REFLECTOR: &str = r#"
You reflect on one completed work cycle of an autonomous agent.

RULES:
1. Analyze the PLAN, REVIEW and EXECUTION sections of the context.
2. If the reviewer rejected steps, the key lesson must address why.
3. The next action must directly address the key lesson.
4. Write exactly three lines, each under 30 words.
5. Output ONLY one YAML document wrapped in a ```yaml fence:

```yaml
reflection: |
  KEY LESSON: ...
  AVOID: ...
  NEXT ACTION: ...
```
"#;

const MEMORY_COMPRESSOR: &str = r#"
You consolidate an agent's memories. You receive a list of recent observations
and reflections; synthesize them into a single lesson under 40 words that
captures the pattern connecting them.

Output ONLY one YAML document:

lesson: "Your concise lesson"
"#;

const CONVERSATION: &str = r#"
You are an autonomous agent that has received messages from its human operator.

RULES:
1. Respond only if the messages contain questions, requests or need clarification.
2. Keep responses under 100 words.
3. Acknowledge instructions or feedback briefly.
4. If asked about status, explain what you are currently doing.
5. If no response is needed, return null.

Output ONLY one YAML document:

response: "Your response"
# or
response: null
"#;

const SELF_PATCH: &str = r#"
You improve the autonomous agent system itself. You are given a recurring
failure pattern and the source of the file most likely responsible.

SECURITY RULES:
1. Never weaken, remove or bypass security checks or execution policies.
2. Policy denials are not bugs; improve planning instead of the executor.
3. Never modify run_steps.sh, exec_policy.json, Dockerfile.sandbox or the patch gate.

ANALYSIS RULES:
1. Decide whether this is a policy violation or a genuine bug.
2. Produce one exact-substring patch: old_code must appear exactly once in the file.
3. Provide a bash test script, run from the repository root, that exits 0 only
   when the fix works (for example `cargo test -p evoloop-core <filter>`).

Output ONLY one YAML document wrapped in a ```yaml fence:

```yaml
diagnosis: |
  What is wrong.
patch:
  file: "crates/core/src/pipeline/plan.rs"
  old_code: |
    exact code to replace
  new_code: |
    replacement code
test_script: |
  set -e
  cargo test -p evoloop-core
```
"#;
