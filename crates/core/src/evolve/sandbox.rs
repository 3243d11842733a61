use std::path::Path;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use super::patch::{Patch, PatchError, apply_exact};
use crate::store::sources::write_tree;
use crate::types::SourceFile;

/// Name of the test script inside the materialized tree.
pub const TEST_SCRIPT_NAME: &str = "patch_test.sh";
const DOCKERFILE_NAME: &str = "Dockerfile.sandbox";
const MAX_LOG_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub passed: bool,
    pub logs: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox io: {0}")]
    Io(#[from] std::io::Error),
    #[error("patched file {0} is not in the source tree")]
    MissingFile(String),
    #[error("patch does not apply: {0}")]
    Patch(#[from] PatchError),
    #[error("sandbox command failed: {0}")]
    Command(String),
    #[error("sandbox run exceeded {0}s")]
    Timeout(u64),
}

/// Runs a patch's self-test against a throwaway copy of the source tree.
/// Implementations must tear their environment down on every path.
#[async_trait]
pub trait PatchSandbox: Send + Sync {
    async fn run_test(&self, tree: &[SourceFile], patch: &Patch, test_script: &str)
    -> Result<TestOutcome, SandboxError>;
}

/// Write the full tree with `patch` applied plus the test script into a
/// fresh temp dir. The directory is removed when the returned guard drops.
pub fn materialize(tree: &[SourceFile], patch: &Patch, test_script: &str) -> Result<TempDir, SandboxError> {
    let target = tree
        .iter()
        .find(|f| f.filepath == patch.file)
        .ok_or_else(|| SandboxError::MissingFile(patch.file.clone()))?;
    let patched = apply_exact(&target.content, &patch.old_code, &patch.new_code)?;

    let dir = tempfile::Builder::new().prefix("evoloop-sandbox-").tempdir()?;
    write_tree(
        dir.path(),
        tree.iter().map(|f| {
            let content = if f.filepath == patch.file { patched.as_str() } else { f.content.as_str() };
            (f.filepath.as_str(), content)
        }),
    )?;
    std::fs::write(dir.path().join(TEST_SCRIPT_NAME), test_script)?;
    Ok(dir)
}

/// [`materialize`] on the blocking pool.
pub async fn materialize_off_runtime(
    tree: &[SourceFile],
    patch: &Patch,
    test_script: &str,
) -> Result<TempDir, SandboxError> {
    let (tree, patch, test_script) = (tree.to_vec(), patch.clone(), test_script.to_owned());
    tokio::task::spawn_blocking(move || materialize(&tree, &patch, &test_script))
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::other(e)))?
}

fn clip(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_LOG_BYTES {
        return text.into_owned();
    }
    let mut cut = text.len() - MAX_LOG_BYTES;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("[truncated]...{}", &text[cut..])
}

fn logs(output: &Output) -> String {
    format!("{}{}", clip(&output.stdout), clip(&output.stderr))
}

async fn run_bounded(cmd: &mut Command, limit: Duration) -> Result<Output, SandboxError> {
    match tokio::time::timeout(limit, cmd.kill_on_drop(true).output()).await {
        Ok(out) => Ok(out?),
        Err(_) => Err(SandboxError::Timeout(limit.as_secs())),
    }
}

/// Runs the test with `bash` directly in the temp dir. No isolation beyond
/// the throwaway directory; meant for hosts without docker.
pub struct ProcessSandbox {
    timeout: Duration,
}

impl ProcessSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PatchSandbox for ProcessSandbox {
    async fn run_test(
        &self,
        tree: &[SourceFile],
        patch: &Patch,
        test_script: &str,
    ) -> Result<TestOutcome, SandboxError> {
        let dir = materialize_off_runtime(tree, patch, test_script).await?;
        let output = run_bounded(
            Command::new("bash").arg(TEST_SCRIPT_NAME).current_dir(dir.path()),
            self.timeout,
        )
        .await?;
        Ok(TestOutcome { passed: output.status.success(), logs: logs(&output) })
    }
}

/// Builds a disposable image from the patched tree and runs the test in a
/// container with no network and bounded memory/cpu. Container and image
/// are force-removed afterwards whatever happened.
pub struct DockerSandbox {
    base_image: String,
    timeout: Duration,
    memory: String,
    cpus: String,
}

impl DockerSandbox {
    pub fn new(base_image: impl Into<String>, timeout: Duration) -> Self {
        Self { base_image: base_image.into(), timeout, memory: "1g".into(), cpus: "1.0".into() }
    }

    fn dockerfile(&self) -> String {
        format!(
            "FROM {}\nWORKDIR /app\nCOPY . .\nCMD [\"bash\", \"{TEST_SCRIPT_NAME}\"]\n",
            self.base_image
        )
    }

    async fn build_and_run(&self, dir: &Path, tag: &str, name: &str) -> Result<TestOutcome, SandboxError> {
        tokio::fs::write(dir.join(DOCKERFILE_NAME), self.dockerfile()).await?;
        let build = run_bounded(
            Command::new("docker")
                .args(["build", "-q", "-t", tag, "-f"])
                .arg(dir.join(DOCKERFILE_NAME))
                .arg(dir),
            self.timeout,
        )
        .await?;
        if !build.status.success() {
            return Err(SandboxError::Command(format!("docker build: {}", logs(&build).trim())));
        }
        let run = run_bounded(
            Command::new("docker").args([
                "run",
                "--name",
                name,
                "--network",
                "none",
                "--memory",
                self.memory.as_str(),
                "--cpus",
                self.cpus.as_str(),
                tag,
            ]),
            self.timeout,
        )
        .await?;
        Ok(TestOutcome { passed: run.status.success(), logs: logs(&run) })
    }

    async fn teardown(&self, tag: &str, name: &str) {
        for args in [["rm", "-f", name], ["rmi", "-f", tag]] {
            match Command::new("docker").args(args).output().await {
                Ok(out) if out.status.success() => {}
                Ok(out) => tracing::debug!(cmd = ?args, stderr = %clip(&out.stderr).trim(), "sandbox teardown step failed"),
                Err(e) => tracing::warn!(cmd = ?args, error = %e, "sandbox teardown step failed"),
            }
        }
    }
}

#[async_trait]
impl PatchSandbox for DockerSandbox {
    async fn run_test(
        &self,
        tree: &[SourceFile],
        patch: &Patch,
        test_script: &str,
    ) -> Result<TestOutcome, SandboxError> {
        let dir = materialize_off_runtime(tree, patch, test_script).await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let tag = format!("evoloop-sandbox:{id}");
        let name = format!("evoloop-test-{id}");
        tracing::info!(image = %tag, file = %patch.file, "running patch test in container");

        let outcome = self.build_and_run(dir.path(), &tag, &name).await;
        self.teardown(&tag, &name).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Vec<SourceFile> {
        vec![
            SourceFile { id: 1, filepath: "crates/core/src/a.rs".into(), content: "const N: u32 = 1;\n".into(), version: 1 },
            SourceFile { id: 2, filepath: "Cargo.toml".into(), content: "[workspace]\n".into(), version: 1 },
        ]
    }

    fn patch(old: &str) -> Patch {
        Patch { file: "crates/core/src/a.rs".into(), old_code: old.into(), new_code: "const N: u32 = 2;".into() }
    }

    #[test]
    fn materialized_tree_carries_the_patch() {
        let dir = materialize(&tree(), &patch("const N: u32 = 1;"), "exit 0").unwrap();
        let a = std::fs::read_to_string(dir.path().join("crates/core/src/a.rs")).unwrap();
        assert_eq!(a, "const N: u32 = 2;\n");
        assert!(dir.path().join("Cargo.toml").is_file());
        assert!(dir.path().join(TEST_SCRIPT_NAME).is_file());
    }

    #[tokio::test]
    async fn blocking_pool_materialization_matches_inline() {
        let dir = materialize_off_runtime(&tree(), &patch("const N: u32 = 1;"), "exit 0").await.unwrap();
        let a = tokio::fs::read_to_string(dir.path().join("crates/core/src/a.rs")).await.unwrap();
        assert_eq!(a, "const N: u32 = 2;\n");
        assert!(matches!(
            materialize_off_runtime(&tree(), &patch("const N: u32 = 9;"), "exit 0").await,
            Err(SandboxError::Patch(PatchError::NotFound))
        ));
    }

    #[test]
    fn non_applying_patch_never_materializes() {
        assert!(matches!(
            materialize(&tree(), &patch("const N: u32 = 9;"), "exit 0"),
            Err(SandboxError::Patch(PatchError::NotFound))
        ));
        let mut p = patch("x");
        p.file = "nope.rs".into();
        assert!(matches!(materialize(&tree(), &p, "exit 0"), Err(SandboxError::MissingFile(_))));
    }

    #[tokio::test]
    async fn process_sandbox_reports_exit_status_and_cleans_up() {
        let sandbox = ProcessSandbox::new(Duration::from_secs(10));
        let pass = sandbox
            .run_test(&tree(), &patch("const N: u32 = 1;"), "grep -q 'N: u32 = 2' crates/core/src/a.rs && echo ok")
            .await
            .unwrap();
        assert!(pass.passed);
        assert!(pass.logs.contains("ok"));

        let fail = sandbox
            .run_test(&tree(), &patch("const N: u32 = 1;"), "pwd; exit 1")
            .await
            .unwrap();
        assert!(!fail.passed);
        let workdir = std::path::PathBuf::from(fail.logs.lines().next().unwrap().trim());
        assert!(!workdir.exists(), "sandbox dir should be removed");
    }

    #[tokio::test]
    async fn process_sandbox_times_out() {
        let sandbox = ProcessSandbox::new(Duration::from_millis(200));
        let err = sandbox.run_test(&tree(), &patch("const N: u32 = 1;"), "sleep 5").await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[test]
    fn dockerfile_runs_the_test_script() {
        let d = DockerSandbox::new("rust:1-slim", Duration::from_secs(1));
        let text = d.dockerfile();
        assert!(text.starts_with("FROM rust:1-slim\n"));
        assert!(text.contains("CMD [\"bash\", \"patch_test.sh\"]"));
    }
}
