//! Command execution abstraction
//!
//! Every external tool invocation (adb, emulator) goes through
//! [`CommandExecutor`], so tests can script device behavior without any
//! Android tooling installed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[must_use]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Combined output for error messages.
    #[must_use]
    pub fn detail(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        }
    }
}

/// Trait for executing external commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion and capture its output.
    async fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command with a hard deadline; the process is killed on expiry.
    async fn run_with_timeout(
        &self,
        program: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Start a long-lived process (an emulator) and return its pid.
    async fn spawn(&self, program: &Path, args: &[&str]) -> Result<u32>;
}

/// Production executor backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to execute {}", program.display()))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_with_timeout(
        &self,
        program: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", program.display()))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output
                    .with_context(|| format!("failed to wait for {}", program.display()))?;
                Ok(CommandOutput {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            // kill_on_drop reaps the child when the future is dropped here.
            Err(_) => Err(anyhow!(
                "{} timed out after {}s",
                program.display(),
                timeout.as_secs()
            )),
        }
    }

    async fn spawn(&self, program: &Path, args: &[&str]) -> Result<u32> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", program.display()))?;

        child
            .id()
            .ok_or_else(|| anyhow!("{} exited before a pid was assigned", program.display()))
    }
}

pub mod mock {
    //! Scripted executor for tests.

    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{CommandExecutor, CommandOutput};

    type ScriptedResponses = HashMap<String, VecDeque<Result<CommandOutput, String>>>;

    /// Mock implementation of [`CommandExecutor`].
    ///
    /// Responses are keyed by `"<program-basename> <args joined>"`. Multiple
    /// responses for one key are consumed in order, the last one sticking.
    /// In permissive mode unmatched commands succeed with empty output.
    #[derive(Clone, Default)]
    pub struct MockCommandExecutor {
        responses: Arc<Mutex<ScriptedResponses>>,
        permissive: bool,
        call_history: Arc<Mutex<Vec<String>>>,
        next_pid: Arc<AtomicU32>,
    }

    impl MockCommandExecutor {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Unmatched commands succeed instead of erroring. Useful when a test
        /// only cares about a handful of commands in a long sequence.
        #[must_use]
        pub fn permissive() -> Self {
            Self {
                permissive: true,
                ..Self::default()
            }
        }

        fn key(program: &str, args: &[&str]) -> String {
            format!("{program} {}", args.join(" "))
        }

        #[must_use]
        pub fn with_success(self, program: &str, args: &[&str], stdout: &str) -> Self {
            self.push_response(program, args, Ok(CommandOutput::ok(stdout)));
            self
        }

        #[must_use]
        pub fn with_exit_failure(self, program: &str, args: &[&str], stderr: &str) -> Self {
            self.push_response(program, args, Ok(CommandOutput::failed(stderr)));
            self
        }

        #[must_use]
        pub fn with_error(self, program: &str, args: &[&str], message: &str) -> Self {
            self.push_response(program, args, Err(message.to_string()));
            self
        }

        fn push_response(
            &self,
            program: &str,
            args: &[&str],
            response: Result<CommandOutput, String>,
        ) {
            self.responses
                .lock()
                .entry(Self::key(program, args))
                .or_default()
                .push_back(response);
        }

        /// Every command line this executor has seen, in call order.
        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.call_history.lock().clone()
        }

        /// Number of recorded calls whose command line contains `needle`.
        #[must_use]
        pub fn calls_containing(&self, needle: &str) -> usize {
            self.call_history
                .lock()
                .iter()
                .filter(|line| line.contains(needle))
                .count()
        }

        fn lookup(&self, program: &Path, args: &[&str]) -> Result<CommandOutput> {
            let basename = program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| program.to_string_lossy().into_owned());
            let key = Self::key(&basename, args);
            self.call_history.lock().push(key.clone());

            let mut responses = self.responses.lock();
            if let Some(queue) = responses.get_mut(&key) {
                let response = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
                if let Some(response) = response {
                    return response.map_err(|message| anyhow!(message));
                }
            }

            if self.permissive {
                Ok(CommandOutput::ok(""))
            } else {
                Err(anyhow!("no mock response for: {key}"))
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for MockCommandExecutor {
        async fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput> {
            self.lookup(program, args)
        }

        async fn run_with_timeout(
            &self,
            program: &Path,
            args: &[&str],
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.lookup(program, args)
        }

        async fn spawn(&self, program: &Path, args: &[&str]) -> Result<u32> {
            self.lookup(program, args)?;
            Ok(10_000 + self.next_pid.fetch_add(1, Ordering::Relaxed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockCommandExecutor;
    use super::*;

    #[tokio::test]
    async fn mock_returns_scripted_output() {
        let executor = MockCommandExecutor::new().with_success("adb", &["devices"], "ok\n");
        let output = executor
            .run(Path::new("/sdk/platform-tools/adb"), &["devices"])
            .await
            .expect("scripted response");
        assert!(output.success);
        assert_eq!(output.stdout, "ok\n");
        assert_eq!(executor.calls(), vec!["adb devices"]);
    }

    #[tokio::test]
    async fn mock_consumes_sequenced_responses() {
        let executor = MockCommandExecutor::new()
            .with_exit_failure("adb", &["x"], "transient")
            .with_success("adb", &["x"], "ok");

        let first = executor.run(Path::new("adb"), &["x"]).await.expect("run");
        assert!(!first.success);
        let second = executor.run(Path::new("adb"), &["x"]).await.expect("run");
        assert!(second.success);
        // Last response sticks.
        let third = executor.run(Path::new("adb"), &["x"]).await.expect("run");
        assert!(third.success);
    }

    #[tokio::test]
    async fn strict_mock_rejects_unscripted_commands() {
        let executor = MockCommandExecutor::new();
        assert!(executor.run(Path::new("adb"), &["oops"]).await.is_err());
        assert!(
            MockCommandExecutor::permissive()
                .run(Path::new("adb"), &["oops"])
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn system_executor_runs_real_commands() {
        let executor = SystemCommandExecutor;
        let output = executor
            .run(Path::new("echo"), &["hello"])
            .await
            .expect("echo should run");
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn system_executor_kills_on_timeout() {
        let executor = SystemCommandExecutor;
        let result = executor
            .run_with_timeout(Path::new("sleep"), &["5"], Duration::from_millis(50))
            .await;
        assert!(result.is_err());
    }
}
