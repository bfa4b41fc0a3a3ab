//! Per-serial ADB handle
//!
//! The only way the control plane talks to a device. Every call runs the
//! external tool with a hard deadline and a bounded number of retries on
//! transient failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use super::executor::CommandExecutor;

/// Keycode for the HOME key, used when parking a device after a run.
const KEYCODE_HOME: &str = "3";

/// Error fragments that make a retry pointless.
const TERMINAL_ERROR_PATTERNS: [&str; 4] = [
    "not found",
    "unauthorized",
    "offline",
    "no devices/emulators found",
];

/// Options for a [`AdbHandle::shell`] invocation.
#[derive(Debug, Clone, Copy)]
pub struct ShellOpts {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for ShellOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 2,
        }
    }
}

impl ShellOpts {
    #[must_use]
    pub fn quick() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 0,
        }
    }
}

/// Connection state reported by `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Unauthorized,
    Offline,
    Other(String),
}

impl DeviceState {
    fn parse(raw: &str) -> Self {
        match raw {
            "device" => DeviceState::Device,
            "unauthorized" => DeviceState::Unauthorized,
            "offline" => DeviceState::Offline,
            other => DeviceState::Other(other.to_string()),
        }
    }
}

/// A device visible to `adb devices`.
#[derive(Debug, Clone)]
pub struct ConnectedDevice {
    pub serial: String,
    pub state: DeviceState,
}

/// Parse the output of `adb devices`.
#[must_use]
pub fn parse_device_list(output: &str) -> Vec<ConnectedDevice> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(ConnectedDevice {
                serial: serial.to_string(),
                state: DeviceState::parse(state),
            })
        })
        .collect()
}

/// List devices currently visible to the ADB server.
pub async fn list_connected_devices(
    executor: &Arc<dyn CommandExecutor>,
    adb_path: &PathBuf,
) -> Result<Vec<ConnectedDevice>> {
    let output = executor
        .run_with_timeout(adb_path, &["devices"], Duration::from_secs(10))
        .await
        .context("adb devices failed")?;
    if !output.success {
        bail!("adb devices exited with failure: {}", output.detail());
    }
    Ok(parse_device_list(&output.stdout))
}

/// Reliable shell/install/uninstall/health-check against one serial.
#[derive(Clone)]
pub struct AdbHandle {
    adb_path: PathBuf,
    serial: String,
    executor: Arc<dyn CommandExecutor>,
}

impl AdbHandle {
    #[must_use]
    pub fn new(
        adb_path: PathBuf,
        serial: impl Into<String>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            adb_path,
            serial: serial.into(),
            executor,
        }
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Run `adb -s <serial> shell <args>` with timeout and bounded retries.
    ///
    /// Transient failures (non-zero exit without a terminal error pattern)
    /// are retried up to `opts.retries` additional times with a linearly
    /// growing delay. Terminal errors bail immediately.
    pub async fn shell(&self, args: &[&str], opts: ShellOpts) -> Result<String> {
        let mut full_args = vec!["-s", self.serial.as_str(), "shell"];
        full_args.extend_from_slice(args);

        let mut last_error = None;
        for attempt in 0..=opts.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                debug!(serial = %self.serial, attempt, "retrying adb shell");
            }

            match self
                .executor
                .run_with_timeout(&self.adb_path, &full_args, opts.timeout)
                .await
            {
                Ok(output) if output.success => return Ok(output.stdout),
                Ok(output) => {
                    let detail = output.detail();
                    if is_terminal_error(&detail) {
                        bail!("adb shell on {} failed: {detail}", self.serial);
                    }
                    last_error = Some(anyhow::anyhow!(
                        "adb shell on {} failed: {detail}",
                        self.serial
                    ));
                }
                Err(e) => {
                    last_error = Some(e.context(format!("adb shell on {}", self.serial)));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("adb shell on {} failed", self.serial)))
    }

    /// Install an APK (`adb install -r`).
    pub async fn install(&self, apk: &std::path::Path) -> Result<()> {
        let apk_str = apk.to_string_lossy();
        let args = ["-s", self.serial.as_str(), "install", "-r", apk_str.as_ref()];
        let output = self
            .executor
            .run_with_timeout(&self.adb_path, &args, Duration::from_secs(120))
            .await
            .context("adb install failed")?;
        if !output.success || !output.stdout.contains("Success") {
            bail!("install of {apk_str} failed: {}", output.detail());
        }
        Ok(())
    }

    pub async fn uninstall(&self, package: &str) -> Result<()> {
        let args = ["-s", self.serial.as_str(), "uninstall", package];
        let output = self
            .executor
            .run_with_timeout(&self.adb_path, &args, Duration::from_secs(60))
            .await
            .context("adb uninstall failed")?;
        if !output.success {
            bail!("uninstall of {package} failed: {}", output.detail());
        }
        Ok(())
    }

    /// Terminate an emulator through its console (`adb emu kill`).
    pub async fn emulator_kill(&self) -> Result<()> {
        let args = ["-s", self.serial.as_str(), "emu", "kill"];
        let output = self
            .executor
            .run_with_timeout(&self.adb_path, &args, Duration::from_secs(15))
            .await
            .context("adb emu kill failed")?;
        if !output.success {
            warn!(serial = %self.serial, "emu kill exited with failure: {}", output.detail());
        }
        Ok(())
    }

    /// Probe responsiveness: a benign shell echo within a short deadline.
    pub async fn health_check(&self) -> bool {
        match self.shell(&["echo", "ok"], ShellOpts::quick()).await {
            Ok(output) => output.trim() == "ok",
            Err(e) => {
                debug!(serial = %self.serial, error = %e, "health check failed");
                false
            }
        }
    }

    pub async fn get_prop(&self, name: &str) -> Result<String> {
        let output = self.shell(&["getprop", name], ShellOpts::quick()).await?;
        Ok(output.trim().to_string())
    }

    pub async fn force_stop(&self, package: &str) -> Result<()> {
        self.shell(&["am", "force-stop", package], ShellOpts::default())
            .await
            .map(|_| ())
    }

    /// Clear app data (`pm clear`). The command prints `Success` on the
    /// stdout of the shell, not in the exit code.
    pub async fn clear_package_data(&self, package: &str) -> Result<()> {
        let output = self
            .shell(&["pm", "clear", package], ShellOpts::default())
            .await?;
        if !output.contains("Success") {
            bail!("pm clear {package} failed: {}", output.trim());
        }
        Ok(())
    }

    pub async fn press_home(&self) -> Result<()> {
        self.shell(&["input", "keyevent", KEYCODE_HOME], ShellOpts::quick())
            .await
            .map(|_| ())
    }

    pub async fn is_package_installed(&self, package: &str) -> Result<bool> {
        let output = self
            .shell(&["pm", "path", package], ShellOpts::default())
            .await;
        match output {
            Ok(stdout) => Ok(stdout.contains("package:")),
            // `pm path` exits non-zero for unknown packages on some images.
            Err(_) => Ok(false),
        }
    }

    pub async fn list_packages(&self) -> Result<Vec<String>> {
        let output = self
            .shell(&["pm", "list", "packages"], ShellOpts::default())
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| line.strip_prefix("package:"))
            .map(|name| name.trim().to_string())
            .collect())
    }

    /// Requested runtime permissions, parsed from `dumpsys package`.
    pub async fn requested_permissions(&self, package: &str) -> Result<Vec<String>> {
        let output = self
            .shell(&["dumpsys", "package", package], ShellOpts::default())
            .await?;
        let mut permissions = Vec::new();
        for line in output.lines() {
            let trimmed = line.trim();
            if let Some(name) = trimmed.strip_suffix(": granted=false") {
                if name.starts_with("android.permission.") {
                    permissions.push(name.to_string());
                }
            } else if trimmed.starts_with("android.permission.") {
                let name = trimmed.split(':').next().unwrap_or(trimmed).trim();
                permissions.push(name.to_string());
            }
        }
        permissions.dedup();
        Ok(permissions)
    }

    pub async fn grant_permission(&self, package: &str, permission: &str) -> Result<()> {
        self.shell(&["pm", "grant", package, permission], ShellOpts::quick())
            .await
            .map(|_| ())
    }

    /// Launch an app's main activity through the monkey launcher intent.
    pub async fn monkey_launch(&self, package: &str) -> Result<()> {
        let output = self
            .shell(
                &[
                    "monkey",
                    "-p",
                    package,
                    "-c",
                    "android.intent.category.LAUNCHER",
                    "1",
                ],
                ShellOpts::default(),
            )
            .await?;
        if output.contains("No activities found") {
            bail!("monkey launch found no launcher activity for {package}");
        }
        Ok(())
    }

    /// Whether the package currently owns the resumed activity.
    pub async fn is_package_in_foreground(&self, package: &str) -> Result<bool> {
        let output = self
            .shell(
                &["dumpsys", "activity", "activities"],
                ShellOpts::default(),
            )
            .await?;
        Ok(output
            .lines()
            .filter(|line| {
                line.contains("mResumedActivity") || line.contains("ResumedActivity:")
            })
            .any(|line| line.contains(package)))
    }
}

fn is_terminal_error(detail: &str) -> bool {
    let lowered = detail.to_lowercase();
    TERMINAL_ERROR_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::super::executor::mock::MockCommandExecutor;
    use super::*;

    fn handle(executor: MockCommandExecutor) -> AdbHandle {
        AdbHandle::new(
            PathBuf::from("adb"),
            "emulator-5554",
            Arc::new(executor),
        )
    }

    #[tokio::test]
    async fn shell_retries_transient_failures() {
        let executor = MockCommandExecutor::new()
            .with_exit_failure("adb", &["-s", "emulator-5554", "shell", "echo", "hi"], "flaky")
            .with_success("adb", &["-s", "emulator-5554", "shell", "echo", "hi"], "hi\n");
        let mock = executor.clone();

        let output = handle(executor)
            .shell(
                &["echo", "hi"],
                ShellOpts {
                    timeout: Duration::from_secs(1),
                    retries: 2,
                },
            )
            .await
            .expect("second attempt succeeds");
        assert_eq!(output, "hi\n");
        assert_eq!(mock.calls_containing("echo hi"), 2);
    }

    #[tokio::test]
    async fn shell_does_not_retry_terminal_errors() {
        let executor = MockCommandExecutor::new().with_exit_failure(
            "adb",
            &["-s", "emulator-5554", "shell", "echo", "hi"],
            "device 'emulator-5554' not found",
        );
        let mock = executor.clone();

        let result = handle(executor)
            .shell(
                &["echo", "hi"],
                ShellOpts {
                    timeout: Duration::from_secs(1),
                    retries: 3,
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(mock.calls_containing("echo hi"), 1);
    }

    #[tokio::test]
    async fn health_check_requires_echo_roundtrip() {
        let healthy = MockCommandExecutor::new().with_success(
            "adb",
            &["-s", "emulator-5554", "shell", "echo", "ok"],
            "ok\n",
        );
        assert!(handle(healthy).health_check().await);

        let wedged = MockCommandExecutor::new().with_success(
            "adb",
            &["-s", "emulator-5554", "shell", "echo", "ok"],
            "garbage",
        );
        assert!(!handle(wedged).health_check().await);
    }

    #[tokio::test]
    async fn install_requires_success_marker() {
        let executor = MockCommandExecutor::new().with_success(
            "adb",
            &["-s", "emulator-5554", "install", "-r", "/tmp/app.apk"],
            "Failure [INSTALL_FAILED_OLDER_SDK]",
        );
        let result = handle(executor)
            .install(std::path::Path::new("/tmp/app.apk"))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn parses_device_list() {
        let output = "List of devices attached\nemulator-5554\tdevice product:sdk\nR5CT102\tunauthorized\n\n";
        let devices = parse_device_list(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].state, DeviceState::Device);
        assert_eq!(devices[1].state, DeviceState::Unauthorized);
    }

    #[tokio::test]
    async fn lists_installed_packages() {
        let executor = MockCommandExecutor::new().with_success(
            "adb",
            &["-s", "emulator-5554", "shell", "pm", "list", "packages"],
            "package:com.example.app\npackage:com.android.settings\n",
        );
        let packages = handle(executor).list_packages().await.expect("list");
        assert_eq!(packages, vec!["com.example.app", "com.android.settings"]);
    }
}
