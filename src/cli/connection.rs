//! Per-session connection to the assistant CLI.
//!
//! The orchestrator talks to the CLI only through the [`CliConnection`]
//! trait so the whole turn pipeline can be driven by fakes in tests.
//! Exactly one connection exists per session; connections are never
//! shared or migrated between sessions.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::cli::{CliEvent, CliProcess, CliProcessBuilder, SpawnError, DEFAULT_CHANNEL_BUFFER};
use crate::config::ConductorConfig;
use crate::session::PromptOptions;

/// Default timeout for the connection liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for graceful process termination on cancel.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for connection operations.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to spawn CLI process: {0}")]
    Spawn(#[from] SpawnError),
    #[error("CLI process has no stdout")]
    NoStdout,
    #[error("CLI process has no stdin")]
    NoStdin,
    #[error("No running CLI process")]
    NotRunning,
    #[error("Connection probe timed out")]
    ProbeTimeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful connection check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// CLI version string, when reported.
    pub version: Option<String>,
}

/// Status snapshot surfaced to the host UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Whether the CLI binary answered the last probe.
    pub connected: bool,
    /// CLI version from the last probe.
    pub version: Option<String>,
    /// Model in use, from config or the last system init event.
    pub model: Option<String>,
    /// How the CLI is being executed (binary name or script path).
    pub execution_method: String,
}

/// Boundary to one external CLI run per session.
#[async_trait]
pub trait CliConnection: Send {
    /// Start a turn: spawn or address the CLI with the prompt and return
    /// the ordered event stream for that turn.
    async fn send_prompt(
        &mut self,
        prompt: &str,
        options: &PromptOptions,
    ) -> Result<mpsc::Receiver<CliEvent>, ConnectionError>;

    /// Cancel the in-flight turn, terminating the underlying process.
    async fn cancel(&mut self) -> Result<(), ConnectionError>;

    /// Send user input over the legacy single-channel resume path.
    async fn send_user_input(&mut self, text: &str) -> Result<(), ConnectionError>;

    /// Whether a CLI process is currently running for this session.
    fn is_running(&mut self) -> bool;

    /// Probe the CLI binary for liveness and version.
    async fn check_connection(&mut self) -> Result<ConnectionInfo, ConnectionError>;
}

/// Creates connections, one per session.
pub trait ConnectionFactory: Send {
    /// Build a fresh connection for a new session.
    fn create(&self) -> Box<dyn CliConnection>;

    /// How the CLI is executed, for the status snapshot.
    fn execution_method(&self) -> String;
}

/// Process-backed connection spawning one CLI process per turn.
pub struct ProcessConnection {
    binary: String,
    probe_timeout: Duration,
    process: Option<CliProcess>,
    stdin: Option<tokio::process::ChildStdin>,
}

impl ProcessConnection {
    /// Create a connection using the given CLI binary.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            probe_timeout: PROBE_TIMEOUT,
            process: None,
            stdin: None,
        }
    }

    /// Override the liveness-probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

#[async_trait]
impl CliConnection for ProcessConnection {
    async fn send_prompt(
        &mut self,
        prompt: &str,
        options: &PromptOptions,
    ) -> Result<mpsc::Receiver<CliEvent>, ConnectionError> {
        // A still-running previous turn is terminated before the new one.
        if self.is_running() {
            self.cancel().await?;
        }

        let builder = CliProcessBuilder::new(prompt).with_options(options);
        let mut process = CliProcess::spawn(&self.binary, &builder)?;
        let stdout = process.take_stdout().ok_or(ConnectionError::NoStdout)?;
        self.stdin = process.take_stdin();
        self.process = Some(process);

        Ok(crate::cli::StreamParser::into_channel(
            stdout,
            DEFAULT_CHANNEL_BUFFER,
        ))
    }

    async fn cancel(&mut self) -> Result<(), ConnectionError> {
        self.stdin = None;
        if let Some(mut process) = self.process.take() {
            process.graceful_terminate(TERMINATE_TIMEOUT).await?;
        }
        Ok(())
    }

    async fn send_user_input(&mut self, text: &str) -> Result<(), ConnectionError> {
        let stdin = self.stdin.as_mut().ok_or(ConnectionError::NoStdin)?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        // id() stays Some for an exited-but-unreaped child; try_wait
        // reaps and reports the exit.
        self.process
            .as_mut()
            .is_some_and(|p| matches!(p.try_wait(), Ok(None)))
    }

    async fn check_connection(&mut self) -> Result<ConnectionInfo, ConnectionError> {
        let probe = tokio::process::Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output();

        let output = tokio::time::timeout(self.probe_timeout, probe)
            .await
            .map_err(|_| ConnectionError::ProbeTimeout)?
            .map_err(|e| ConnectionError::Spawn(SpawnError::Io(e)))?;

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(ConnectionInfo {
            version: (!version.is_empty()).then_some(version),
        })
    }
}

/// Factory producing [`ProcessConnection`]s for one binary.
pub struct ProcessConnectionFactory {
    binary: String,
    probe_timeout: Duration,
}

impl ProcessConnectionFactory {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// Build a factory from the loaded configuration, picking up the
    /// CLI binary and the probe timeout.
    #[must_use]
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            binary: config.cli.binary.clone(),
            probe_timeout: config.timeouts.probe(),
        }
    }
}

impl ConnectionFactory for ProcessConnectionFactory {
    fn create(&self) -> Box<dyn CliConnection> {
        Box::new(ProcessConnection::new(self.binary.clone()).with_probe_timeout(self.probe_timeout))
    }

    fn execution_method(&self) -> String {
        self.binary.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_user_input_without_process_fails() {
        let mut conn = ProcessConnection::new("claude");
        let err = conn.send_user_input("hello").await.unwrap_err();
        assert!(matches!(err, ConnectionError::NoStdin));
    }

    #[tokio::test]
    async fn cancel_without_process_is_noop() {
        let mut conn = ProcessConnection::new("claude");
        assert!(!conn.is_running());
        conn.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn check_connection_missing_binary_errors() {
        let mut conn = ProcessConnection::new("definitely-not-a-real-binary-1234");
        let err = conn.check_connection().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn check_connection_honors_probe_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mut conn = ProcessConnection::new(script.to_string_lossy().into_owned())
            .with_probe_timeout(Duration::from_millis(100));
        let err = conn.check_connection().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ProbeTimeout));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_is_not_running() {
        let mut conn = ProcessConnection::new("true");
        let _events = conn
            .send_prompt("hi", &PromptOptions::default())
            .await
            .unwrap();
        // Give the child time to exit; it is still unreaped at this point.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!conn.is_running());
    }
}
