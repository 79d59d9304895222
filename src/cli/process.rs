//! Assistant CLI process spawning and control.
//!
//! A builder maps prompt options onto CLI flags; the spawned process
//! exposes its stdio handles and supports graceful termination.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::session::PromptOptions;

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary was not found.
    #[error("CLI binary not found")]
    NotFound,
    /// Permission denied when spawning.
    #[error("Permission denied")]
    PermissionDenied,
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// Builder for configuring assistant CLI process arguments.
#[derive(Debug, Clone, Default)]
pub struct CliProcessBuilder {
    prompt: String,
    model: Option<String>,
    allowed_tools: Vec<String>,
    disallowed_tools: Vec<String>,
    resume: Option<String>,
    max_turns: Option<u32>,
    system_prompt: Option<String>,
    working_dir: Option<PathBuf>,
}

impl CliProcessBuilder {
    /// Create a new builder with the given prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Apply a full set of prompt options.
    #[must_use]
    pub fn with_options(mut self, options: &PromptOptions) -> Self {
        self.model.clone_from(&options.model);
        self.allowed_tools.clone_from(&options.allowed_tools);
        self.disallowed_tools.clone_from(&options.disallowed_tools);
        self.resume.clone_from(&options.resume);
        self.max_turns = options.max_turns;
        self.system_prompt.clone_from(&options.system_prompt);
        self.working_dir.clone_from(&options.working_dir);
        self
    }

    /// Resume an existing CLI run.
    #[must_use]
    pub fn resume(mut self, token: impl Into<String>) -> Self {
        self.resume = Some(token.into());
        self
    }

    /// Set the working directory for the CLI process.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Get the prompt.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Build the command-line arguments.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }

        if !self.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(self.disallowed_tools.join(","));
        }

        if let Some(token) = &self.resume {
            args.push("--resume".to_string());
            args.push(token.clone());
        }

        if let Some(turns) = self.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }

        if let Some(prompt) = &self.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }

        args
    }
}

/// A running assistant CLI process.
#[derive(Debug)]
pub struct CliProcess {
    child: Child,
}

impl CliProcess {
    /// Spawn a process using the given binary and builder configuration.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(binary: &str, builder: &CliProcessBuilder) -> Result<Self, SpawnError> {
        let args = builder.build_args();

        let mut cmd = Command::new(binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref dir) = builder.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(SpawnError::from_io)?;
        tracing::debug!(binary, pid = ?child.id(), "spawned CLI process");

        Ok(Self { child })
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the stdin handle (legacy single-channel resume).
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the process has exited without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Forcefully kill the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be sent.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }

    /// Attempt graceful termination with a timeout.
    ///
    /// On Unix, sends SIGTERM first, then SIGKILL after the timeout.
    /// On other platforms, falls back to immediate kill.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn graceful_terminate(&mut self, timeout: Duration) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            self.graceful_terminate_unix(timeout).await
        }

        #[cfg(not(unix))]
        {
            let _ = timeout;
            self.kill().await
        }
    }

    #[cfg(unix)]
    async fn graceful_terminate_unix(&mut self, timeout: Duration) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.id() {
            let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
            let _ = kill(nix_pid, Signal::SIGTERM);

            let wait_result = tokio::time::timeout(timeout, self.child.wait()).await;

            match wait_result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    // Timeout elapsed, force kill
                    self.child.kill().await
                }
            }
        } else {
            // Process already exited
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_minimal() {
        let builder = CliProcessBuilder::new("hello");
        let args = builder.build_args();
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "hello");
        assert!(args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn build_args_with_full_options() {
        let options = PromptOptions {
            model: Some("claude-sonnet".to_string()),
            max_turns: Some(8),
            allowed_tools: vec!["Read".to_string(), "Edit".to_string()],
            disallowed_tools: vec!["Bash".to_string()],
            resume: Some("token-1".to_string()),
            system_prompt: Some("be terse".to_string()),
            ..Default::default()
        };
        let args = CliProcessBuilder::new("task").with_options(&options).build_args();

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--model") + 1], "claude-sonnet");
        assert_eq!(args[pos("--allowedTools") + 1], "Read,Edit");
        assert_eq!(args[pos("--disallowedTools") + 1], "Bash");
        assert_eq!(args[pos("--resume") + 1], "token-1");
        assert_eq!(args[pos("--max-turns") + 1], "8");
        assert_eq!(args[pos("--system-prompt") + 1], "be terse");
    }

    #[test]
    fn spawn_missing_binary_classified() {
        let builder = CliProcessBuilder::new("x");
        let err = CliProcess::spawn("definitely-not-a-real-binary-1234", &builder).unwrap_err();
        assert!(matches!(err, SpawnError::NotFound));
    }
}
