//! Subprocess invocation for kubectl, helm, kustomize and mutagen.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;

use crate::error::{DeployError, Result};

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Formats the failure with both stderr and stdout for debugging.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        match (stderr.is_empty(), stdout.is_empty()) {
            (true, true) => format!("Command failed with exit code {}", self.exit_code),
            (true, false) => stdout.to_string(),
            (false, true) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stderr, stdout),
        }
    }
}

/// A tool binary plus arguments and environment applied to every call.
#[derive(Debug, Clone)]
pub struct Tool {
    program: PathBuf,
    base_args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
}

impl Tool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Adds an argument passed before the per-call arguments.
    pub fn with_base_arg(mut self, arg: impl Into<String>) -> Self {
        self.base_args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Human-readable command line, used in error messages.
    pub fn describe(&self, args: &[String]) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.base_args.iter().cloned());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }

    /// Runs the tool and captures its output. Non-zero exits are not errors here.
    ///
    /// The child is killed if `timeout` expires.
    pub async fn run(
        &self,
        args: &[String],
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput> {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.base_args)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        log::debug!("Running {}", self.describe(args));

        let mut child = cmd.spawn().map_err(|e| DeployError::ChildProcess {
            command: self.describe(args),
            exit_code: -1,
            stderr: format!("failed to spawn: {}", e),
            stdout: String::new(),
        })?;

        // Stdin is written from its own task so the timeout covers it.
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.as_bytes().to_vec();
                Some(tokio::spawn(async move {
                    pipe.write_all(&input).await?;
                    pipe.shutdown().await
                }))
            }
            _ => None,
        };

        let wait = async {
            let output = child.wait_with_output().await?;
            if let Some(handle) = writer {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::debug!("{} did not read all of its input: {}", self.program.display(), e)
                    }
                    Err(e) => log::debug!("stdin writer for {} failed: {}", self.program.display(), e),
                }
            }
            Ok::<_, DeployError>(output)
        };
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                DeployError::Timeout {
                    operation: self.describe(args),
                    seconds: limit.as_secs(),
                }
            })??,
            None => wait.await?,
        };

        Ok(ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Runs the tool and returns stdout, failing on a non-zero exit.
    pub async fn exec(
        &self,
        args: &[String],
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let output = self.run(args, stdin, timeout).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(DeployError::ChildProcess {
                command: self.describe(args),
                exit_code: output.exit_code,
                stderr: output.error_text(),
                stdout: output.stdout,
            })
        }
    }
}

/// Converts string slices into owned arguments.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
