//! Remote-shell contract used for guest cooperation, plus an implementation
//! backed by the system `ssh` binary.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;

/// A shell session bound to one guest.
///
/// `exec` runs a single command and resolves once the command finished or
/// the connection dropped. Callers bound it with their own timeout.
#[async_trait(?Send)]
pub trait ShellSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, SessionError>;
}

/// Result of a command that reached the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status reported by the guest; `None` when the connection dropped
    /// before a status was delivered.
    pub exit_status: Option<i32>,
    pub output: String,
}

impl ExecOutput {
    pub fn exited(status: i32, output: impl Into<String>) -> Self {
        Self {
            exit_status: Some(status),
            output: output.into(),
        }
    }

    pub fn disconnected(output: impl Into<String>) -> Self {
        Self {
            exit_status: None,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("failed to spawn `{program}`: {message}")]
    Spawn { program: String, message: String },
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session closed")]
    Closed,
}

/// Connection parameters for an SSH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub identity: Option<PathBuf>,
    pub options: Vec<String>,
}

impl SshTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: 22,
            identity: None,
            options: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity<P: Into<PathBuf>>(mut self, identity: P) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_option<S: Into<String>>(mut self, option: S) -> Self {
        self.options.push(option.into());
        self
    }

    /// Format as `user@host:port`.
    pub fn summary(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Runs each command as a fresh, non-interactive `ssh` invocation.
#[derive(Debug, Clone)]
pub struct SshSession {
    target: SshTarget,
    program: String,
}

impl SshSession {
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            program: String::from("ssh"),
        }
    }

    pub fn with_program<S: Into<String>>(mut self, program: S) -> Self {
        self.program = program.into();
        self
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn command(&self, remote: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        command.arg("-o");
        command.arg("BatchMode=yes");

        if let Some(identity) = self.target.identity.as_ref() {
            command.arg("-i");
            command.arg(identity);
        }

        for option in &self.target.options {
            command.arg("-o");
            command.arg(option);
        }

        command.arg("-p");
        command.arg(self.target.port.to_string());
        command.arg(format!("{}@{}", self.target.user, self.target.host));
        command.arg(remote);
        command
    }
}

#[async_trait(?Send)]
impl ShellSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, SessionError> {
        debug!("ssh {}: {command}", self.target.summary());
        let output = self
            .command(command)
            .output()
            .await
            .map_err(|err| SessionError::Spawn {
                program: self.program.clone(),
                message: err.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            // ssh reserves 255 for its own failures.
            Some(255) => classify_transport_failure(stderr),
            Some(code) => Ok(ExecOutput::exited(code, stdout)),
            None => Ok(ExecOutput::disconnected(stdout)),
        }
    }
}

fn classify_transport_failure(stderr: String) -> Result<ExecOutput, SessionError> {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("closed by remote host") || lowered.contains("connection reset") {
        Ok(ExecOutput::disconnected(stderr))
    } else if lowered.contains("permission denied") || lowered.contains("host key verification")
    {
        Err(SessionError::Auth(stderr))
    } else {
        Err(SessionError::Transport(stderr))
    }
}
