use std::future::Future;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::Credentials;

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::Output> for Output {
    fn from(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start command for {host}: {source}")]
    Spawn {
        host: String,
        source: std::io::Error,
    },
    #[error("command on {host} exited with {code:?}: {stderr}")]
    Failed {
        host: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("command on {host} wrote to stderr: {stderr}")]
    Stderr { host: String, stderr: String },
}

impl ExecError {
    pub fn host(&self) -> &str {
        match self {
            Self::Spawn { host, .. } | Self::Failed { host, .. } | Self::Stderr { host, .. } => {
                host
            }
        }
    }

    /// The part of the error a person wants to read, without the host prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Spawn { source, .. } => source.to_string(),
            Self::Failed { stderr, code, .. } => {
                if stderr.trim().is_empty() {
                    format!("exited with {:?}", code)
                } else {
                    stderr.trim().to_owned()
                }
            }
            Self::Stderr { stderr, .. } => stderr.trim().to_owned(),
        }
    }
}

/// One or more hosts in a fan-out batch failed.
///
/// Carries a single representative failure (the last host in batch order) rather
/// than every message, which is usually the same error repeated.
#[derive(Debug, Error)]
#[error("{host}: {message} ({failed} of {total} hosts failed)")]
pub struct GroupError {
    pub host: String,
    pub message: String,
    pub failed: usize,
    pub total: usize,
}

/// Runs a shell command on a host and waits for it to finish.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn run(&self, host: &str, command: &str) -> Result<Output, ExecError>;
}

/// Runs remote commands through the system `ssh` client.
pub struct SshRemote {
    credentials: Credentials,
}

impl SshRemote {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Remote for SshRemote {
    async fn run(&self, host: &str, command: &str) -> Result<Output, ExecError> {
        let output = self
            .credentials
            .connection(host)
            .command(command)
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                host: host.to_owned(),
                source,
            })?;
        let output = Output::from(output);
        if output.success() {
            Ok(output)
        } else {
            Err(ExecError::Failed {
                host: host.to_owned(),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

/// Run `f` for every host with at most `concurrency` in flight, then join.
///
/// The whole batch always completes before any failure is reported; results are
/// returned in host order.
pub async fn scatter<'a, H, F, Fut, T>(
    hosts: &'a [H],
    concurrency: usize,
    f: F,
) -> Result<Vec<T>, GroupError>
where
    H: 'a,
    F: Fn(usize, &'a H) -> Fut,
    Fut: Future<Output = Result<T, ExecError>>,
{
    let results = stream::iter(hosts.iter().enumerate())
        .map(|(i, host)| f(i, host))
        .buffered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let total = results.len();
    let mut values = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(error) => {
                warn!(host = error.host(), %error, "Host failed");
                failures.push(error);
            }
        }
    }
    match failures.pop() {
        None => Ok(values),
        Some(last) => Err(GroupError {
            host: last.host().to_owned(),
            message: last.message(),
            failed: failures.len() + 1,
            total,
        }),
    }
}

/// Run the same command on every host.
pub async fn fan_out<R: Remote + ?Sized>(
    remote: &R,
    hosts: &[String],
    command: &str,
    concurrency: usize,
) -> Result<Vec<Output>, GroupError> {
    debug!(hosts = hosts.len(), command, "Fanning out");
    scatter(hosts, concurrency, |_, host| remote.run(host, command)).await
}
