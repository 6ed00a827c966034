use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no log parser configured")]
    Missing,
    #[error("failed to start log parser: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("log parser failed: {0}")]
    Failed(String),
}

/// Turns the logs of one run into a result report.
#[async_trait]
pub trait LogParser: Send + Sync {
    async fn process(&self, logs_dir: &Path, faults: usize) -> Result<String, ParseError>;
}

/// Hands the logs to an external parser command and keeps its standard output.
///
/// The command is called as `<command> --logs <dir> --faults <n>`.
#[derive(Debug, Clone)]
pub struct CommandParser {
    command: Option<String>,
}

impl CommandParser {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl LogParser for CommandParser {
    async fn process(&self, logs_dir: &Path, faults: usize) -> Result<String, ParseError> {
        let command = self.command.as_deref().ok_or(ParseError::Missing)?;
        let command = format!(
            "{} --logs {} --faults {}",
            command,
            logs_dir.display(),
            faults
        );
        debug!(command, "Parsing logs");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(ParseError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
