use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::remote::{ExecError, Output};

const LOCALHOST: &str = "localhost";

/// Runs commands on the driver machine.
#[async_trait]
pub trait Local: Send + Sync {
    async fn run(&self, command: &str, cwd: &Path) -> Result<Output, ExecError>;
}

/// Runs commands through `sh -c`, failing on a non-zero exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Shell;

#[async_trait]
impl Local for Shell {
    async fn run(&self, command: &str, cwd: &Path) -> Result<Output, ExecError> {
        debug!(command, ?cwd, "Running local command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                host: LOCALHOST.to_owned(),
                source,
            })?;
        let output = Output::from(output);
        if output.success() {
            Ok(output)
        } else {
            Err(ExecError::Failed {
                host: LOCALHOST.to_owned(),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}
