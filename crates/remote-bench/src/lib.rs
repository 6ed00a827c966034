use std::path::Path;

use tracing::{info, warn};

pub mod auth;
pub mod bench;
pub mod command;
pub mod config;
mod error;
pub mod hosts;
pub mod local;
pub mod logs;
mod options;
pub mod paths;
pub mod remote;
pub mod settings;
pub mod transfer;

pub use bench::{Bench, Summary, Testbed};
pub use error::{Context, Error, Result};
pub use options::{Command, Options, RemoteArgs};

use crate::{
    logs::{CommandParser, LogParser},
    settings::Settings,
};

pub async fn run(options: Options) -> Result<()> {
    info!(?options, "Starting");
    let settings = Settings::load(&options.settings).context("Failed to load settings")?;

    if let Command::Logs { faults } = options.command {
        let logs = paths::PathMaker::new(options.workspace.as_str()).logs_path();
        let report = CommandParser::new(settings.parser.clone())
            .process(Path::new(&logs), faults)
            .await?;
        println!("{}", report);
        return Ok(());
    }

    let bench = Bench::connect(settings, &options.workspace, options.concurrency).await?;
    match options.command {
        Command::Install => bench.install().await,
        Command::Kill { delete_logs } => bench.kill(&[], delete_logs).await,
        Command::Remote(args) => {
            let parameters = args
                .bench_parameters()
                .context("Invalid nodes or bench parameters")?;
            let node = args
                .node_parameters()
                .await
                .context("Invalid nodes or bench parameters")?;
            tokio::select! {
                summary = bench.run(&parameters, &node, args.debug) => {
                    summary?;
                    Ok(())
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping every node");
                    bench.kill(&[], false).await
                }
            }
        }
        Command::Logs { .. } => Ok(()),
    }
}
