use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    BenchParameters, ConfigError, ConsensusParameters, MempoolParameters, NodeParameters,
};

#[derive(Debug, Clone, Parser)]
pub struct Options {
    /// Testbed description (credentials, ports, repository, hosts).
    #[clap(long, global = true, default_value = "settings.json")]
    pub settings: PathBuf,

    /// Local benchmark directory holding generated files, logs and results.
    #[clap(long, global = true, default_value = ".")]
    pub workspace: String,

    /// Maximum number of hosts contacted at the same time.
    #[clap(long, global = true, default_value = "64")]
    pub concurrency: usize,

    /// Filter logs using this string, rather than the `RUST_LOG` environment variable.
    #[clap(long, global = true)]
    pub log_filter: Option<String>,

    /// Disable colours in the logs.
    #[clap(long, global = true)]
    pub no_colour: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Install the toolchain and clone the repository on every host
    Install,
    /// Stop every node and client on every host
    Kill {
        /// Also remove the remote log directories.
        #[clap(long)]
        delete_logs: bool,
    },
    /// Run a benchmark sweep on the testbed
    Remote(RemoteArgs),
    /// Compute a report from the logs already in the local workspace
    Logs {
        #[clap(long, default_value = "0")]
        faults: usize,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RemoteArgs {
    /// Number of nodes left unbooted at every point.
    #[clap(long, default_value = "0")]
    pub faults: usize,
    #[clap(long, default_value = "4", value_delimiter = ',')]
    pub nodes: Vec<usize>,
    /// Total offered load in transactions per second.
    #[clap(long, default_value = "10000", value_delimiter = ',')]
    pub rate: Vec<u64>,
    /// Transaction size in bytes.
    #[clap(long, default_value = "512")]
    pub tx_size: usize,
    /// Seconds of measured load per run.
    #[clap(long, default_value = "20")]
    pub duration: u64,
    #[clap(long, default_value = "1")]
    pub runs: usize,

    /// Read node parameters from this json file instead of the flags below.
    #[clap(long)]
    pub node_parameters: Option<String>,
    #[clap(long, default_value = "1000")]
    pub timeout_delay: u64,
    #[clap(long, default_value = "10000")]
    pub sync_retry_delay: u64,
    #[clap(long, default_value = "50")]
    pub gc_depth: u64,
    #[clap(long, default_value = "5000")]
    pub mempool_sync_retry_delay: u64,
    #[clap(long, default_value = "3")]
    pub sync_retry_nodes: u64,
    #[clap(long, default_value = "15000")]
    pub batch_size: u64,
    #[clap(long, default_value = "10")]
    pub max_batch_delay: u64,

    /// Run the nodes with extra verbosity.
    #[clap(long)]
    pub debug: bool,
}

impl RemoteArgs {
    pub fn bench_parameters(&self) -> Result<BenchParameters, ConfigError> {
        BenchParameters::new(
            self.faults,
            self.nodes.clone(),
            self.rate.clone(),
            self.tx_size,
            self.duration,
            self.runs,
        )
    }

    pub async fn node_parameters(&self) -> crate::Result<NodeParameters> {
        if let Some(path) = &self.node_parameters {
            return NodeParameters::from_file(path).await;
        }
        Ok(NodeParameters::new(
            ConsensusParameters {
                timeout_delay: self.timeout_delay,
                sync_retry_delay: self.sync_retry_delay,
            },
            MempoolParameters {
                gc_depth: self.gc_depth,
                sync_retry_delay: self.mempool_sync_retry_delay,
                sync_retry_nodes: self.sync_retry_nodes,
                batch_size: self.batch_size,
                max_batch_delay: self.max_batch_delay,
            },
        )?)
    }
}
