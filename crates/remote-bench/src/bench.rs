use std::{
    fmt, io,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::{
    command::CommandMaker,
    config::{BenchParameters, Committee, Key, NodeParameters},
    error::{Context, Result},
    hosts::{all_hosts, select, InstanceManager},
    local::{Local, Shell},
    logs::{CommandParser, LogParser},
    paths::{basename, stem},
    remote::{fan_out, scatter, ExecError, Remote, SshRemote},
    settings::Settings,
    transfer::{download, download_url, encode, Fetch, HttpFetch},
};

/// Number of progress ticks while the benchmark is at steady state.
pub const STEADY_SLICES: u64 = 20;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Each client's share of the offered load, rounded up so the total is never below `rate`.
pub fn rate_share(rate: u64, committee_size: usize) -> u64 {
    let size = committee_size.max(1) as u64;
    rate / size + u64::from(rate % size != 0)
}

/// Time the nodes get to find each other before load is measured.
pub fn sync_wait(timeout_delay: u64) -> Duration {
    Duration::from_millis(2 * timeout_delay)
}

pub fn steady_slice(duration: u64) -> Duration {
    let total = duration * 1000;
    Duration::from_millis(total / STEADY_SLICES + u64::from(total % STEADY_SLICES != 0))
}

/// Where a single run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    LaunchingClients,
    LaunchingNodes,
    SyncWait,
    SteadyState,
    Teardown,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LaunchingClients => "launching clients",
            Self::LaunchingNodes => "launching nodes",
            Self::SyncWait => "sync wait",
            Self::SteadyState => "steady state",
            Self::Teardown => "teardown",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of a whole sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub completed: usize,
    pub failed: usize,
    /// Points dropped because their hosts could not be updated or configured.
    pub skipped: usize,
}

/// The collaborators a [`Bench`] drives.
pub struct Testbed {
    pub remote: Box<dyn Remote>,
    pub local: Box<dyn Local>,
    pub fetch: Box<dyn Fetch>,
    pub parser: Box<dyn LogParser>,
    pub manager: Box<dyn InstanceManager>,
}

/// Drives a fleet of hosts through install, deploy, run and log collection.
pub struct Bench {
    settings: Settings,
    testbed: Testbed,
    /// Commands and paths as seen from a host.
    remote_commands: CommandMaker,
    /// Commands and paths as seen from the driver.
    local_commands: CommandMaker,
    concurrency: usize,
}

impl Bench {
    /// Load credentials and wire up ssh, the local shell, http downloads and the log parser.
    pub async fn connect(settings: Settings, workspace: &str, concurrency: usize) -> Result<Self> {
        let credentials = settings
            .credentials()
            .await
            .context("Failed to load credentials")?;
        let testbed = Testbed {
            remote: Box::new(SshRemote::new(credentials)),
            local: Box::new(Shell),
            fetch: Box::new(HttpFetch::new(DOWNLOAD_TIMEOUT)?),
            parser: Box::new(CommandParser::new(settings.parser.clone())),
            manager: Box::new(settings.instance_manager()),
        };
        Self::new(settings, testbed, workspace, concurrency)
    }

    /// Driver commands run inside the workspace, so it is resolved to an absolute path first.
    pub fn new(
        settings: Settings,
        testbed: Testbed,
        workspace: &str,
        concurrency: usize,
    ) -> Result<Self> {
        let remote_commands =
            CommandMaker::new(settings.remote_workspace(), settings.is_elevated());
        let local_commands = CommandMaker::local(absolute(workspace)?);
        Ok(Self {
            settings,
            testbed,
            remote_commands,
            local_commands,
            concurrency: concurrency.max(1),
        })
    }

    fn hosts_or_all(&self, hosts: &[String]) -> Vec<String> {
        if hosts.is_empty() {
            all_hosts(&self.testbed.manager.hosts())
        } else {
            hosts.to_vec()
        }
    }

    /// Bootstrap every host of the fleet.
    pub async fn install(&self) -> Result<()> {
        info!("Installing rust and cloning the repo...");
        let hosts = all_hosts(&self.testbed.manager.hosts());
        let command = self
            .remote_commands
            .install(&self.settings.repo.url, &self.settings.repo_dir())?;
        fan_out(&*self.testbed.remote, &hosts, &command, self.concurrency)
            .await
            .context("Failed to install repo on testbed")?;
        info!("Initialized testbed of {} nodes", hosts.len());
        Ok(())
    }

    /// Stop every detached session on `hosts` (the whole fleet when empty).
    ///
    /// Safe to repeat: a host with nothing running still succeeds.
    pub async fn kill(&self, hosts: &[String], delete_logs: bool) -> Result<()> {
        let hosts = self.hosts_or_all(hosts);
        let delete = if delete_logs {
            self.remote_commands.clean_logs()
        } else {
            "true".to_owned()
        };
        let command = format!("{} && ({} || true)", delete, self.remote_commands.kill());
        debug!(hosts = hosts.len(), delete_logs, "Killing sessions");
        fan_out(&*self.testbed.remote, &hosts, &command, self.concurrency)
            .await
            .context("Failed to kill nodes")?;
        Ok(())
    }

    /// Launch `command` in a detached session named after `log_file`.
    async fn background_run(
        &self,
        host: &str,
        command: &str,
        log_file: &str,
    ) -> std::result::Result<(), ExecError> {
        let command = self
            .remote_commands
            .background(stem(log_file), command, log_file);
        let output = self.testbed.remote.run(host, &command).await?;
        if !output.stderr.trim().is_empty() {
            return Err(ExecError::Stderr {
                host: host.to_owned(),
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Bring each host's checkout to the configured branch and rebuild it.
    pub async fn update(&self, hosts: &[String]) -> Result<()> {
        info!(
            hosts = hosts.len(),
            branch = %self.settings.repo.branch,
            "Updating nodes"
        );
        let command = self
            .remote_commands
            .update(&self.settings.repo_dir(), &self.settings.repo.branch)?;
        fan_out(&*self.testbed.remote, hosts, &command, self.concurrency).await?;
        Ok(())
    }

    async fn run_local(&self, command: &str, cwd: &str) -> Result<()> {
        debug!(command, "Running on the driver");
        self.testbed.local.run(command, Path::new(cwd)).await?;
        Ok(())
    }

    /// Remove leftovers of previous runs from the driver's workspace.
    async fn clean_local_workspace(&self) -> Result<()> {
        let paths = self.local_commands.paths();
        let mut entries = fs::read_dir(paths.workspace()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".db-") {
                remove_dir(&entry.path()).await?;
            } else if name.starts_with('.') && name.ends_with(".json") {
                fs::remove_file(entry.path()).await?;
            }
        }
        fs::create_dir_all(paths.results_path()).await?;
        Ok(())
    }

    /// Generate keys, committee and parameters for `hosts` and push them out.
    pub async fn config(&self, hosts: &[String], node: &NodeParameters) -> Result<Committee> {
        info!(hosts = hosts.len(), "Generating configuration files...");
        let paths = self.local_commands.paths();
        let workspace = paths.workspace();

        self.clean_local_workspace().await?;
        self.run_local(&self.local_commands.compile(), &paths.node_crate_path())
            .await?;
        self.run_local(
            &self.local_commands.alias_binaries(&paths.binary_path())?,
            workspace,
        )
        .await?;

        let mut names = Vec::with_capacity(hosts.len());
        for i in 0..hosts.len() {
            let filename = paths.key_file(i);
            self.run_local(&self.local_commands.generate_key(&filename)?, workspace)
                .await?;
            names.push(Key::from_file(&filename).await?.name);
        }

        let ports = &self.settings.ports;
        let addresses = |port: u16| {
            hosts
                .iter()
                .map(|host| format!("{}:{}", host, port))
                .collect::<Vec<_>>()
        };
        let committee = Committee::new(
            &names,
            &addresses(ports.consensus),
            &addresses(ports.front),
            &addresses(ports.mempool),
        )?;
        committee.print(&paths.committee_file()).await?;
        node.print(&paths.parameters_file()).await?;

        let cleanup = format!("{} || true", self.remote_commands.cleanup());
        if let Err(error) = fan_out(&*self.testbed.remote, hosts, &cleanup, self.concurrency).await
        {
            warn!(%error, "Failed to clean up nodes, continuing");
        }

        let committee_upload = self.upload_command(&paths.committee_file()).await?;
        let parameters_upload = self.upload_command(&paths.parameters_file()).await?;
        let mut uploads = Vec::with_capacity(hosts.len());
        for i in 0..hosts.len() {
            uploads.push([
                committee_upload.clone(),
                self.upload_command(&paths.key_file(i)).await?,
                parameters_upload.clone(),
            ]);
        }

        let remote = &*self.testbed.remote;
        let total = hosts.len();
        scatter(hosts, self.concurrency, |i, host| {
            let commands = &uploads[i];
            async move {
                for command in commands {
                    remote.run(host, command).await?;
                }
                info!(done = i + 1, total, "Uploading config files");
                Ok::<_, ExecError>(())
            }
        })
        .await?;

        Ok(committee)
    }

    /// Command that recreates the driver's `local_file` in the remote workspace.
    async fn upload_command(&self, local_file: &str) -> Result<String> {
        let content = fs::read(local_file).await?;
        let remote_path = format!(
            "{}/{}",
            self.remote_commands.workspace().trim_end_matches('/'),
            basename(local_file)
        );
        Ok(self.remote_commands.upload(&encode(&content), &remote_path))
    }

    /// One benchmark run on the booted `hosts`, from a clean slate to teardown.
    pub async fn run_single(
        &self,
        hosts: &[String],
        rate: u64,
        bench: &BenchParameters,
        node: &NodeParameters,
        debug: bool,
    ) -> Result<()> {
        info!("Booting testbed...");
        let mut phase = Phase::Idle;
        debug!(%phase);

        self.kill(hosts, true).await?;

        let committee = Committee::load(&self.local_commands.paths().committee_file()).await?;
        let paths = self.remote_commands.paths();
        let addresses = hosts
            .iter()
            .map(|host| format!("{}:{}", host, self.settings.ports.front))
            .collect::<Vec<_>>();
        let share = rate_share(rate, committee.size());
        let timeout = node.timeout_delay();

        phase = Phase::LaunchingClients;
        debug!(%phase, rate_share = share);
        let clients = addresses
            .iter()
            .map(|address| {
                self.remote_commands
                    .run_client(address, bench.tx_size(), share, timeout, &addresses)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let client_logs = (0..hosts.len())
            .map(|i| paths.client_log_file(i))
            .collect::<Vec<_>>();
        scatter(hosts, self.concurrency, |i, host| {
            self.background_run(host, &clients[i], &client_logs[i])
        })
        .await?;

        phase = Phase::LaunchingNodes;
        debug!(%phase);
        let nodes = (0..hosts.len())
            .map(|i| {
                self.remote_commands.run_node(
                    &paths.key_file(i),
                    &paths.committee_file(),
                    &paths.db_path(i),
                    &paths.parameters_file(),
                    debug,
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let node_logs = (0..hosts.len())
            .map(|i| paths.node_log_file(i))
            .collect::<Vec<_>>();
        scatter(hosts, self.concurrency, |i, host| {
            self.background_run(host, &nodes[i], &node_logs[i])
        })
        .await?;

        phase = Phase::SyncWait;
        debug!(%phase);
        info!("Waiting for the nodes to synchronize...");
        tokio::time::sleep(sync_wait(timeout)).await;

        phase = Phase::SteadyState;
        debug!(%phase);
        let slice = steady_slice(bench.duration());
        for i in 0..STEADY_SLICES {
            tokio::time::sleep(slice).await;
            info!(
                done = i + 1,
                total = STEADY_SLICES,
                "Running benchmark ({} sec)",
                bench.duration()
            );
        }

        phase = Phase::Teardown;
        debug!(%phase);
        self.kill(hosts, false).await?;

        phase = Phase::Done;
        debug!(%phase);
        Ok(())
    }

    /// Copy each host's logs to the driver and turn them into a report.
    pub async fn logs(&self, hosts: &[String], faults: usize) -> Result<String> {
        let local_logs = self.local_commands.paths().logs_path();
        remove_dir(Path::new(&local_logs)).await?;
        fs::create_dir_all(&local_logs).await?;

        let downloaded = self.download_logs(hosts).await;
        // Also stops the file servers.
        self.kill(hosts, false).await?;
        downloaded?;

        info!("Parsing logs and computing performance...");
        Ok(self
            .testbed
            .parser
            .process(Path::new(&local_logs), faults)
            .await?)
    }

    async fn download_logs(&self, hosts: &[String]) -> Result<()> {
        let remote_paths = self.remote_commands.paths();
        let local_paths = self.local_commands.paths();
        let served = remote_paths.logs_path();
        let port = self.settings.ports.miniserve;
        let server = self.remote_commands.miniserve(&served, port);

        for (i, host) in hosts.iter().enumerate() {
            self.background_run(host, &server, &remote_paths.file_server_log())
                .await?;
            for (remote_file, local_file) in [
                (remote_paths.node_log_file(i), local_paths.node_log_file(i)),
                (remote_paths.client_log_file(i), local_paths.client_log_file(i)),
            ] {
                let url = download_url(host, port, &served, &remote_file)?;
                debug!(%url, local_file = %local_file, "Downloading");
                download(&*self.testbed.fetch, &url, &local_file).await?;
            }
            info!(done = i + 1, total = hosts.len(), "Downloading logs");
        }
        Ok(())
    }

    async fn deploy(&self, hosts: &[String], node: &NodeParameters) -> Result<()> {
        self.update(hosts).await.context("Failed to update nodes")?;
        self.config(hosts, node).await.context("Failed to configure nodes")?;
        Ok(())
    }

    async fn run_and_collect(
        &self,
        hosts: &[String],
        nodes: usize,
        rate: u64,
        bench: &BenchParameters,
        node: &NodeParameters,
        debug: bool,
    ) -> Result<()> {
        self.run_single(hosts, rate, bench, node, debug).await?;
        let report = self.logs(hosts, bench.faults()).await?;
        let path = self
            .local_commands
            .paths()
            .result_file(bench.faults(), nodes, rate, bench.tx_size());
        append(&path, &report).await?;
        info!(path = %path, "Saved results");
        Ok(())
    }

    /// Run every (nodes, rate) point of the sweep `bench.runs()` times.
    ///
    /// A failing point or run is logged and skipped. An undersized fleet ends the sweep
    /// early, and a configuration error aborts it.
    pub async fn run(
        &self,
        bench: &BenchParameters,
        node: &NodeParameters,
        debug: bool,
    ) -> Result<Summary> {
        info!("Starting remote benchmark");
        let mut summary = Summary::default();

        let selected = select(&self.testbed.manager.hosts(), bench.max_nodes());
        if selected.is_empty() {
            warn!(
                required = bench.max_nodes(),
                "There are not enough instances available"
            );
            return Ok(summary);
        }

        for &n in bench.nodes() {
            for &rate in bench.rate() {
                info!(
                    nodes = n,
                    faults = bench.faults(),
                    rate,
                    tx_size = bench.tx_size(),
                    duration = bench.duration(),
                    "Running benchmark"
                );
                let hosts = &selected[..n];
                if let Err(error) = self.deploy(hosts, node).await {
                    if error.is_configuration() {
                        return Err(error);
                    }
                    error!(%error, nodes = n, rate, "Skipping benchmark point");
                    summary.skipped += 1;
                    continue;
                }

                // Faulty nodes are simply never booted.
                let booted = &hosts[..n - bench.faults()];
                for run in 0..bench.runs() {
                    info!(run = run + 1, runs = bench.runs(), "Starting run");
                    match self
                        .run_and_collect(booted, n, rate, bench, node, debug)
                        .await
                    {
                        Ok(()) => summary.completed += 1,
                        Err(error) => {
                            if let Err(kill) = self.kill(booted, false).await {
                                warn!(error = %kill, "Failed to stop nodes after a failed run");
                            }
                            let error = error.context("Benchmark failed");
                            error!(%error, run = run + 1, "Run failed");
                            summary.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Benchmark sweep finished"
        );
        Ok(summary)
    }
}

fn absolute(workspace: &str) -> io::Result<String> {
    let path = Path::new(workspace);
    let path = if path.is_absolute() {
        path.to_owned()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(path
        .components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned())
}

async fn remove_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn append(path: &str, report: &str) -> io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(report.as_bytes()).await?;
    file.flush().await
}
