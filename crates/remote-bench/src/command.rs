use thiserror::Error;

use crate::paths::PathMaker;

/// Where rustup puts cargo-installed binaries for root on the hosts.
const ELEVATED_CARGO_BIN: &str = "/root/.cargo/bin";
/// Same for the login user; ssh sessions are not login shells so it is not on `PATH`.
const USER_CARGO_BIN: &str = "$HOME/.cargo/bin";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{0}` must not be empty")]
    EmptyArgument(&'static str),
    #[error("`{0}` must be positive")]
    NotPositive(&'static str),
}

/// Builds the shell commands run on hosts (or locally) for each logical action.
///
/// No I/O happens here. Elevated mode prefixes every command with `sudo`.
/// Commands for hosts call cargo-installed binaries by their full path, driver
/// commands rely on `PATH`.
#[derive(Debug, Clone)]
pub struct CommandMaker {
    workspace: String,
    sudo: bool,
    cargo_dir: Option<&'static str>,
    paths: PathMaker,
}

impl CommandMaker {
    /// Commands for a benchmark host.
    pub fn new(workspace: impl Into<String>, sudo: bool) -> Self {
        let cargo_dir = if sudo {
            ELEVATED_CARGO_BIN
        } else {
            USER_CARGO_BIN
        };
        Self::build(workspace.into(), sudo, Some(cargo_dir))
    }

    /// Commands for the driver machine.
    pub fn local(workspace: impl Into<String>) -> Self {
        Self::build(workspace.into(), false, None)
    }

    fn build(workspace: String, sudo: bool, cargo_dir: Option<&'static str>) -> Self {
        Self {
            paths: PathMaker::new(workspace.clone()),
            workspace,
            sudo,
            cargo_dir,
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn paths(&self) -> &PathMaker {
        &self.paths
    }

    fn elevate(&self, command: impl AsRef<str>) -> String {
        if self.sudo {
            format!("sudo {}", command.as_ref())
        } else {
            command.as_ref().to_owned()
        }
    }

    fn cargo_bin(&self, bin: &str) -> String {
        match self.cargo_dir {
            Some(dir) => self.elevate(format!("{}/{}", dir, bin)),
            None => bin.to_owned(),
        }
    }

    /// Remove databases and generated configuration from a previous run.
    pub fn cleanup(&self) -> String {
        [
            self.elevate(format!("rm -r {}/.db-*", self.workspace)),
            self.elevate(format!("rm {}/.*.json", self.workspace)),
            self.elevate(format!("mkdir -p {}", self.paths.results_path())),
        ]
        .join(" ; ")
    }

    pub fn clean_logs(&self) -> String {
        let logs = self.paths.logs_path();
        [
            self.elevate(format!("rm -r {}", logs)),
            self.elevate(format!("mkdir -p {}", logs)),
        ]
        .join(" ; ")
    }

    pub fn compile(&self) -> String {
        let mut command = format!(
            "{} build --quiet --release --features benchmark",
            self.cargo_bin("cargo")
        );
        if self.sudo {
            command.push_str(&format!(" --manifest-path {}/../Cargo.toml", self.workspace));
        }
        command
    }

    pub fn generate_key(&self, filename: &str) -> Result<String, CommandError> {
        non_empty("filename", filename)?;
        Ok(self.elevate(format!(
            "{}/node keys --filename {}",
            self.workspace, filename
        )))
    }

    pub fn run_node(
        &self,
        keys: &str,
        committee: &str,
        store: &str,
        parameters: &str,
        debug: bool,
    ) -> Result<String, CommandError> {
        non_empty("keys", keys)?;
        non_empty("committee", committee)?;
        non_empty("store", store)?;
        non_empty("parameters", parameters)?;
        let verbosity = if debug { "-vvv" } else { "-vv" };
        Ok(self.elevate(format!(
            "{}/node {} run --keys {} --committee {} --store {} --parameters {}",
            self.workspace, verbosity, keys, committee, store, parameters
        )))
    }

    pub fn run_client(
        &self,
        address: &str,
        size: usize,
        rate: u64,
        timeout: u64,
        nodes: &[String],
    ) -> Result<String, CommandError> {
        non_empty("address", address)?;
        if size == 0 {
            return Err(CommandError::NotPositive("size"));
        }
        let mut command = format!(
            "{}/client {} --size {} --rate {} --timeout {}",
            self.workspace, address, size, rate, timeout
        );
        if !nodes.is_empty() {
            command.push_str(&format!(" --nodes {}", nodes.join(" ")));
        }
        Ok(self.elevate(command))
    }

    /// Stops every detached session on the host.
    pub fn kill(&self) -> String {
        self.elevate("tmux kill-server")
    }

    /// Replace the workspace's node and client binaries with links into `origin`.
    pub fn alias_binaries(&self, origin: &str) -> Result<String, CommandError> {
        non_empty("origin", origin)?;
        let origin = origin.trim_end_matches('/');
        Ok([
            self.elevate(format!("rm {}/node", self.workspace)),
            self.elevate(format!("rm {}/client", self.workspace)),
            self.elevate(format!("ln -s {}/node {}", origin, self.workspace)),
            self.elevate(format!("ln -s {}/client {}", origin, self.workspace)),
        ]
        .join(" ; "))
    }

    pub fn miniserve(&self, path: &str, port: u16) -> String {
        format!("{} {} --port {}", self.cargo_bin("miniserve"), path, port)
    }

    /// Start `command` in a detached tmux session, teeing its output into `log_file`.
    pub fn background(&self, name: &str, command: &str, log_file: &str) -> String {
        let tee = self.elevate(format!("tee {}", log_file));
        self.elevate(format!(
            "tmux new -d -s \"{}\" \"{} |& {}\"",
            name, command, tee
        ))
    }

    /// Recreate a file on the host from its base64 encoded content.
    pub fn upload(&self, encoded: &str, remote_path: &str) -> String {
        self.elevate(format!(
            "bash -c 'echo {} | base64 -d > {}'",
            encoded, remote_path
        ))
    }

    /// Fetch, check out and pull `branch`, rebuild and re-link the binaries.
    pub fn update(&self, repo_dir: &str, branch: &str) -> Result<String, CommandError> {
        non_empty("repo_dir", repo_dir)?;
        non_empty("branch", branch)?;
        Ok([
            self.elevate(format!("git -C {} fetch -f", repo_dir)),
            self.elevate(format!("git -C {} checkout -f {}", repo_dir, branch)),
            self.elevate(format!("git -C {} pull -f", repo_dir)),
            self.compile(),
            self.alias_binaries(&format!("{}/target/release", repo_dir))?,
        ]
        .join(" && "))
    }

    /// Non-interactive bootstrap of a fresh host: toolchain, file server and repository.
    pub fn install(&self, repo_url: &str, repo_dir: &str) -> Result<String, CommandError> {
        non_empty("repo_url", repo_url)?;
        non_empty("repo_dir", repo_dir)?;
        Ok([
            "sudo apt-get update".to_owned(),
            "sudo apt-get -y upgrade".to_owned(),
            "sudo apt-get -y autoremove".to_owned(),
            "sudo apt-get -y install build-essential".to_owned(),
            "sudo apt-get -y install cmake".to_owned(),
            format!(
                "curl --proto \"=https\" --tlsv1.2 -sSf https://sh.rustup.rs | {}",
                self.elevate("sh -s -- -y")
            ),
            "sudo apt-get install -y clang".to_owned(),
            format!("{} install miniserve", self.cargo_bin("cargo")),
            format!(
                "({} ; {})",
                self.elevate(format!("git clone {} {}", repo_url, repo_dir)),
                self.elevate(format!("git -C {} pull", repo_dir))
            ),
        ]
        .join(" && "))
    }
}

fn non_empty(name: &'static str, value: &str) -> Result<(), CommandError> {
    if value.trim().is_empty() {
        Err(CommandError::EmptyArgument(name))
    } else {
        Ok(())
    }
}
