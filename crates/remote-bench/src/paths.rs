/// Locations of every file a benchmark run reads or writes, relative to a workspace root.
///
/// The same layout is used on the driver and on each host, only the root differs.
#[derive(Debug, Clone)]
pub struct PathMaker {
    workspace: String,
}

impl PathMaker {
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    fn join(&self, path: &str) -> String {
        format!("{}/{}", self.workspace.trim_end_matches('/'), path)
    }

    pub fn binary_path(&self) -> String {
        self.join("../target/release")
    }

    pub fn node_crate_path(&self) -> String {
        self.join("../node")
    }

    pub fn committee_file(&self) -> String {
        self.join(".committee.json")
    }

    pub fn parameters_file(&self) -> String {
        self.join(".parameters.json")
    }

    pub fn key_file(&self, i: usize) -> String {
        self.join(&format!(".node-{}.json", i))
    }

    pub fn db_path(&self, i: usize) -> String {
        self.join(&format!(".db-{}", i))
    }

    pub fn logs_path(&self) -> String {
        self.join("logs")
    }

    pub fn node_log_file(&self, i: usize) -> String {
        self.join(&format!("logs/node-{}.log", i))
    }

    pub fn client_log_file(&self, i: usize) -> String {
        self.join(&format!("logs/client-{}.log", i))
    }

    /// Output of the file server used to collect logs, kept out of the served directory.
    pub fn file_server_log(&self) -> String {
        self.join("miniserve.log")
    }

    pub fn results_path(&self) -> String {
        self.join("results")
    }

    /// One artifact per (faults, nodes, rate, tx size) point; repeated runs append to it.
    pub fn result_file(&self, faults: usize, nodes: usize, rate: u64, tx_size: usize) -> String {
        self.join(&format!(
            "results/bench-{}-{}-{}-{}.txt",
            faults, nodes, rate, tx_size
        ))
    }
}

/// Final path component, used to name uploaded files and detached sessions.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Basename without its extension.
pub fn stem(path: &str) -> &str {
    let name = basename(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(i) => &name[..i],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_without_doubling_slashes() {
        let paths = PathMaker::new("/root/hotstuff/benchmark/");
        assert_eq!(
            paths.key_file(2),
            "/root/hotstuff/benchmark/.node-2.json"
        );
        assert_eq!(PathMaker::new(".").logs_path(), "./logs");
    }

    #[test]
    fn result_file_is_keyed_by_point() {
        let paths = PathMaker::new(".");
        assert_eq!(
            paths.result_file(1, 3, 1000, 512),
            "./results/bench-1-3-1000-512.txt"
        );
    }

    #[test]
    fn stems() {
        assert_eq!(stem("./logs/node-0.log"), "node-0");
        assert_eq!(stem("logs/miniserve.log"), "miniserve");
        assert_eq!(basename(".committee.json"), ".committee.json");
        assert_eq!(stem(".committee.json"), ".committee");
    }
}
