use std::{
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use remote_bench::{
    config::{BenchParameters, NodeParameters},
    hosts::{Fleet, StaticFleet},
    local::{Local, Shell},
    logs::{LogParser, ParseError},
    remote::{ExecError, Output, Remote},
    settings::Settings,
    transfer::{Fetch, TransferError},
    Bench, Summary, Testbed,
};
use tempdir::TempDir;
use test_log::test;
use url::Url;

const SETTINGS: &str = r#"{
    "testbed": "bench",
    "key": {"name": "aws", "path": "/keys/aws.pem"},
    "ports": {"consensus": 8000, "mempool": 7000, "front": 6000, "miniserve": 8080},
    "repo": {"name": "hotstuff", "url": "https://example.com/hotstuff.git", "branch": "main"},
    "instances": {"type": "m5d.8xlarge", "regions": ["eu", "us"]}
}"#;

type Calls = Arc<Mutex<Vec<(String, String)>>>;

/// Records every command and fails the ones matching `failing`.
struct FakeRemote {
    calls: Calls,
    failing: Option<(&'static str, &'static str)>,
}

#[async_trait]
impl Remote for FakeRemote {
    async fn run(&self, host: &str, command: &str) -> Result<Output, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_owned(), command.to_owned()));
        if let Some((failing_host, fragment)) = self.failing {
            if host == failing_host && command.contains(fragment) {
                return Err(ExecError::Failed {
                    host: host.to_owned(),
                    code: Some(1),
                    stderr: "boom".to_owned(),
                });
            }
        }
        Ok(Output {
            code: Some(0),
            ..Default::default()
        })
    }
}

/// Pretends to build and writes a key file whenever one is generated.
///
/// Paths in the command are resolved against `cwd`, the way a shell would.
struct FakeLocal {
    same_name: bool,
}

#[async_trait]
impl Local for FakeLocal {
    async fn run(&self, command: &str, cwd: &Path) -> Result<Output, ExecError> {
        if let Some((_, filename)) = command.split_once("keys --filename ") {
            let filename = cwd.join(filename.trim());
            let name = if self.same_name {
                "node".to_owned()
            } else {
                filename
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("node")
                    .trim_start_matches('.')
                    .to_owned()
            };
            let key = format!(r#"{{"name": "{}", "secret": "s3cr3t"}}"#, name);
            std::fs::write(&filename, key).map_err(|source| ExecError::Spawn {
                host: "localhost".to_owned(),
                source,
            })?;
        }
        Ok(Output {
            code: Some(0),
            ..Default::default()
        })
    }
}

/// A real shell that skips the cargo build.
struct ShellWithoutCargo;

#[async_trait]
impl Local for ShellWithoutCargo {
    async fn run(&self, command: &str, cwd: &Path) -> Result<Output, ExecError> {
        if command.contains("cargo build") {
            return Ok(Output {
                code: Some(0),
                ..Default::default()
            });
        }
        Shell.run(command, cwd).await
    }
}

struct FakeFetch {
    urls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Fetch for FakeFetch {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, TransferError> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(b"log line\n".to_vec())
    }
}

struct FakeParser {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl LogParser for FakeParser {
    async fn process(&self, _logs_dir: &Path, faults: usize) -> Result<String, ParseError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("report {} faults {}\n", call, faults))
    }
}

struct Harness {
    bench: Bench,
    calls: Calls,
    urls: Arc<Mutex<Vec<String>>>,
    parses: Arc<AtomicUsize>,
    workspace: TempDir,
}

impl Harness {
    fn new(failing: Option<(&'static str, &'static str)>) -> Self {
        let workspace = TempDir::new("sweep").unwrap();
        let path = workspace.path().to_str().unwrap().to_owned();
        Self::build(
            workspace,
            &path,
            Box::new(FakeLocal { same_name: false }),
            failing,
        )
    }

    fn build(
        workspace: TempDir,
        path: &str,
        local: Box<dyn Local>,
        failing: Option<(&'static str, &'static str)>,
    ) -> Self {
        let calls = Calls::default();
        let urls = Arc::new(Mutex::new(Vec::new()));
        let parses = Arc::new(AtomicUsize::new(0));

        let mut fleet = Fleet::new();
        fleet.insert("eu".to_owned(), vec!["e1".to_owned(), "e2".to_owned()]);
        fleet.insert("us".to_owned(), vec!["u1".to_owned(), "u2".to_owned()]);

        let testbed = Testbed {
            remote: Box::new(FakeRemote {
                calls: calls.clone(),
                failing,
            }),
            local,
            fetch: Box::new(FakeFetch { urls: urls.clone() }),
            parser: Box::new(FakeParser {
                calls: parses.clone(),
            }),
            manager: Box::new(StaticFleet::new(fleet)),
        };
        let settings = Settings::from_json(SETTINGS).unwrap();
        let bench = Bench::new(settings, testbed, path, 8).unwrap();
        Self {
            bench,
            calls,
            urls,
            parses,
            workspace,
        }
    }

    fn commands_containing(&self, fragment: &str) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, command)| command.contains(fragment))
            .cloned()
            .collect()
    }

    fn hosts_running(&self, fragment: &str) -> Vec<String> {
        let mut hosts = self
            .commands_containing(fragment)
            .into_iter()
            .map(|(host, _)| host)
            .collect::<Vec<_>>();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    fn result(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.workspace.path().join("results").join(name)).ok()
    }
}

#[test(tokio::test(start_paused = true))]
async fn sweep_runs_every_point_on_the_booted_hosts() {
    let harness = Harness::new(None);
    let bench = BenchParameters::new(1, vec![3], vec![1000], 512, 20, 2).unwrap();

    let summary = harness
        .bench
        .run(&bench, &NodeParameters::default(), false)
        .await
        .unwrap();

    assert_eq!(
        summary,
        Summary {
            completed: 2,
            failed: 0,
            skipped: 0
        }
    );
    assert_eq!(harness.parses.load(Ordering::SeqCst), 2);

    // Round-robin selection of three hosts, updated and configured together.
    assert_eq!(harness.hosts_running("git -C"), vec!["e1", "e2", "u1"]);
    assert_eq!(harness.hosts_running("base64 -d"), vec!["e1", "e2", "u1"]);

    // The faulty host is never booted.
    assert_eq!(harness.hosts_running(" run --keys"), vec!["e1", "u1"]);
    let clients = harness.commands_containing("--rate ");
    assert_eq!(clients.len(), 4);
    assert!(clients
        .iter()
        .all(|(_, command)| command.contains("--rate 334")
            && command.contains("--nodes e1:6000 u1:6000")));

    // Two runs append to the same artifact.
    assert_eq!(
        harness.result("bench-1-3-1000-512.txt").unwrap(),
        "report 1 faults 1\nreport 2 faults 1\n"
    );
    assert_eq!(harness.urls.lock().unwrap().len(), 8);
    assert!(harness
        .urls
        .lock()
        .unwrap()
        .contains(&"http://u1:8080/client-1.log".to_owned()));
    assert_eq!(
        std::fs::read_to_string(harness.workspace.path().join("logs/node-0.log")).unwrap(),
        "log line\n"
    );
}

#[test(tokio::test(start_paused = true))]
async fn failed_update_skips_only_that_point() {
    let harness = Harness::new(Some(("e2", "git -C")));
    let bench = BenchParameters::new(0, vec![2, 3], vec![500], 512, 1, 1).unwrap();

    let summary = harness
        .bench
        .run(&bench, &NodeParameters::default(), false)
        .await
        .unwrap();

    assert_eq!(
        summary,
        Summary {
            completed: 1,
            failed: 0,
            skipped: 1
        }
    );
    assert!(harness.result("bench-0-2-500-512.txt").is_some());
    assert!(harness.result("bench-0-3-500-512.txt").is_none());
    assert!(harness.commands_containing(" run --keys").iter().all(|(host, _)| host != "e2"));
}

#[test(tokio::test(start_paused = true))]
async fn failed_run_stops_nodes_and_moves_on() {
    let harness = Harness::new(Some(("e1", "--rate ")));
    let bench = BenchParameters::new(0, vec![2], vec![1000], 512, 1, 2).unwrap();

    let summary = harness
        .bench
        .run(&bench, &NodeParameters::default(), false)
        .await
        .unwrap();

    assert_eq!(
        summary,
        Summary {
            completed: 0,
            failed: 2,
            skipped: 0
        }
    );
    assert_eq!(harness.parses.load(Ordering::SeqCst), 0);
    assert!(harness.result("bench-0-2-1000-512.txt").is_none());
    // Each run kills at boot and again after the failure.
    assert_eq!(harness.commands_containing("tmux kill-server").len(), 8);
}

#[test(tokio::test(start_paused = true))]
async fn undersized_fleet_contacts_no_host() {
    let harness = Harness::new(None);
    let bench = BenchParameters::new(0, vec![5], vec![1000], 512, 1, 1).unwrap();

    let summary = harness
        .bench
        .run(&bench, &NodeParameters::default(), false)
        .await
        .unwrap();

    assert_eq!(summary, Summary::default());
    assert!(harness.calls.lock().unwrap().is_empty());
}

#[test(tokio::test)]
async fn kill_is_repeatable_across_the_fleet() {
    let harness = Harness::new(None);
    harness.bench.kill(&[], false).await.unwrap();
    harness.bench.kill(&[], true).await.unwrap();

    let kills = harness.commands_containing("tmux kill-server");
    assert_eq!(kills.len(), 8);
    assert!(kills[0].1.starts_with("true && ("));
    assert!(kills[4].1.contains("rm -r ./logs"));
    assert_eq!(harness.hosts_running("tmux kill-server"), vec!["e1", "e2", "u1", "u2"]);
}

#[test(tokio::test)]
async fn config_writes_committee_for_the_given_hosts() {
    let harness = Harness::new(None);
    let hosts = vec!["e1".to_owned(), "u1".to_owned()];
    let committee = harness
        .bench
        .config(&hosts, &NodeParameters::default())
        .await
        .unwrap();

    assert_eq!(committee.size(), 2);
    let addresses = committee
        .consensus
        .authorities
        .values()
        .map(|a| a.address.clone())
        .collect::<Vec<_>>();
    assert_eq!(addresses, vec!["e1:8000", "u1:8000"]);
    assert!(harness.workspace.path().join(".committee.json").exists());
    assert!(harness.workspace.path().join("results").is_dir());
    // Committee, key and parameters per host.
    assert_eq!(harness.commands_containing("base64 -d").len(), 6);
    assert!(harness
        .commands_containing("base64 -d")
        .iter()
        .any(|(host, command)| host == "u1" && command.ends_with("> ./.node-1.json'")));
}

#[test(tokio::test)]
async fn relative_workspace_is_not_resolved_twice() {
    // Relative to the test's working directory, like `--workspace benchmark`.
    let workspace = TempDir::new_in(".", "relative").unwrap();
    let path = workspace.path().to_str().unwrap().to_owned();
    assert!(Path::new(&path).is_relative());
    let harness = Harness::build(
        workspace,
        &path,
        Box::new(FakeLocal { same_name: false }),
        None,
    );

    let hosts = vec!["e1".to_owned(), "u1".to_owned()];
    let committee = harness
        .bench
        .config(&hosts, &NodeParameters::default())
        .await
        .unwrap();
    assert_eq!(committee.size(), 2);
    assert!(harness.workspace.path().join(".node-1.json").exists());
}

#[test(tokio::test)]
async fn config_runs_through_a_real_shell() {
    let root = TempDir::new_in(".", "driver").unwrap();
    let release = root.path().join("target/release");
    std::fs::create_dir_all(&release).unwrap();
    std::fs::create_dir_all(root.path().join("benchmark")).unwrap();
    let node = release.join("node");
    // Stands in for `node keys --filename <file>`, naming the key after its file.
    let script = r#"#!/bin/sh
echo "{\"name\": \"$(basename "$3")\", \"secret\": \"s\"}" > "$3"
"#;
    std::fs::write(&node, script).unwrap();
    std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::write(release.join("client"), "#!/bin/sh\n").unwrap();

    let path = format!("{}/benchmark", root.path().to_str().unwrap());
    let scratch = TempDir::new("scratch").unwrap();
    let harness = Harness::build(scratch, &path, Box::new(ShellWithoutCargo), None);

    let hosts = vec!["e1".to_owned(), "u1".to_owned()];
    let committee = harness
        .bench
        .config(&hosts, &NodeParameters::default())
        .await
        .unwrap();

    let names = committee
        .consensus
        .authorities
        .keys()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(names, vec![".node-0.json", ".node-1.json"]);
    let benchmark = root.path().join("benchmark");
    assert!(benchmark.join("node").exists());
    assert!(benchmark.join(".committee.json").exists());
    assert!(benchmark.join("results").is_dir());
}

#[test(tokio::test(start_paused = true))]
async fn configuration_error_aborts_the_sweep() {
    let workspace = TempDir::new("duplicate").unwrap();
    let path = workspace.path().to_str().unwrap().to_owned();
    let harness = Harness::build(
        workspace,
        &path,
        Box::new(FakeLocal { same_name: true }),
        None,
    );
    let bench = BenchParameters::new(0, vec![2, 3], vec![1000], 512, 1, 1).unwrap();

    let error = harness
        .bench
        .run(&bench, &NodeParameters::default(), false)
        .await
        .unwrap_err();

    assert!(error.is_configuration());
    assert!(error.to_string().starts_with("Failed to configure nodes: "));
    // The second point is never attempted.
    assert_eq!(harness.hosts_running("git -C"), vec!["e1", "u1"]);
    assert!(harness.commands_containing(" run --keys").is_empty());
}
