use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing or invalid number of nodes: {0:?}")]
    InvalidNodes(Vec<usize>),
    #[error("there should be more nodes than faults (nodes: {nodes}, faults: {faults})")]
    TooManyFaults { nodes: usize, faults: usize },
    #[error("missing input rate")]
    MissingRate,
    #[error("`{0}` must be positive")]
    NotPositive(&'static str),
    #[error("committee inputs disagree in length: {0}")]
    CommitteeShape(String),
    #[error("duplicate authority name {0}")]
    DuplicateName(String),
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &str) -> Result<T, FileError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| FileError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| FileError::Json {
        path: path.to_owned(),
        source,
    })
}

async fn write_json<T: Serialize>(path: &str, value: &T) -> Result<(), FileError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| FileError::Json {
        path: path.to_owned(),
        source,
    })?;
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FileError::Io {
                    path: path.to_owned(),
                    source,
                })?;
        }
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| FileError::Io {
            path: path.to_owned(),
            source,
        })
}

/// A node identity written by `node keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub name: String,
    pub secret: String,
}

impl Key {
    pub async fn from_file(path: &str) -> Result<Self, FileError> {
        read_json(path).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusAuthority {
    pub stake: u64,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolAuthority {
    pub stake: u64,
    pub transactions_address: String,
    pub mempool_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusCommittee {
    pub authorities: BTreeMap<String, ConsensusAuthority>,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolCommittee {
    pub authorities: BTreeMap<String, MempoolAuthority>,
    pub epoch: u64,
}

/// Membership of a cluster for one run, shared verbatim by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    pub consensus: ConsensusCommittee,
    pub mempool: MempoolCommittee,
}

impl Committee {
    /// Every authority gets one unit of stake and three endpoints.
    pub fn new(
        names: &[String],
        consensus_addresses: &[String],
        front_addresses: &[String],
        mempool_addresses: &[String],
    ) -> Result<Self, ConfigError> {
        if names.len() != consensus_addresses.len()
            || names.len() != front_addresses.len()
            || names.len() != mempool_addresses.len()
        {
            return Err(ConfigError::CommitteeShape(format!(
                "{} names, {} consensus, {} front, {} mempool",
                names.len(),
                consensus_addresses.len(),
                front_addresses.len(),
                mempool_addresses.len()
            )));
        }

        let mut consensus = BTreeMap::new();
        let mut mempool = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            let previous = consensus.insert(
                name.clone(),
                ConsensusAuthority {
                    stake: 1,
                    address: consensus_addresses[i].clone(),
                },
            );
            if previous.is_some() {
                return Err(ConfigError::DuplicateName(name.clone()));
            }
            mempool.insert(
                name.clone(),
                MempoolAuthority {
                    stake: 1,
                    transactions_address: front_addresses[i].clone(),
                    mempool_address: mempool_addresses[i].clone(),
                },
            );
        }

        Ok(Self {
            consensus: ConsensusCommittee {
                authorities: consensus,
                epoch: 1,
            },
            mempool: MempoolCommittee {
                authorities: mempool,
                epoch: 1,
            },
        })
    }

    pub fn size(&self) -> usize {
        self.consensus.authorities.len()
    }

    pub async fn load(path: &str) -> Result<Self, FileError> {
        read_json(path).await
    }

    pub async fn print(&self, path: &str) -> Result<(), FileError> {
        write_json(path, self).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParameters {
    /// Milliseconds before a view change.
    pub timeout_delay: u64,
    pub sync_retry_delay: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolParameters {
    pub gc_depth: u64,
    pub sync_retry_delay: u64,
    pub sync_retry_nodes: u64,
    pub batch_size: u64,
    pub max_batch_delay: u64,
}

/// Cluster behaviour handed to every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeParameters {
    pub consensus: ConsensusParameters,
    pub mempool: MempoolParameters,
}

impl Default for NodeParameters {
    fn default() -> Self {
        Self {
            consensus: ConsensusParameters {
                timeout_delay: 1_000,
                sync_retry_delay: 10_000,
            },
            mempool: MempoolParameters {
                gc_depth: 50,
                sync_retry_delay: 5_000,
                sync_retry_nodes: 3,
                batch_size: 15_000,
                max_batch_delay: 10,
            },
        }
    }
}

impl NodeParameters {
    pub fn new(
        consensus: ConsensusParameters,
        mempool: MempoolParameters,
    ) -> Result<Self, ConfigError> {
        let parameters = Self { consensus, mempool };
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("timeout_delay", self.consensus.timeout_delay),
            ("sync_retry_delay", self.consensus.sync_retry_delay),
            ("gc_depth", self.mempool.gc_depth),
            ("sync_retry_delay", self.mempool.sync_retry_delay),
            ("sync_retry_nodes", self.mempool.sync_retry_nodes),
            ("batch_size", self.mempool.batch_size),
            ("max_batch_delay", self.mempool.max_batch_delay),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }
        Ok(())
    }

    pub fn timeout_delay(&self) -> u64 {
        self.consensus.timeout_delay
    }

    pub async fn from_file(path: &str) -> Result<Self, crate::Error> {
        let parameters: Self = read_json(path).await?;
        parameters.validate()?;
        Ok(parameters)
    }

    pub async fn print(&self, path: &str) -> Result<(), FileError> {
        write_json(path, self).await
    }
}

/// The sweep to run: every node count at every rate, `runs` times each.
///
/// Only built through [`BenchParameters::new`], so every node count exceeds the
/// fault count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchParameters {
    faults: usize,
    nodes: Vec<usize>,
    rate: Vec<u64>,
    tx_size: usize,
    duration: u64,
    runs: usize,
}

impl BenchParameters {
    pub fn new(
        faults: usize,
        nodes: Vec<usize>,
        rate: Vec<u64>,
        tx_size: usize,
        duration: u64,
        runs: usize,
    ) -> Result<Self, ConfigError> {
        if nodes.is_empty() || nodes.iter().any(|&n| n <= 1) {
            return Err(ConfigError::InvalidNodes(nodes));
        }
        if let Some(&smallest) = nodes.iter().min() {
            if smallest <= faults {
                return Err(ConfigError::TooManyFaults {
                    nodes: smallest,
                    faults,
                });
            }
        }
        if rate.is_empty() {
            return Err(ConfigError::MissingRate);
        }
        if tx_size == 0 {
            return Err(ConfigError::NotPositive("tx_size"));
        }
        if duration == 0 {
            return Err(ConfigError::NotPositive("duration"));
        }
        if runs == 0 {
            return Err(ConfigError::NotPositive("runs"));
        }
        Ok(Self {
            faults,
            nodes,
            rate,
            tx_size,
            duration,
            runs,
        })
    }

    pub fn faults(&self) -> usize {
        self.faults
    }

    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    pub fn rate(&self) -> &[u64] {
        &self.rate
    }

    pub fn tx_size(&self) -> usize {
        self.tx_size
    }

    /// Seconds of steady state per run.
    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Hosts needed for the largest point of the sweep.
    pub fn max_nodes(&self) -> usize {
        self.nodes.iter().copied().max().unwrap_or(0)
    }
}
