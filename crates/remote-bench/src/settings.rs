use std::{fs, path::Path};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    auth::{AuthError, Credentials},
    hosts::{Fleet, StaticFleet},
};

/// Login used on plain ssh hosts.
const DEFAULT_USER: &str = "ubuntu";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Read(#[from] std::io::Error),
    #[error("malformed settings: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ports {
    pub consensus: u16,
    pub mempool: u16,
    pub front: u16,
    pub miniserve: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Repo {
    pub name: String,
    pub url: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Key {
        name: String,
        path: String,
        user: String,
    },
    Teleport {
        proxy: String,
        user: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instances {
    Aws {
        instance_type: String,
        regions: Vec<String>,
        hosts: Fleet,
    },
    Teleport {
        hosts: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawKey {
    name: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct RawTeleport {
    proxy: String,
    user: String,
    hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawInstances {
    #[serde(rename = "type")]
    instance_type: String,
    regions: Vec<String>,
    #[serde(default)]
    hosts: Fleet,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    testbed: String,
    key: Option<RawKey>,
    teleport: Option<RawTeleport>,
    ports: Ports,
    repo: Repo,
    instances: Option<RawInstances>,
    parser: Option<String>,
}

/// Everything about the testbed, loaded once and passed around immutably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub testbed: String,
    pub auth: Auth,
    pub ports: Ports,
    pub repo: Repo,
    pub instances: Instances,
    /// Command that turns a log directory into a result report.
    pub parser: Option<String>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SettingsError> {
        let raw: RawSettings =
            serde_json::from_str(text).map_err(|e| SettingsError::Malformed(e.to_string()))?;

        let (auth, instances) = match (raw.teleport, raw.key) {
            (Some(teleport), _) => (
                Auth::Teleport {
                    proxy: teleport.proxy,
                    user: teleport.user,
                },
                Instances::Teleport {
                    hosts: teleport.hosts,
                },
            ),
            (None, Some(key)) => {
                let instances = raw.instances.ok_or_else(|| {
                    SettingsError::Malformed("missing key `instances`".to_owned())
                })?;
                (
                    Auth::Key {
                        name: key.name,
                        path: key.path,
                        user: DEFAULT_USER.to_owned(),
                    },
                    Instances::Aws {
                        instance_type: instances.instance_type,
                        regions: instances.regions,
                        hosts: instances.hosts,
                    },
                )
            }
            (None, None) => {
                return Err(SettingsError::Malformed(
                    "missing key `key` (or `teleport`)".to_owned(),
                ))
            }
        };

        if raw.repo.name.trim().is_empty() {
            return Err(SettingsError::Malformed("empty `repo.name`".to_owned()));
        }

        Ok(Self {
            testbed: raw.testbed,
            auth,
            ports: raw.ports,
            repo: raw.repo,
            instances,
            parser: raw.parser,
        })
    }

    /// Proxied testbeds log in as root and run everything through sudo.
    pub fn is_elevated(&self) -> bool {
        matches!(self.auth, Auth::Teleport { .. })
    }

    pub fn user(&self) -> &str {
        match &self.auth {
            Auth::Key { user, .. } | Auth::Teleport { user, .. } => user,
        }
    }

    /// Where the repository is checked out on each host.
    pub fn repo_dir(&self) -> String {
        if self.is_elevated() {
            format!("/root/{}", self.repo.name)
        } else {
            format!("$HOME/{}", self.repo.name)
        }
    }

    /// Root of the benchmark files on each host.
    pub fn remote_workspace(&self) -> String {
        if self.is_elevated() {
            format!("/root/{}/benchmark", self.repo.name)
        } else {
            ".".to_owned()
        }
    }

    pub fn instance_manager(&self) -> StaticFleet {
        match &self.instances {
            Instances::Aws { hosts, .. } => StaticFleet::new(hosts.clone()),
            Instances::Teleport { hosts } => StaticFleet::single_region("teleport", hosts.clone()),
        }
    }

    /// Load and check the credentials; fails before any host is contacted.
    pub async fn credentials(&self) -> Result<Credentials, AuthError> {
        match &self.auth {
            Auth::Key { path, user, .. } => Credentials::key(user.clone(), path).await,
            Auth::Teleport { user, .. } => Credentials::proxy(user.clone()).await,
        }
    }
}
