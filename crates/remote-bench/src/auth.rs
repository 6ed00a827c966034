use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use base64::Engine;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Every proxy template must finish with the user/host/port target.
const PROXY_SUFFIX: &str = "%r@%h:%p";
const OPENSSH_MAGIC: &[u8] = b"openssh-key-v1\0";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read ssh key {path:?}: {source}")]
    KeyRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0:?} is not a PEM encoded private key")]
    KeyFormat(PathBuf),
    #[error("ssh key {0:?} is protected by a passphrase")]
    PasswordRequired(PathBuf),
    #[error("failed to run `tsh config`: {0}")]
    Discovery(String),
    #[error("could not find Port in `tsh config` output")]
    MissingPort,
    #[error("could not find ProxyCommand in `tsh config` output")]
    MissingProxyCommand,
    #[error("ProxyCommand does not end with %r@%h:%p")]
    BadProxyCommand,
}

/// How connections to hosts are authenticated.
///
/// Both strategies are fully validated when constructed so a bad key or proxy
/// template is reported before any host is contacted.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Plain ssh with a private key file.
    Key { user: String, key_path: PathBuf },
    /// ssh tunnelled through a per-connection proxy command.
    Proxy { user: String, proxy: ProxyConfig },
}

impl Credentials {
    pub async fn key(
        user: impl Into<String>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, AuthError> {
        let key_path = key_path.as_ref().to_owned();
        let contents = tokio::fs::read_to_string(&key_path)
            .await
            .map_err(|source| AuthError::KeyRead {
                path: key_path.clone(),
                source,
            })?;
        check_private_key(&key_path, &contents)?;
        Ok(Self::Key {
            user: user.into(),
            key_path,
        })
    }

    pub async fn proxy(user: impl Into<String>) -> Result<Self, AuthError> {
        Ok(Self::Proxy {
            user: user.into(),
            proxy: ProxyConfig::discover().await?,
        })
    }

    pub fn user(&self) -> &str {
        match self {
            Self::Key { user, .. } | Self::Proxy { user, .. } => user,
        }
    }

    /// A fresh connection to `host`. Connections are never shared between hosts.
    pub fn connection(&self, host: &str) -> Connection {
        let descriptor = match self {
            Self::Key { key_path, .. } => Descriptor::Key {
                key_path: key_path.clone(),
            },
            Self::Proxy { user, proxy } => Descriptor::Proxy {
                command: proxy.resolve(user, host),
                port: proxy.port,
            },
        };
        Connection {
            user: self.user().to_owned(),
            host: host.to_owned(),
            descriptor,
        }
    }
}

/// Port and proxy template reported by `tsh config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub port: u16,
    pub proxy_command: String,
}

impl ProxyConfig {
    pub async fn discover() -> Result<Self, AuthError> {
        let output = Command::new("tsh")
            .arg("config")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))?;
        if !output.status.success() {
            return Err(AuthError::Discovery(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Self::parse(&String::from_utf8_lossy(&output.stdout))
    }

    pub fn parse(text: &str) -> Result<Self, AuthError> {
        let mut port = None;
        let mut proxy_command = None;
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Port") {
                if let Ok(p) = rest.trim().parse::<u16>() {
                    port = Some(p);
                }
            } else if let Some(rest) = line.strip_prefix("ProxyCommand") {
                let rest = rest.trim();
                if !rest.is_empty() {
                    proxy_command = Some(rest.to_owned());
                }
            }
        }
        let port = port.ok_or(AuthError::MissingPort)?;
        let proxy_command = proxy_command.ok_or(AuthError::MissingProxyCommand)?;
        if !proxy_command.ends_with(PROXY_SUFFIX) {
            return Err(AuthError::BadProxyCommand);
        }
        Ok(Self {
            port,
            proxy_command,
        })
    }

    pub fn resolve(&self, user: &str, host: &str) -> String {
        self.proxy_command
            .replace("%r", user)
            .replace("%h", host)
            .replace("%p", &self.port.to_string())
    }
}

/// What ssh needs to reach one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Key { key_path: PathBuf },
    Proxy { command: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub user: String,
    pub host: String,
    pub descriptor: Descriptor,
}

impl Connection {
    pub fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            "UserKnownHostsFile=/dev/null".to_owned(),
            "-o".to_owned(),
            "LogLevel=ERROR".to_owned(),
        ];
        match &self.descriptor {
            Descriptor::Key { key_path } => {
                args.push("-i".to_owned());
                args.push(key_path.display().to_string());
            }
            Descriptor::Proxy { command, port } => {
                args.push("-p".to_owned());
                args.push(port.to_string());
                args.push("-o".to_owned());
                args.push(format!("ProxyCommand={}", command));
            }
        }
        args.push(format!("{}@{}", self.user, self.host));
        args.push(remote_command.to_owned());
        args
    }

    /// The ssh process for `remote_command`. Any proxy subprocess lives exactly as
    /// long as this process, which is killed if the future driving it is dropped.
    pub fn command(&self, remote_command: &str) -> Command {
        debug!(host = %self.host, command = remote_command, "Preparing ssh command");
        let mut command = Command::new("ssh");
        command
            .args(self.ssh_args(remote_command))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

fn check_private_key(path: &Path, contents: &str) -> Result<(), AuthError> {
    let begin = contents
        .lines()
        .position(|l| l.starts_with("-----BEGIN") && l.ends_with("PRIVATE KEY-----"))
        .ok_or_else(|| AuthError::KeyFormat(path.to_owned()))?;
    let lines = contents.lines().skip(begin + 1).collect::<Vec<_>>();
    if !lines.iter().any(|l| l.starts_with("-----END")) {
        return Err(AuthError::KeyFormat(path.to_owned()));
    }
    // legacy PEM keys announce their encryption in a header
    if lines.iter().any(|l| l.starts_with("Proc-Type:") && l.contains("ENCRYPTED"))
        || contents.contains("BEGIN ENCRYPTED PRIVATE KEY")
    {
        return Err(AuthError::PasswordRequired(path.to_owned()));
    }
    if contents.contains("BEGIN OPENSSH PRIVATE KEY") {
        let body = lines
            .iter()
            .take_while(|l| !l.starts_with("-----END"))
            .map(|l| l.trim())
            .collect::<String>();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|_| AuthError::KeyFormat(path.to_owned()))?;
        let cipher = openssh_cipher(&raw).ok_or_else(|| AuthError::KeyFormat(path.to_owned()))?;
        if cipher != b"none" {
            return Err(AuthError::PasswordRequired(path.to_owned()));
        }
    }
    Ok(())
}

fn openssh_cipher(raw: &[u8]) -> Option<&[u8]> {
    let rest = raw.strip_prefix(OPENSSH_MAGIC)?;
    let len = u32::from_be_bytes(rest.get(..4)?.try_into().ok()?) as usize;
    rest.get(4..4 + len)
}
