//! 配置加载模块
//!
//! Reads `mole.yaml` once at startup and turns it into validated
//! [`TunnelSpec`] values that are handed to the manager by value.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "mole.yaml";
const DEFAULT_ACCEPT_RETRY_MS: u64 = 1000;

/// How a tunnel authenticates against its SSH server.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Key,
    Password,
}

/// How the server's host key is checked during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept any host key. Kept as the default for compatibility with
    /// existing deployments; it offers no protection against a
    /// man-in-the-middle and every connect logs a warning.
    #[default]
    InsecureAcceptAny,
    /// Verify against the user's `~/.ssh/known_hosts`.
    KnownHosts,
    /// Verify against the given known_hosts file.
    KnownHostsFile(PathBuf),
}

/// What the accept loop does when `accept()` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptErrorPolicy {
    /// Stop the tunnel on the first accept error.
    #[default]
    FailFast,
    /// Log, sleep for `backoff`, keep accepting.
    Retry { backoff: Duration },
}

/// A `host:port` pair requested through a `direct-tcpip` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
}

impl FromStr for RemoteTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("address '{}' is missing a port", s)))?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| ConfigError::Invalid(format!("address '{}' has an unclosed '['", s)))?,
            // IPv6 主机必须带方括号，否则端口有歧义
            None if host.contains(':') => {
                return Err(ConfigError::Invalid(format!(
                    "address '{}' is ambiguous, write IPv6 hosts as [host]:port",
                    s
                )))
            }
            None => host,
        };
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!("address '{}' is missing a host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| ConfigError::Invalid(format!("address '{}' has an invalid port: {}", s, e)))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One validated tunnel definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSpec {
    /// Identity used in logs and events; defaults to the local address.
    pub name: String,
    pub ssh_address: String,
    pub ssh_user: String,
    pub local_address: String,
    pub remote: RemoteTarget,
    pub auth_method: AuthMethod,
    /// Password for [`AuthMethod::Password`], private key path for
    /// [`AuthMethod::Key`] (`None` means the default key).
    pub secret: Option<String>,
    pub host_key: HostKeyPolicy,
    pub accept_errors: AcceptErrorPolicy,
    /// `None` keeps the accept loop unbounded.
    pub max_connections: Option<usize>,
}

impl TunnelSpec {
    /// Spec with defaults for every optional field.
    pub fn new(
        ssh_address: impl Into<String>,
        ssh_user: impl Into<String>,
        local_address: impl Into<String>,
        remote_address: &str,
    ) -> Result<Self, ConfigError> {
        let local_address = local_address.into();
        Ok(Self {
            name: local_address.clone(),
            ssh_address: ssh_address.into(),
            ssh_user: ssh_user.into(),
            local_address,
            remote: remote_address.parse()?,
            auth_method: AuthMethod::default(),
            secret: None,
            host_key: HostKeyPolicy::default(),
            accept_errors: AcceptErrorPolicy::default(),
            max_connections: None,
        })
    }
}

/// The whole configuration after validation.
#[derive(Debug, Clone)]
pub struct Config {
    pub tunnels: Vec<TunnelSpec>,
    pub log_level: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    tunnels: Vec<TunnelEntry>,
    #[serde(default)]
    log_level: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "kebab-case")]
enum HostKeyMode {
    #[default]
    InsecureAcceptAny,
    KnownHosts,
    KnownHostsFile,
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "kebab-case")]
enum AcceptMode {
    #[default]
    FailFast,
    Retry,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct TunnelEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ssh_address: Option<String>,
    #[serde(default)]
    ssh_user: Option<String>,
    #[serde(default)]
    local_address: Option<String>,
    #[serde(default)]
    remote_address: Option<String>,
    #[serde(default)]
    ssh_auth_method: Option<AuthMethod>,
    #[serde(default)]
    ssh_password: Option<String>,
    #[serde(default)]
    ssh_key_path: Option<String>,
    #[serde(default)]
    host_key: Option<HostKeyMode>,
    #[serde(default)]
    known_hosts_path: Option<String>,
    #[serde(default)]
    accept_errors: Option<AcceptMode>,
    #[serde(default)]
    accept_retry_ms: Option<u64>,
    #[serde(default)]
    max_connections: Option<usize>,
}

fn required(value: Option<String>, field: &str, index: usize) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Invalid(format!("tunnel #{}: '{}' is required", index, field))),
    }
}

impl TunnelEntry {
    fn into_spec(self, index: usize) -> Result<TunnelSpec, ConfigError> {
        let ssh_address = required(self.ssh_address, "ssh_address", index)?;
        let ssh_user = required(self.ssh_user, "ssh_user", index)?;
        let local_address = required(self.local_address, "local_address", index)?;
        let remote_address = required(self.remote_address, "remote_address", index)?;
        let remote = remote_address
            .parse::<RemoteTarget>()
            .map_err(|e| ConfigError::Invalid(format!("tunnel #{}: {}", index, e)))?;

        let auth_method = self.ssh_auth_method.unwrap_or_default();
        let secret = match auth_method {
            AuthMethod::Password => Some(self.ssh_password.unwrap_or_default()),
            AuthMethod::Key => self.ssh_key_path,
        };

        let host_key = match self.host_key.unwrap_or_default() {
            HostKeyMode::InsecureAcceptAny => HostKeyPolicy::InsecureAcceptAny,
            HostKeyMode::KnownHosts => HostKeyPolicy::KnownHosts,
            HostKeyMode::KnownHostsFile => {
                let path = required(self.known_hosts_path, "known_hosts_path", index)?;
                HostKeyPolicy::KnownHostsFile(expand_tilde(&path))
            }
        };

        let accept_errors = match self.accept_errors.unwrap_or_default() {
            AcceptMode::FailFast => AcceptErrorPolicy::FailFast,
            AcceptMode::Retry => AcceptErrorPolicy::Retry {
                backoff: Duration::from_millis(self.accept_retry_ms.unwrap_or(DEFAULT_ACCEPT_RETRY_MS)),
            },
        };

        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "tunnel #{}: 'max_connections' must be greater than zero",
                index
            )));
        }

        Ok(TunnelSpec {
            name: self.name.unwrap_or_else(|| local_address.clone()),
            ssh_address,
            ssh_user,
            local_address,
            remote,
            auth_method,
            secret,
            host_key,
            accept_errors,
            max_connections: self.max_connections,
        })
    }
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_yaml::from_str(content)?;
        if file.tunnels.is_empty() {
            return Err(ConfigError::Invalid("no tunnels configured".to_string()));
        }
        let tunnels = file
            .tunnels
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.into_spec(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tunnels,
            log_level: file.log_level,
        })
    }

    /// Load from `path`, or from the first `mole.yaml` found in
    /// [`search_paths`] when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let candidates = search_paths();
                candidates
                    .iter()
                    .find(|p| p.exists())
                    .cloned()
                    .ok_or_else(|| {
                        let tried = candidates
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                            .join(", ");
                        ConfigError::NotFound(tried)
                    })?
            }
        };

        debug!(path = %path.display(), "读取配置文件");
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }
}

/// Candidate config locations, highest priority first.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![Path::new("/etc/mole").join(CONFIG_FILE_NAME)];
    if let Some(dirs) = BaseDirs::new() {
        paths.push(dirs.home_dir().join(".mole").join(CONFIG_FILE_NAME));
    }
    paths.push(Path::new(".").join(CONFIG_FILE_NAME));
    paths
}

/// Replace a leading `~` with the home directory.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => match BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
