use std::{
    fs::File,
    path::{Path, PathBuf},
};

use ipnet::Ipv4Net;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::helpers::With;

pub const CONFIG_ENV_VAR: &str = "VCLUSTER_CONFIG";
pub const DEFAULT_CONFIG_DIR: &str = ".vcluster";
pub const DEFAULT_CONFIG_FILENAME: &str = "config.yaml";

pub const DEFAULT_IMAGE: &str = "ovis-centos-build";
pub const DEFAULT_TADA_PORT: u16 = 9862;
pub const DEFAULT_START_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Io error: {}", .0)]
    IoError(std::io::Error),
    #[error("Deserialization error: {}", .0)]
    DeserializationError(serde_yaml::Error),
    #[error("Missing home dir!")]
    MissingHomeDir,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Singularity,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::Docker => "docker",
            BackendKind::Singularity => "singularity",
        })
    }
}

/// Everything the runtime needs that doesn't come from a cluster spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    /// image used when neither the cluster nor the node names one
    pub image: String,
    pub docker: DockerConfig,
    pub singularity: SingularityConfig,
    pub tada: TadaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// engine endpoints, empty means the local engine
    pub hosts: Vec<String>,
    /// `bridge` for a single engine, `overlay` for more when unset
    pub network_driver: Option<String>,
    pub start_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SingularityConfig {
    /// `host[:port]` ssh targets
    pub hosts: Vec<String>,
    /// shared address table, relative paths are taken from the config dir
    pub ip_addr_db: PathBuf,
    pub ip_addr_space: Ipv4Net,
    /// where instance images and scratch data live, `/tmp/<instance>` when unset
    pub local_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TadaConfig {
    pub addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            image: DEFAULT_IMAGE.to_owned(),
            docker: DockerConfig::default(),
            singularity: SingularityConfig::default(),
            tada: TadaConfig::default(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            network_driver: None,
            start_attempts: DEFAULT_START_ATTEMPTS,
        }
    }
}

impl Default for SingularityConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".to_owned()],
            ip_addr_db: PathBuf::from("ip_addr_db.json"),
            ip_addr_space: Ipv4Net::new([10, 71, 0, 0].into(), 16)
                .unwrap_or_default(),
            local_dir: None,
        }
    }
}

impl Default for TadaConfig {
    fn default() -> Self {
        Self {
            addr: format!("localhost:{DEFAULT_TADA_PORT}"),
        }
    }
}

impl DockerConfig {
    pub fn network_driver(&self) -> &str {
        match &self.network_driver {
            Some(driver) => driver,
            None if self.hosts.len() > 1 => "overlay",
            None => "bridge",
        }
    }
}

impl RuntimeConfig {
    /// `$VCLUSTER_CONFIG` or `~/.vcluster/config.yaml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Ok(path.into()),
            None => home::home_dir()
                .map(|d| {
                    d.with(|d| d.push(DEFAULT_CONFIG_DIR))
                        .with(|d| d.push(DEFAULT_CONFIG_FILENAME))
                })
                .ok_or(ConfigError::MissingHomeDir),
        }
    }

    /// Reads the config at `path`, a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        debug!("Used config path: {path:?}");

        let mut config = match File::open(path) {
            Ok(file) => serde_yaml::from_reader(file).map_err(ConfigError::DeserializationError)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {path:?}, using defaults");
                Self::default()
            }
            Err(e) => return Err(ConfigError::IoError(e)),
        };

        let base = path.parent().unwrap_or(Path::new(""));
        if config.singularity.ip_addr_db.is_relative() {
            config.singularity.ip_addr_db = base.join(&config.singularity.ip_addr_db);
        }

        Ok(config)
    }

    /// `host:port` of the TADA sink.
    pub fn tada_addr(&self) -> (String, u16) {
        match self.tada.addr.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_owned(), port),
                Err(_) => (self.tada.addr.clone(), DEFAULT_TADA_PORT),
            },
            None => (self.tada.addr.clone(), DEFAULT_TADA_PORT),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let config = RuntimeConfig::load_or_default(&dir.path().join("none.yaml")).unwrap();

        assert_eq!(config.backend, BackendKind::Docker);
        assert_eq!(config.image, DEFAULT_IMAGE);
        assert_eq!(config.docker.start_attempts, 3);
        assert_eq!(config.docker.network_driver(), "bridge");
        assert_eq!(config.singularity.ip_addr_db, dir.path().join("ip_addr_db.json"));
        assert_eq!(config.tada_addr(), ("localhost".to_owned(), 9862));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "backend: singularity\n\
             singularity:\n  hosts: [localhost, 'node-2:2222']\n  ip_addr_db: /shared/ipdb.json\n  ip_addr_space: 10.9.0.0/24\n\
             tada:\n  addr: tada.example\n",
        )
        .unwrap();

        let config = RuntimeConfig::load_or_default(&path).unwrap();

        assert_eq!(config.backend, BackendKind::Singularity);
        assert_eq!(config.singularity.hosts, ["localhost", "node-2:2222"]);
        assert_eq!(config.singularity.ip_addr_db, PathBuf::from("/shared/ipdb.json"));
        assert_eq!(config.singularity.ip_addr_space, "10.9.0.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(config.image, DEFAULT_IMAGE);
        assert_eq!(config.tada_addr(), ("tada.example".to_owned(), 9862));
    }

    #[test]
    fn several_engines_default_to_overlay() {
        let config = DockerConfig {
            hosts: vec!["tcp://a:2375".to_owned(), "tcp://b:2375".to_owned()],
            ..Default::default()
        };

        assert_eq!(config.network_driver(), "overlay");
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "backend: [").unwrap();

        assert!(matches!(
            RuntimeConfig::load_or_default(&path),
            Err(ConfigError::DeserializationError(_))
        ));
    }
}
