use std::{
    collections::BTreeMap,
    fmt::Debug,
    fs,
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use derive_builder::Builder;
use log::debug;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::{
    allocation::AllocationError,
    config::{BackendKind, RuntimeConfig},
    ip::AddressDbError,
    protocol::{join_command, ProtocolError},
    spec::{cluster::NodeSettings, NodeSpec, SpecError},
};

use self::{docker::DockerBackend, metadata::MetadataError, singularity::SingularityBackend};

pub mod cluster;
pub mod docker;
pub mod hosts;
pub mod metadata;
pub mod singularity;

pub use cluster::Cluster;
pub use metadata::ClusterMetadata;

/// Interval of every "wait until" loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Invalid spec: {}", .0)]
    Spec(SpecError),
    #[error("Cluster '{}' already exists with a different spec!", .0)]
    SpecMismatch(String),
    #[error("'{}' not found!", .0)]
    NotFound(String),
    #[error("'{name}' already exists: {reason}")]
    AlreadyExists { name: String, reason: String },
    #[error("'{}' is not running!", .0)]
    NotRunning(String),
    #[error("Transport error: {}", .0)]
    Transport(String),
    #[error("{}", .0)]
    Protocol(ProtocolError),
    #[error("'{command}' exited with {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i64,
        output: String,
    },
    #[error("Container engine error: {}", .0)]
    Docker(bollard::errors::Error),
    #[error("Io error: {}", .0)]
    Io(std::io::Error),
    #[error("Couldn't place the nodes! Reason: {}", .0)]
    Allocation(AllocationError),
    #[error("Couldn't allocate addresses! Reason: {}", .0)]
    AddressDb(AddressDbError),
    #[error("Invalid cluster metadata: {}", .0)]
    Metadata(MetadataError),
    #[error("Couldn't prepare a node launch! Reason: {}", .0)]
    NodeLaunchBuilderError(NodeLaunchBuilderError),
    #[error("Timed out: {}", .0)]
    Timeout(String),
    #[error("Unsupported: {}", .0)]
    Unsupported(String),
}

/// A command either interpreted by a shell or given as separate arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Shell(String),
    Args(Vec<String>),
}

impl Command {
    pub fn shell_line(&self) -> String {
        match self {
            Command::Shell(line) => line.clone(),
            Command::Args(args) => join_command(args),
        }
    }

    /// Argument vector, shell lines go through `/bin/bash -c`.
    pub fn args(&self) -> Vec<String> {
        match self {
            Command::Shell(line) => vec!["/bin/bash".to_owned(), "-c".to_owned(), line.clone()],
            Command::Args(args) => args.clone(),
        }
    }
}

impl From<&str> for Command {
    fn from(value: &str) -> Self {
        Command::Shell(value.to_owned())
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        Command::Shell(value)
    }
}

impl From<Vec<String>> for Command {
    fn from(value: Vec<String>) -> Self {
        Command::Args(value)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.shell_line())
    }
}

/// Exit code and combined stdout/stderr of a finished command. A non-zero
/// exit code is a regular outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Turns a non-zero exit code into [`RuntimeError::CommandFailed`].
    pub fn checked(self, command: &Command) -> Result<Vec<u8>, RuntimeError> {
        if self.success() {
            return Ok(self.output);
        }

        Err(RuntimeError::CommandFailed {
            command: command.shell_line(),
            exit_code: self.exit_code,
            output: self.text().trim().to_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub network: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Number of containers a backend host already runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLoad {
    pub host: String,
    pub load: usize,
}

/// Everything a backend needs to start one node.
#[derive(Debug, Clone, Builder)]
pub struct NodeLaunch {
    /// position of the node in the spec
    pub order: usize,
    pub host: String,
    pub node: NodeSpec,
    pub settings: NodeSettings,
}

/// A pseudo-terminal attached command.
#[async_trait]
pub trait InteractiveSession: Send {
    /// Everything produced until nothing new arrived for `idle_timeout`.
    async fn read(&mut self, idle_timeout: Duration) -> Result<Vec<u8>, RuntimeError>;
    async fn write(&mut self, data: &[u8]) -> Result<(), RuntimeError>;
    /// Sends end-of-transmission and closes the session.
    async fn term(&mut self) -> Result<(), RuntimeError>;
}

/// One node of a virtual cluster, whatever runs it.
#[async_trait]
pub trait Container: Send + Sync + Debug {
    /// backend name of the container or instance
    fn name(&self) -> &str;
    fn hostname(&self) -> &str;
    /// alternate names of the node, as declared in the cluster spec
    fn aliases(&self) -> &[String];
    /// backend host running the container
    fn host(&self) -> &str;
    /// network whose address is the node's address within the cluster
    fn network(&self) -> &str;

    /// Environment the container was created with.
    async fn env(&self) -> Result<BTreeMap<String, String>, RuntimeError>;
    async fn interfaces(&self) -> Result<Vec<Interface>, RuntimeError>;
    async fn is_running(&self) -> Result<bool, RuntimeError>;
    async fn start(&self) -> Result<(), RuntimeError>;
    async fn stop(&self) -> Result<(), RuntimeError>;
    async fn remove(&self, force: bool) -> Result<(), RuntimeError>;

    async fn exec_run(
        &self,
        command: &Command,
        env: &BTreeMap<String, String>,
        user: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError>;
    /// Like [`Container::exec_run`] with `content` fed to stdin.
    async fn pipe(&self, command: &Command, content: &[u8]) -> Result<ExecOutput, RuntimeError>;
    /// Returns once the other side confirmed the whole content was written.
    async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        user: Option<&str>,
    ) -> Result<(), RuntimeError>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError>;
    async fn exec_interact(
        &self,
        command: &Command,
    ) -> Result<Box<dyn InteractiveSession>, RuntimeError>;

    /// Polls [`Container::is_running`], `false` once `timeout` is over.
    async fn wait_running(&self, timeout: Duration) -> Result<bool, RuntimeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_running().await? {
                return Ok(true);
            }

            if Instant::now() >= deadline {
                debug!("{} didn't come up in {timeout:?}", self.name());
                return Ok(false);
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    async fn ip_addr(&self) -> Result<Option<Ipv4Addr>, RuntimeError> {
        Ok(self
            .interfaces()
            .await?
            .into_iter()
            .find(|i| i.network == self.network())
            .and_then(|i| i.ipv4))
    }

    async fn ipv6_addr(&self) -> Result<Option<Ipv6Addr>, RuntimeError> {
        Ok(self
            .interfaces()
            .await?
            .into_iter()
            .find(|i| i.network == self.network())
            .and_then(|i| i.ipv6))
    }
}

/// Substrate realizing clusters: an engine fleet or ssh reachable hosts.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    /// image of nodes the spec doesn't give one
    fn default_image(&self) -> &str;

    async fn host_loads(&self) -> Result<Vec<HostLoad>, RuntimeError>;
    /// Metadata of the cluster called `name`, if this backend runs it.
    async fn lookup(&self, name: &str) -> Result<Option<ClusterMetadata>, RuntimeError>;
    /// Creates the cluster objects and starts every node, containers come back
    /// in launch order.
    async fn provision(
        &self,
        metadata: &ClusterMetadata,
        launches: Vec<NodeLaunch>,
    ) -> Result<Vec<Arc<dyn Container>>, RuntimeError>;
    async fn containers(
        &self,
        metadata: &ClusterMetadata,
    ) -> Result<Vec<Arc<dyn Container>>, RuntimeError>;
    async fn list(&self) -> Result<Vec<String>, RuntimeError>;
    /// Removes whatever is left of the cluster, missing parts are fine.
    async fn teardown(&self, name: &str) -> Result<(), RuntimeError>;
}

pub fn backend_from_config(config: &RuntimeConfig) -> Result<Arc<dyn ClusterBackend>, RuntimeError> {
    debug!("Using the {:?} backend", config.backend);

    Ok(match config.backend {
        BackendKind::Docker => Arc::new(DockerBackend::connect(config)?),
        BackendKind::Singularity => Arc::new(SingularityBackend::new(config)?),
    })
}

pub const DEFAULT_TIMEZONE: &str = "Etc/UTC";

/// Time zone of this machine, handed to the containers as `TZ`.
pub fn host_timezone() -> String {
    timezone_from(
        std::env::var("TZ").ok(),
        Path::new("/etc/timezone"),
        Path::new("/etc/localtime"),
    )
}

fn timezone_from(tz_var: Option<String>, timezone_file: &Path, localtime: &Path) -> String {
    if let Some(tz) = tz_var.filter(|tz| !tz.is_empty()) {
        return tz;
    }

    if let Ok(tz) = fs::read_to_string(timezone_file) {
        let tz = tz.trim();
        if !tz.is_empty() {
            return tz.to_owned();
        }
    }

    // /usr/share/zoneinfo/America/Chicago -> America/Chicago
    if let Ok(target) = fs::read_link(localtime) {
        let parts = target
            .iter()
            .rev()
            .take(2)
            .filter_map(|p| p.to_str())
            .collect::<Vec<_>>();

        if let [city, region] = parts[..] {
            return format!("{region}/{city}");
        }
    }

    DEFAULT_TIMEZONE.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_commands_run_through_bash() {
        let command = Command::from("echo $HOSTNAME");

        assert_eq!(command.args(), ["/bin/bash", "-c", "echo $HOSTNAME"]);
        assert_eq!(command.shell_line(), "echo $HOSTNAME");
    }

    #[test]
    fn argument_commands_are_quoted_for_shells() {
        let command = Command::from(vec!["echo".to_owned(), "a b".to_owned()]);

        assert_eq!(command.args(), ["echo", "a b"]);
        assert_eq!(command.shell_line(), "echo 'a b'");
    }

    #[test]
    fn failed_commands_become_errors_only_when_checked() {
        let output = ExecOutput {
            exit_code: 1,
            output: b"cat: /x: No such file or directory\n".to_vec(),
        };
        assert!(!output.success());

        let error = output.checked(&Command::from("cat /x")).unwrap_err();
        assert_eq!(
            error.to_string(),
            "'cat /x' exited with 1: cat: /x: No such file or directory"
        );
    }

    #[test]
    fn timezone_prefers_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("timezone");
        fs::write(&file, "Europe/Warsaw\n").unwrap();

        assert_eq!(
            timezone_from(Some("Asia/Tokyo".to_owned()), &file, &dir.path().join("x")),
            "Asia/Tokyo"
        );
        assert_eq!(
            timezone_from(None, &file, &dir.path().join("x")),
            "Europe/Warsaw"
        );
    }

    #[cfg(unix)]
    #[test]
    fn timezone_falls_back_to_the_localtime_link() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("localtime");
        std::os::unix::fs::symlink("/usr/share/zoneinfo/America/Chicago", &link).unwrap();

        assert_eq!(
            timezone_from(Some(String::new()), &dir.path().join("none"), &link),
            "America/Chicago"
        );
        assert_eq!(
            timezone_from(None, &dir.path().join("none"), &dir.path().join("none")),
            DEFAULT_TIMEZONE
        );
    }
}
