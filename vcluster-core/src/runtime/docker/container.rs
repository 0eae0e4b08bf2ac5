use std::{collections::BTreeMap, net::Ipv4Addr, pin::Pin, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{InspectContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, StopContainerOptions},
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecResults},
    service::ContainerInspectResponse,
    Docker,
};
use futures::{Stream, StreamExt};
use log::{debug, info};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    protocol::{check_write_ack, write_file_command},
    runtime::{Command, Container, ExecOutput, InteractiveSession, Interface, RuntimeError},
};

use super::is_status;

type OutputStream = Pin<Box<dyn Stream<Item = Result<LogOutput, DockerError>> + Send>>;
type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

const END_OF_TRANSMISSION: u8 = 0x04;
const STOP_TIMEOUT_SECS: i64 = 10;

/// A node running as an engine container.
#[derive(Debug, Clone)]
pub struct DockerContainer {
    docker: Docker,
    host: String,
    name: String,
    hostname: String,
    aliases: Vec<String>,
    network: String,
}

impl DockerContainer {
    pub fn new(
        docker: Docker,
        host: String,
        name: String,
        hostname: String,
        aliases: Vec<String>,
        network: String,
    ) -> Self {
        Self {
            docker,
            host,
            name,
            hostname,
            aliases,
            network,
        }
    }

    async fn inspect(&self) -> Result<ContainerInspectResponse, RuntimeError> {
        self.docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    RuntimeError::NotFound(format!("container '{}'", self.name))
                } else {
                    RuntimeError::Docker(e)
                }
            })
    }

    async fn ensure_running(&self) -> Result<(), RuntimeError> {
        match self.is_running().await? {
            true => Ok(()),
            false => Err(RuntimeError::NotRunning(self.name.clone())),
        }
    }

    /// Runs `args` with every stream attached and `stdin` written then closed.
    async fn exec_attached(
        &self,
        args: Vec<String>,
        env: &BTreeMap<String, String>,
        user: Option<&str>,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        self.ensure_running().await?;

        debug!("{}: exec {args:?}", self.name);

        let options = CreateExecOptions {
            cmd: Some(args),
            env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            user: user.map(str::to_owned),
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&self.name, options)
            .await
            .map_err(RuntimeError::Docker)?;

        let output = match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(RuntimeError::Docker)?
        {
            StartExecResults::Attached { output, mut input } => {
                if let Some(content) = stdin {
                    input.write_all(content).await.map_err(RuntimeError::Io)?;
                }
                // half-close so the command sees the end of its input
                input.shutdown().await.map_err(RuntimeError::Io)?;

                drain(output).await?
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Transport(format!(
                    "exec in '{}' came back detached",
                    self.name
                )))
            }
        };

        // the engine demultiplexes the streams, the status comes from the exec itself
        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(RuntimeError::Docker)?
            .exit_code
            .unwrap_or(-1);

        Ok(ExecOutput { exit_code, output })
    }
}

async fn drain(mut output: OutputStream) -> Result<Vec<u8>, RuntimeError> {
    let mut collected = Vec::new();
    while let Some(chunk) = output.next().await {
        collected.extend_from_slice(&chunk.map_err(RuntimeError::Docker)?.into_bytes());
    }

    Ok(collected)
}

pub(super) fn parse_env(list: &[String]) -> BTreeMap<String, String> {
    list.iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}

fn parse_address<T: std::str::FromStr>(raw: Option<&String>) -> Option<T> {
    raw.filter(|s| !s.is_empty()).and_then(|s| s.parse().ok())
}

#[async_trait]
impl Container for DockerContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn aliases(&self) -> &[String] {
        &self.aliases
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn network(&self) -> &str {
        &self.network
    }

    async fn env(&self) -> Result<BTreeMap<String, String>, RuntimeError> {
        let env = self
            .inspect()
            .await?
            .config
            .and_then(|c| c.env)
            .unwrap_or_default();

        Ok(parse_env(&env))
    }

    async fn interfaces(&self) -> Result<Vec<Interface>, RuntimeError> {
        let networks = self
            .inspect()
            .await?
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default();

        let mut interfaces = networks
            .into_iter()
            .map(|(network, endpoint)| Interface {
                ipv4: parse_address::<Ipv4Addr>(endpoint.ip_address.as_ref()),
                ipv6: parse_address(endpoint.global_ipv6_address.as_ref()),
                network,
            })
            .collect::<Vec<_>>();
        interfaces.sort_by(|a, b| a.network.cmp(&b.network));

        Ok(interfaces)
    }

    async fn is_running(&self) -> Result<bool, RuntimeError> {
        match self.inspect().await {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|s| s.running)
                .unwrap_or_default()),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start(&self) -> Result<(), RuntimeError> {
        self.docker
            .start_container(&self.name, None::<StartContainerOptions<String>>)
            .await
            .or_else(|e| if is_status(&e, 304) { Ok(()) } else { Err(e) })
            .map_err(RuntimeError::Docker)?;

        info!("Started {}", self.name);

        Ok(())
    }

    async fn stop(&self) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(&self.name, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
            .or_else(|e| if is_status(&e, 304) { Ok(()) } else { Err(e) })
            .map_err(RuntimeError::Docker)
    }

    async fn remove(&self, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        match self.docker.remove_container(&self.name, Some(options)).await {
            Ok(_) => {
                debug!("Removed {}", self.name);
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn exec_run(
        &self,
        command: &Command,
        env: &BTreeMap<String, String>,
        user: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError> {
        self.exec_attached(command.args(), env, user, None).await
    }

    async fn pipe(&self, command: &Command, content: &[u8]) -> Result<ExecOutput, RuntimeError> {
        self.exec_attached(command.args(), &BTreeMap::new(), None, Some(content))
            .await
    }

    async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        user: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let reply = self
            .exec_attached(write_file_command(path), &BTreeMap::new(), user, Some(content))
            .await?;

        check_write_ack(path, &reply.output).map_err(RuntimeError::Protocol)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let command = Command::Args(vec!["cat".to_owned(), path.to_owned()]);

        self.exec_attached(command.args(), &BTreeMap::new(), None, None)
            .await?
            .checked(&command)
    }

    async fn exec_interact(
        &self,
        command: &Command,
    ) -> Result<Box<dyn InteractiveSession>, RuntimeError> {
        self.ensure_running().await?;

        let options = CreateExecOptions {
            cmd: Some(command.args()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&self.name, options)
            .await
            .map_err(RuntimeError::Docker)?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(RuntimeError::Docker)?
        {
            StartExecResults::Attached { output, input } => {
                Ok(Box::new(DockerSession { output, input }))
            }
            StartExecResults::Detached => Err(RuntimeError::Transport(format!(
                "interactive exec in '{}' came back detached",
                self.name
            ))),
        }
    }
}

/// TTY exec session.
pub struct DockerSession {
    output: OutputStream,
    input: InputSink,
}

#[async_trait]
impl InteractiveSession for DockerSession {
    async fn read(&mut self, idle_timeout: Duration) -> Result<Vec<u8>, RuntimeError> {
        let mut collected = Vec::new();

        while let Ok(next) = tokio::time::timeout(idle_timeout, self.output.next()).await {
            match next {
                Some(chunk) => {
                    collected.extend_from_slice(&chunk.map_err(RuntimeError::Docker)?.into_bytes())
                }
                None => break,
            }
        }

        Ok(collected)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RuntimeError> {
        self.input.write_all(data).await.map_err(RuntimeError::Io)?;
        self.input.flush().await.map_err(RuntimeError::Io)
    }

    async fn term(&mut self) -> Result<(), RuntimeError> {
        self.input
            .write_all(&[END_OF_TRANSMISSION])
            .await
            .map_err(RuntimeError::Io)?;
        self.input.shutdown().await.map_err(RuntimeError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_list_is_split_on_the_first_equals_sign() {
        let env = parse_env(&[
            "PATH=/usr/bin:/bin".to_owned(),
            "OPTS=a=b".to_owned(),
            "EMPTY=".to_owned(),
            "BARE".to_owned(),
        ]);

        assert_eq!(env["PATH"], "/usr/bin:/bin");
        assert_eq!(env["OPTS"], "a=b");
        assert_eq!(env["EMPTY"], "");
        assert_eq!(env["BARE"], "");
    }

    #[test]
    fn empty_addresses_are_absent() {
        assert_eq!(parse_address::<Ipv4Addr>(Some(&String::new())), None);
        assert_eq!(parse_address::<Ipv4Addr>(None), None);
        assert_eq!(
            parse_address::<Ipv4Addr>(Some(&"10.0.0.2".to_owned())),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
    }
}
