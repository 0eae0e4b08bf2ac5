use std::{fmt::Display, fs, process::Stdio};

use log::debug;
use once_cell::sync::Lazy;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    protocol::quote,
    runtime::{ExecOutput, RuntimeError},
};

pub const DEFAULT_SSH_PORT: u16 = 22;

static LOCAL_HOSTNAME: Lazy<Option<String>> = Lazy::new(|| {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| fs::read_to_string("/etc/hostname"))
        .ok()
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
});

/// A machine running instances, reached over ssh unless it's this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    local: bool,
}

impl SshTarget {
    /// Parses `host[:port]`.
    pub fn parse(raw: &str) -> Result<Self, RuntimeError> {
        let (host, port) = match raw.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .map_err(|_| RuntimeError::Transport(format!("invalid ssh target '{raw}'")))?,
            ),
            None => (raw, DEFAULT_SSH_PORT),
        };

        if host.is_empty() {
            return Err(RuntimeError::Transport(format!("invalid ssh target '{raw}'")));
        }

        Ok(Self {
            local: is_local(host, LOCAL_HOSTNAME.as_deref()),
            host: host.to_owned(),
            port,
        })
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Process running `remote` (a shell line) on the target.
    ///
    /// `tty` asks ssh for a remote terminal; local commands get one from
    /// `script`.
    pub fn command(&self, remote: &str, tty: bool) -> Command {
        let mut command;
        if self.local {
            if tty {
                command = Command::new("script");
                command.args(["-qfec", remote, "/dev/null"]);
            } else {
                command = Command::new("/bin/bash");
                command.args(["-c", remote]);
            }
        } else {
            command = Command::new("ssh");
            command
                .arg(if tty { "-tt" } else { "-T" })
                .args(["-p", &self.port.to_string(), &self.host])
                .arg(remote);
        }

        command.kill_on_drop(true);
        command
    }

    /// Runs `remote` to completion, stderr is appended to stdout.
    pub async fn run(&self, remote: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, RuntimeError> {
        debug!("{self}: {remote}");

        let mut child = self
            .command(remote, false)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(RuntimeError::Io)?;

        if let (Some(content), Some(mut input)) = (stdin, child.stdin.take()) {
            input.write_all(content).await.map_err(RuntimeError::Io)?;
            input.shutdown().await.map_err(RuntimeError::Io)?;
        }

        let output = child.wait_with_output().await.map_err(RuntimeError::Io)?;
        let mut combined = output.stdout;
        combined.extend(output.stderr);

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            output: combined,
        })
    }

    /// Feeds a multi-line script to `bash` on the target.
    pub async fn run_script(&self, script: &str) -> Result<ExecOutput, RuntimeError> {
        self.run("bash", Some(script.as_bytes())).await
    }

    pub async fn list_instances(&self, name: Option<&str>) -> Result<Vec<InstanceInfo>, RuntimeError> {
        let command = match name {
            Some(name) => format!("singularity instance list --json {}", quote(name)),
            None => "singularity instance list --json".to_owned(),
        };
        let output = self.run(&command, None).await?;
        let output = output.checked(&command.into())?;

        parse_instance_list(&output)
    }
}

impl Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.port == DEFAULT_SSH_PORT {
            f.write_str(&self.host)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn is_local(host: &str, local_hostname: Option<&str>) -> bool {
    host == "localhost" || Some(host) == local_hostname
}

/// One entry of `singularity instance list --json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceInfo {
    pub instance: String,
    #[serde(default)]
    pub img: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub pid: u32,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<InstanceInfo>,
}

pub fn parse_instance_list(raw: &[u8]) -> Result<Vec<InstanceInfo>, RuntimeError> {
    serde_json::from_slice::<InstanceList>(raw)
        .map(|list| list.instances)
        .map_err(|e| RuntimeError::Transport(format!("unexpected instance list: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_default_to_the_ssh_port() {
        let target = SshTarget::parse("node-7").unwrap();
        assert_eq!((target.host.as_str(), target.port), ("node-7", 22));
        assert_eq!(target.to_string(), "node-7");

        let target = SshTarget::parse("node-7:2222").unwrap();
        assert_eq!(target.port, 2222);
        assert_eq!(target.to_string(), "node-7:2222");

        assert!(SshTarget::parse("node-7:ssh").is_err());
        assert!(SshTarget::parse(":22").is_err());
    }

    #[test]
    fn localhost_and_own_name_skip_ssh() {
        assert!(is_local("localhost", None));
        assert!(is_local("box", Some("box")));
        assert!(!is_local("other", Some("box")));
        assert!(SshTarget::parse("localhost:22").unwrap().is_local());
    }

    #[test]
    fn remote_commands_go_through_ssh() {
        let target = SshTarget {
            host: "node-7".to_owned(),
            port: 2222,
            local: false,
        };

        let command = target.command("hostname", false);
        let std = command.as_std();

        assert_eq!(std.get_program(), "ssh");
        assert_eq!(
            std.get_args().collect::<Vec<_>>(),
            ["-T", "-p", "2222", "node-7", "hostname"]
        );
        assert_eq!(
            target.command("bash", true).as_std().get_args().next().unwrap(),
            "-tt"
        );
    }

    #[test]
    fn local_commands_run_through_bash() {
        let target = SshTarget::parse("localhost").unwrap();
        let command = target.command("echo hi", false);

        assert_eq!(command.as_std().get_program(), "/bin/bash");
        assert_eq!(command.as_std().get_args().collect::<Vec<_>>(), ["-c", "echo hi"]);
    }

    #[test]
    fn instance_list_is_parsed() {
        let raw = br#"{"instances": [
            {"instance": "c-node-1", "pid": 1234, "img": "/img/c7", "ip": "", "logErrPath": "", "logOutPath": ""},
            {"instance": "c-node-2", "pid": 1250, "img": "/img/c7", "ip": "10.0.0.3"}
        ]}"#;

        let instances = parse_instance_list(raw).unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].instance, "c-node-1");
        assert_eq!(instances[0].pid, 1234);
        assert_eq!(instances[1].ip, "10.0.0.3");
        assert!(parse_instance_list(br#"{"instances": []}"#).unwrap().is_empty());
        assert!(parse_instance_list(b"FATAL: not found").is_err());
    }

    #[tokio::test]
    async fn local_runs_capture_both_streams_and_stdin() {
        let target = SshTarget::parse("localhost").unwrap();

        let output = target
            .run("cat; echo err >&2; exit 3", Some(b"in\n"))
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.text(), "in\nerr\n");
    }
}
