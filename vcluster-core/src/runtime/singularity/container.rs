use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use data_encoding::BASE64;
use ipnet::Ipv4Net;
use itertools::Itertools;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, ChildStdout},
    sync::Mutex,
    time::timeout,
};

use crate::{
    protocol::{join_command, quote, ProtocolError, ShellReply, ShellRequest, READY_MARK, READY_PROBE},
    runtime::{Command, Container, ExecOutput, InteractiveSession, Interface, RuntimeError},
    spec::cluster::NodeSettings,
};

use super::host::SshTarget;

pub const METADATA_DIR: &str = "/.vcluster";
pub const CLUSTER_SPEC_PATH: &str = "/.vcluster/cluster_spec.json";
pub const NODE_SPEC_PATH: &str = "/.vcluster/node_spec.json";

const SHELL_READY_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 8192;
const END_OF_TRANSMISSION: u8 = 0x04;

static FIB_TRIE_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\|-- ([0-9.]+)").expect("literal regex is valid"));

/// What an instance is started from.
#[derive(Debug, Clone)]
pub struct InstanceParams {
    pub name: String,
    pub hostname: String,
    pub aliases: Vec<String>,
    pub cluster: String,
    pub settings: NodeSettings,
    /// node address with the prefix of the address space
    pub address: Option<Ipv4Net>,
    pub cluster_json: String,
    pub node_json: String,
    /// working directory of `singularity instance start` on the target
    pub workdir: PathBuf,
}

/// A node running as a singularity instance on an ssh target.
///
/// Commands go through one long lived `bash` inside the instance, spawned on
/// first use and replaced whenever it dies.
#[derive(Debug)]
pub struct SingularityContainer {
    target: SshTarget,
    host: String,
    params: InstanceParams,
    shell: Mutex<Option<ShellSession>>,
}

impl SingularityContainer {
    pub fn new(target: SshTarget, params: InstanceParams) -> Self {
        Self {
            host: target.to_string(),
            target,
            params,
            shell: Mutex::new(None),
        }
    }

    pub fn address(&self) -> Option<Ipv4Net> {
        self.params.address
    }

    fn instance_uri(&self) -> String {
        format!("instance://{}", self.params.name)
    }

    /// Host side script starting the instance, refusing to start it twice.
    pub(super) fn start_script(&self) -> String {
        let params = &self.params;
        let image = &params.settings.image;
        let name = quote(&params.name);

        let bind_dirs = params
            .settings
            .mounts
            .iter()
            .map(|m| format!("mkdir -p {}", quote(&format!("{image}{}", m.target))))
            .join("\n");
        let binds = params.settings.mounts.iter().map(ToString::to_string).join(",");

        let mut options = vec![
            "-wnfC".to_owned(),
            "--hostname".to_owned(),
            quote(&params.hostname),
        ];
        if !binds.is_empty() {
            options.extend(["-B".to_owned(), quote(&binds)]);
        }
        if !params.settings.cap_add.is_empty() {
            options.extend(["--add-caps".to_owned(), quote(&params.settings.cap_add.join(","))]);
        }
        if !params.settings.cap_drop.is_empty() {
            options.extend(["--drop-caps".to_owned(), quote(&params.settings.cap_drop.join(","))]);
        }

        let address = params
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "NONE".to_owned());

        format!(
            "set -e\n\
             umask 0077\n\
             [[ -e {image_q} ]] || {{ echo \"Image '{image}' not found\"; false; }}\n\
             N=$( singularity instance list {name} | wc -l )\n\
             (( N == 1 )) || {{ echo {running}; false; }}\n\
             {bind_dirs}\n\
             mkdir -p {workdir}\n\
             cd {workdir}\n\
             singularity instance start {options} {image_q} {name} {cluster_json} {node_json} {address}\n",
            image_q = quote(image),
            running = quote(&format!("{} is running", params.name)),
            workdir = quote(&params.workdir.to_string_lossy()),
            options = options.join(" "),
            cluster_json = quote(&params.cluster_json),
            node_json = quote(&params.node_json),
            address = quote(&address),
        )
    }

    /// Instance side script replacing the addresses of `eth0`.
    pub(super) fn set_ip_addr_script(address: Ipv4Net) -> String {
        format!("set -e; ip addr flush dev eth0; ip addr add {address} dev eth0;")
    }

    /// Runs `request` through the kept shell, respawning it when needed.
    async fn shell_request(&self, request: ShellRequest<'_>) -> Result<ShellReply, RuntimeError> {
        let mut shell = self.shell.lock().await;

        if shell.is_none() {
            match ShellSession::spawn(&self.target, &self.instance_uri()).await {
                Ok(session) => *shell = Some(session),
                Err(error) => {
                    return match self.is_running().await {
                        Ok(false) => Err(RuntimeError::NotRunning(self.params.name.clone())),
                        _ => Err(error),
                    }
                }
            }
        }

        let Some(session) = shell.as_mut() else {
            return Err(RuntimeError::NotRunning(self.params.name.clone()));
        };

        match session.request(&request).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                debug!("{}: dropping the shell: {error}", self.params.name);
                *shell = None;
                Err(error)
            }
        }
    }

    fn exec_env<'a>(&'a self, env: &'a BTreeMap<String, String>) -> BTreeMap<&'a str, &'a str> {
        self.params
            .settings
            .env
            .iter()
            .chain(env)
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    async fn pid(&self) -> Result<u32, RuntimeError> {
        self.target
            .list_instances(Some(&self.params.name))
            .await?
            .into_iter()
            .find(|i| i.instance == self.params.name)
            .map(|i| i.pid)
            .ok_or_else(|| RuntimeError::NotRunning(self.params.name.clone()))
    }

    /// Writes the cluster and node spec into the instance and sets its address.
    pub(super) async fn initialize(&self) -> Result<(), RuntimeError> {
        let mkdir = Command::from(format!("mkdir -p {METADATA_DIR}"));
        self.exec_run(&mkdir, &BTreeMap::new(), None)
            .await?
            .checked(&mkdir)?;
        self.write_file(CLUSTER_SPEC_PATH, self.params.cluster_json.as_bytes(), None)
            .await?;
        self.write_file(NODE_SPEC_PATH, self.params.node_json.as_bytes(), None)
            .await?;

        if let Some(address) = self.params.address {
            let command = Command::from(Self::set_ip_addr_script(address));
            self.exec_run(&command, &BTreeMap::new(), None)
                .await?
                .checked(&command)?;
        }

        Ok(())
    }
}

/// Addresses of `/proc/<pid>/net/fib_trie` without network, broadcast and
/// loopback entries, first seen first.
pub fn parse_fib_trie(content: &str) -> Vec<Ipv4Addr> {
    FIB_TRIE_ADDRESS
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|a| !a.ends_with(".0") && !a.ends_with(".255") && !a.starts_with("127."))
        .filter_map(|a| a.parse().ok())
        .unique()
        .collect()
}

#[async_trait]
impl Container for SingularityContainer {
    fn name(&self) -> &str {
        &self.params.name
    }

    fn hostname(&self) -> &str {
        &self.params.hostname
    }

    fn aliases(&self) -> &[String] {
        &self.params.aliases
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn network(&self) -> &str {
        &self.params.cluster
    }

    async fn env(&self) -> Result<BTreeMap<String, String>, RuntimeError> {
        Ok(self.params.settings.env.clone())
    }

    async fn interfaces(&self) -> Result<Vec<Interface>, RuntimeError> {
        let command = format!("cat /proc/{}/net/fib_trie", self.pid().await?);
        let output = self.target.run(&command, None).await?;
        let addresses = parse_fib_trie(&String::from_utf8_lossy(&output.checked(&command.into())?));

        let own = self.params.address.map(|a| a.addr());
        let ipv4 = addresses
            .iter()
            .find(|a| Some(**a) == own)
            .or(addresses.first())
            .copied();

        Ok(vec![Interface {
            network: self.params.cluster.clone(),
            ipv4,
            ipv6: None,
        }])
    }

    async fn is_running(&self) -> Result<bool, RuntimeError> {
        Ok(self
            .target
            .list_instances(Some(&self.params.name))
            .await?
            .iter()
            .any(|i| i.instance == self.params.name))
    }

    async fn start(&self) -> Result<(), RuntimeError> {
        debug!("Starting {} on {}", self.params.name, self.host);

        let command = Command::Args(vec![
            "singularity".to_owned(),
            "instance".to_owned(),
            "start".to_owned(),
            self.params.name.clone(),
        ]);
        self.target
            .run_script(&self.start_script())
            .await?
            .checked(&command)?;

        self.initialize().await?;

        info!("Started {}", self.params.name);

        Ok(())
    }

    async fn stop(&self) -> Result<(), RuntimeError> {
        self.shell.lock().await.take();

        let command = format!("singularity instance stop {}", quote(&self.params.name));
        self.target
            .run(&command, None)
            .await?
            .checked(&command.into())?;

        Ok(())
    }

    async fn remove(&self, force: bool) -> Result<(), RuntimeError> {
        if !self.is_running().await? {
            return Ok(());
        }

        match self.stop().await {
            Ok(()) => {
                debug!("Removed {}", self.params.name);
                Ok(())
            }
            Err(error) if force => {
                warn!("Couldn't stop {}: {error}", self.params.name);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn exec_run(
        &self,
        command: &Command,
        env: &BTreeMap<String, String>,
        user: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError> {
        let line = command.shell_line();
        let reply = self
            .shell_request(ShellRequest::new(line).envs(self.exec_env(env)).user(user))
            .await?;

        Ok(ExecOutput {
            exit_code: reply.exit_code,
            output: reply.output,
        })
    }

    async fn pipe(&self, command: &Command, content: &[u8]) -> Result<ExecOutput, RuntimeError> {
        let empty = BTreeMap::new();
        let reply = self
            .shell_request(
                ShellRequest::new(command.shell_line())
                    .envs(self.exec_env(&empty))
                    .stdin(content),
            )
            .await?;

        Ok(ExecOutput {
            exit_code: reply.exit_code,
            output: reply.output,
        })
    }

    async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        user: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let reply = self
            .shell_request(
                ShellRequest::new(format!("cat > {}", quote(path)))
                    .user(user)
                    .stdin(content),
            )
            .await?;

        if reply.exit_code != 0 {
            return Err(RuntimeError::Protocol(ProtocolError::WriteRejected {
                path: path.to_owned(),
                reply: reply.output_text().trim().to_owned(),
            }));
        }

        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        // base64 keeps binary content clear of the reply markers
        let command = Command::from(format!("base64 {}", quote(path)));
        let reply = self.shell_request(ShellRequest::new(command.shell_line())).await?;

        decode_file_reply(path, &command, reply)
    }

    async fn exec_interact(
        &self,
        command: &Command,
    ) -> Result<Box<dyn InteractiveSession>, RuntimeError> {
        if !self.is_running().await? {
            return Err(RuntimeError::NotRunning(self.params.name.clone()));
        }

        let mut args = vec!["singularity".to_owned(), "exec".to_owned(), self.instance_uri()];
        args.extend(command.args());

        let mut child = self
            .target
            .command(&join_command(&args), true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(RuntimeError::Io)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RuntimeError::Transport(format!(
                "no pipes to the session in '{}'",
                self.params.name
            )));
        };

        Ok(Box::new(SingularitySession {
            _child: child,
            stdin,
            stdout,
        }))
    }
}

/// Decodes the reply of `base64 <path>`.
fn decode_file_reply(
    path: &str,
    command: &Command,
    reply: ShellReply,
) -> Result<Vec<u8>, RuntimeError> {
    let encoded = ExecOutput {
        exit_code: reply.exit_code,
        output: reply.output,
    }
    .checked(command)?;

    let encoded = encoded
        .into_iter()
        .filter(|b| !b.is_ascii_whitespace())
        .collect::<Vec<_>>();

    BASE64.decode(&encoded).map_err(|e| {
        RuntimeError::Protocol(ProtocolError::MalformedReply(format!(
            "content of '{path}' isn't valid base64: {e}"
        )))
    })
}

/// A `bash` kept open inside an instance.
#[derive(Debug)]
struct ShellSession {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    buffer: Vec<u8>,
}

impl ShellSession {
    async fn spawn(target: &SshTarget, instance_uri: &str) -> Result<Self, RuntimeError> {
        let line = join_command(&[
            "singularity",
            "exec",
            instance_uri,
            "bash",
            "--noprofile",
            "--norc",
        ]);
        debug!("{target}: {line}");

        let mut child = target
            .command(&line, false)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(RuntimeError::Io)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RuntimeError::Transport(format!("no pipes to {instance_uri}")));
        };

        let mut session = Self {
            _child: child,
            stdin,
            stdout,
            buffer: Vec::new(),
        };

        session.send(READY_PROBE).await?;
        timeout(
            SHELL_READY_TIMEOUT,
            session.read_until(|buffer| Ok(buffer.ends_with(READY_MARK).then_some(()))),
        )
        .await
        .map_err(|_| RuntimeError::Timeout(format!("shell of {instance_uri} didn't get ready")))??;

        Ok(session)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), RuntimeError> {
        self.stdin.write_all(data).await.map_err(RuntimeError::Io)?;
        self.stdin.flush().await.map_err(RuntimeError::Io)
    }

    /// Reads until `done` recognizes the buffer, which is then cleared.
    async fn read_until<T>(
        &mut self,
        done: impl Fn(&[u8]) -> Result<Option<T>, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(value) = done(&self.buffer)? {
                self.buffer.clear();
                return Ok(value);
            }

            let read = self.stdout.read(&mut chunk).await.map_err(RuntimeError::Io)?;
            if read == 0 {
                return Err(RuntimeError::Transport("the shell closed its output".to_owned()));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    async fn request(&mut self, request: &ShellRequest<'_>) -> Result<ShellReply, RuntimeError> {
        self.send(&request.encode()).await?;

        let nonce = request.nonce();
        self.read_until(|buffer| {
            ShellReply::parse(buffer, nonce).map_err(RuntimeError::Protocol)
        })
        .await
    }
}

/// Terminal attached command in an instance.
pub struct SingularitySession {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

#[async_trait]
impl InteractiveSession for SingularitySession {
    async fn read(&mut self, idle_timeout: Duration) -> Result<Vec<u8>, RuntimeError> {
        let mut collected = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        while let Ok(read) = timeout(idle_timeout, self.stdout.read(&mut chunk)).await {
            match read.map_err(RuntimeError::Io)? {
                0 => break,
                n => collected.extend_from_slice(&chunk[..n]),
            }
        }

        Ok(collected)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RuntimeError> {
        self.stdin.write_all(data).await.map_err(RuntimeError::Io)?;
        self.stdin.flush().await.map_err(RuntimeError::Io)
    }

    async fn term(&mut self) -> Result<(), RuntimeError> {
        self.stdin
            .write_all(&[END_OF_TRANSMISSION])
            .await
            .map_err(RuntimeError::Io)?;
        self.stdin.shutdown().await.map_err(RuntimeError::Io)
    }
}

#[cfg(test)]
mod tests {
    use crate::spec::cluster::Mount;

    use super::*;

    const FIB_TRIE: &str = "\
Main:
  +-- 0.0.0.0/0 3 0 5
     |-- 0.0.0.0
        /0 universe UNICAST
     +-- 10.71.0.0/16 2 0 2
        |-- 10.71.0.0
           /16 link UNICAST
        |-- 10.71.0.7
           /32 host LOCAL
        |-- 10.71.255.255
           /32 link BROADCAST
     +-- 127.0.0.0/8 2 0 2
        |-- 127.0.0.1
           /32 host LOCAL
Local:
  +-- 0.0.0.0/0 3 0 5
        |-- 10.71.0.7
           /32 host LOCAL
";

    fn params() -> InstanceParams {
        InstanceParams {
            name: "c1-node-1".to_owned(),
            hostname: "node-1".to_owned(),
            aliases: vec!["head".to_owned()],
            cluster: "c1".to_owned(),
            settings: NodeSettings {
                image: "/images/c7".to_owned(),
                env: BTreeMap::from([("TZ".to_owned(), "Etc/UTC".to_owned())]),
                mounts: vec![Mount::parse("/opt/ovis:/opt/ovis:ro").unwrap()],
                cap_add: vec!["SYS_PTRACE".to_owned()],
                cap_drop: Vec::new(),
                binds: BTreeMap::new(),
            },
            address: Some("10.71.0.7/16".parse().unwrap()),
            cluster_json: r#"{"name":"c1"}"#.to_owned(),
            node_json: r#"{"hostname":"node-1"}"#.to_owned(),
            workdir: PathBuf::from("/tmp/c1-node-1"),
        }
    }

    #[test]
    fn fib_trie_keeps_host_addresses_once() {
        assert_eq!(parse_fib_trie(FIB_TRIE), [Ipv4Addr::new(10, 71, 0, 7)]);
        assert!(parse_fib_trie("").is_empty());
    }

    #[test]
    fn start_script_refuses_running_instances() {
        let container = SingularityContainer::new(SshTarget::parse("localhost").unwrap(), params());

        let script = container.start_script();

        assert!(script.starts_with("set -e\numask 0077\n"));
        assert!(script.contains("N=$( singularity instance list c1-node-1 | wc -l )"));
        assert!(script.contains("(( N == 1 )) || { echo 'c1-node-1 is running'; false; }"));
        assert!(script.contains("mkdir -p /images/c7/opt/ovis\n"));
        assert!(script.contains("cd /tmp/c1-node-1\n"));
        assert!(script.contains(
            "singularity instance start -wnfC --hostname node-1 -B '/opt/ovis:/opt/ovis:ro' \
             --add-caps SYS_PTRACE /images/c7 c1-node-1 '{\"name\":\"c1\"}' \
             '{\"hostname\":\"node-1\"}' 10.71.0.7/16\n"
        ));
    }

    #[test]
    fn instances_without_address_get_none() {
        let container = SingularityContainer::new(
            SshTarget::parse("localhost").unwrap(),
            InstanceParams {
                address: None,
                ..params()
            },
        );

        assert!(container.start_script().contains("'{\"hostname\":\"node-1\"}' NONE\n"));
    }

    #[test]
    fn address_is_set_on_eth0() {
        assert_eq!(
            SingularityContainer::set_ip_addr_script("10.71.0.7/16".parse().unwrap()),
            "set -e; ip addr flush dev eth0; ip addr add 10.71.0.7/16 dev eth0;"
        );
    }

    #[test]
    fn exec_env_layers_call_env_over_node_env() {
        let container = SingularityContainer::new(SshTarget::parse("localhost").unwrap(), params());
        let extra = BTreeMap::from([
            ("TZ".to_owned(), "Asia/Tokyo".to_owned()),
            ("X".to_owned(), "1".to_owned()),
        ]);

        let env = container.exec_env(&extra);

        assert_eq!(env["TZ"], "Asia/Tokyo");
        assert_eq!(env["X"], "1");
    }

    async fn local_shell() -> ShellSession {
        let target = SshTarget::parse("localhost").unwrap();
        let mut child = target
            .command("bash --noprofile --norc", false)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut session = ShellSession {
            stdin: child.stdin.take().unwrap(),
            stdout: child.stdout.take().unwrap(),
            _child: child,
            buffer: Vec::new(),
        };

        session.send(READY_PROBE).await.unwrap();
        session
            .read_until(|b| Ok(b.ends_with(READY_MARK).then_some(())))
            .await
            .unwrap();

        session
    }

    #[tokio::test]
    async fn kept_shell_round_trips_requests() {
        let mut session = local_shell().await;

        let reply = session
            .request(&ShellRequest::new("echo $GREETING; exit 4").env("GREETING", "hi there"))
            .await
            .unwrap();
        assert_eq!(reply.exit_code, 4);
        assert_eq!(reply.output, b"hi there\n");

        let reply = session
            .request(&ShellRequest::new("wc -c").stdin(b"\x00\x01binary\xff"))
            .await
            .unwrap();
        assert_eq!(reply.exit_code, 0);
        assert_eq!(reply.output_text().trim(), "9");
    }

    #[tokio::test]
    async fn output_looking_like_a_trailer_keeps_the_session_in_step() {
        let mut session = local_shell().await;

        let reply = session
            .request(&ShellRequest::new(
                r"printf 'data\377RC0\377END\n'; sleep 0.3; echo rest; exit 5",
            ))
            .await
            .unwrap();
        assert_eq!(reply.exit_code, 5);
        assert_eq!(reply.output, b"data\xFFRC0\xFFEND\nrest\n");

        let reply = session.request(&ShellRequest::new("echo second")).await.unwrap();
        assert_eq!(reply.exit_code, 0);
        assert_eq!(reply.output, b"second\n");
    }

    #[tokio::test]
    async fn binary_files_survive_the_kept_shell() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = local_shell().await;

        for size in [0usize, 1, 4096, 1 << 20] {
            let content = (0..size).map(|i| (i * 31 % 256) as u8).collect::<Vec<_>>();
            let path = dir.path().join(format!("blob-{size}"));
            let path = path.to_str().unwrap();

            let written = session
                .request(&ShellRequest::new(format!("cat > {}", quote(path))).stdin(&content))
                .await
                .unwrap();
            assert_eq!(written.exit_code, 0, "writing {size} bytes");

            let command = Command::from(format!("base64 {}", quote(path)));
            let reply = session
                .request(&ShellRequest::new(command.shell_line()))
                .await
                .unwrap();

            assert_eq!(decode_file_reply(path, &command, reply).unwrap(), content, "{size} bytes");
        }
    }

    #[tokio::test]
    async fn reading_a_missing_file_fails() {
        let mut session = local_shell().await;
        let command = Command::from("base64 /no/such/file".to_owned());

        let reply = session
            .request(&ShellRequest::new(command.shell_line()))
            .await
            .unwrap();

        assert!(decode_file_reply("/no/such/file", &command, reply).is_err());
    }
}
