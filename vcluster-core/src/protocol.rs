//! Framing conventions layered on top of raw exec streams.
//!
//! Backends only hand us a duplex byte stream per command, so anything more
//! than "run this" (confirmed file writes, stdin-fed commands, exit codes on a
//! long lived shell) needs a small convention of its own. Two are used:
//!
//! * engine exec streams write files through `cat` and expect a literal
//!   [`WRITE_ACK`] once the write side has been shut down,
//! * a kept-open `bash` session gets every command followed by an
//!   `echo "\xFF<nonce>RC$?\xFFEND"` trailer and the reply is scanned for it.
//!   The nonce is fresh for every request, output that merely looks like a
//!   trailer never ends a reply.

use std::borrow::Cow;

use data_encoding::{BASE64, HEXLOWER};
use itertools::Itertools;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Reply a successful engine side file write ends with.
pub const WRITE_ACK: &str = "true";

/// Sent to a freshly spawned shell, the session is usable once
/// [`READY_MARK`] comes back.
pub const READY_PROBE: &[u8] = b"echo \xFF\n";
pub const READY_MARK: &[u8] = b"\xFF\n";

const END_MARK: &[u8] = b"\xFFEND\n";
const NONCE_BYTES: usize = 8;

// '_' is outside of the base64 alphabet, the payload can't end the heredoc early
const STDIN_DELIMITER: &str = "__VCLUSTER_STDIN__";
const BASE64_LINE: usize = 76;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Writing '{path}' was rejected: {reply}")]
    WriteRejected { path: String, reply: String },
    #[error("Malformed reply: {}", .0)]
    MalformedReply(String),
}

/// Quotes `value` for a POSIX shell.
pub fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

/// Joins pre-tokenized arguments into one shell command line.
pub fn join_command<S: AsRef<str>>(args: &[S]) -> String {
    args.iter().map(|arg| quote(arg.as_ref())).join(" ")
}

/// Engine side command writing its stdin to `path` and acknowledging it.
pub fn write_file_command(path: &str) -> Vec<String> {
    vec![
        "/bin/bash".to_owned(),
        "-c".to_owned(),
        format!("cat - >{} && echo -n {WRITE_ACK}", quote(path)),
    ]
}

/// Checks what came back after a [`write_file_command`] had its input closed.
pub fn check_write_ack(path: &str, reply: &[u8]) -> Result<(), ProtocolError> {
    if reply == WRITE_ACK.as_bytes() {
        return Ok(());
    }

    Err(ProtocolError::WriteRejected {
        path: path.to_owned(),
        reply: String::from_utf8_lossy(reply).trim().to_owned(),
    })
}

fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);

    HEXLOWER.encode(&bytes)
}

fn rc_mark(nonce: &str) -> Vec<u8> {
    let mut mark = vec![0xFF];
    mark.extend(nonce.bytes());
    mark.extend(b"RC");
    mark
}

/// One command for a kept-open shell session.
#[derive(Debug, Clone)]
pub struct ShellRequest<'a> {
    command: Cow<'a, str>,
    env: Vec<(Cow<'a, str>, Cow<'a, str>)>,
    user: Option<&'a str>,
    stdin: Option<&'a [u8]>,
    nonce: String,
}

impl<'a> ShellRequest<'a> {
    pub fn new(command: impl Into<Cow<'a, str>>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            user: None,
            stdin: None,
            nonce: new_nonce(),
        }
    }

    /// Tags the trailer of this request's reply, see [`ShellReply::parse`].
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn env(mut self, name: impl Into<Cow<'a, str>>, value: impl Into<Cow<'a, str>>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Cow<'a, str>>,
        V: Into<Cow<'a, str>>,
    {
        vars.into_iter().fold(self, |request, (k, v)| request.env(k, v))
    }

    pub fn user(mut self, user: Option<&'a str>) -> Self {
        self.user = user;
        self
    }

    pub fn stdin(mut self, content: &'a [u8]) -> Self {
        self.stdin = Some(content);
        self
    }

    /// Bytes to feed to the shell.
    ///
    /// The command runs in a subshell with stderr folded into stdout. Its
    /// stdin is either the decoded payload or `/dev/null`, never the session's
    /// own input.
    pub fn encode(&self) -> Vec<u8> {
        let mut command = self.command.to_string();
        if let Some(user) = self.user {
            command = format!("runuser {} -s /bin/bash -c {}", quote(user), quote(&command));
        }

        let exports = self
            .env
            .iter()
            .map(|(name, value)| format!("{name}={}", quote(value)))
            .join(" ");
        let body = if exports.is_empty() {
            format!("( {command} )")
        } else {
            format!("( export {exports}; {command} )")
        };

        let mut trailer = b" 2>&1 ; echo \"".to_vec();
        trailer.extend(rc_mark(&self.nonce));
        trailer.extend(b"$?\xFFEND\"\n");

        let mut encoded = Vec::new();
        match self.stdin {
            Some(content) => {
                encoded.extend(format!("base64 -d <<'{STDIN_DELIMITER}' | {body}").bytes());
                encoded.extend(&trailer);

                let payload = BASE64.encode(content);
                for line in payload.as_bytes().chunks(BASE64_LINE) {
                    encoded.extend(line);
                    encoded.push(b'\n');
                }
                encoded.extend(STDIN_DELIMITER.bytes());
                encoded.push(b'\n');
            }
            None => {
                encoded.extend(format!("{body} </dev/null").bytes());
                encoded.extend(&trailer);
            }
        }

        encoded
    }
}

/// Output of a command run through a [`ShellRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellReply {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

impl ShellReply {
    /// Returns `None` until the trailer tagged with `nonce` has arrived.
    pub fn parse(buffer: &[u8], nonce: &str) -> Result<Option<Self>, ProtocolError> {
        if !buffer.ends_with(END_MARK) {
            return Ok(None);
        }

        let rc_mark = rc_mark(nonce);
        let Some(rc_at) = rfind(buffer, &rc_mark) else {
            return Ok(None);
        };
        let status = &buffer[rc_at + rc_mark.len()..buffer.len() - END_MARK.len()];
        let exit_code = std::str::from_utf8(status)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                ProtocolError::MalformedReply(format!(
                    "invalid exit code '{}'",
                    String::from_utf8_lossy(status)
                ))
            })?;

        Ok(Some(Self {
            exit_code,
            output: buffer[..rc_at].to_vec(),
        }))
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}
