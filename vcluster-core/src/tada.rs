//! Client side of the TADA test result sink.
//!
//! Results go out as JSON datagrams, nothing is ever acknowledged and a lost
//! datagram is a lost result.

use std::collections::BTreeMap;

use data_encoding::HEXLOWER;
use derive_builder::Builder;
use log::{info, warn};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::helpers::get_secs_since_unix_epoch;

pub const PASSED: &str = "passed";
pub const FAILED: &str = "failed";
pub const SKIPPED: &str = "skipped";

#[derive(Debug, Error)]
pub enum TadaError {
    #[error("Couldn't open the reporting socket: {}", .0)]
    SocketError(std::io::Error),
    #[error("Invalid test identity: {}", .0)]
    TestIdentityBuilderError(TestIdentityBuilderError),
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "-".to_owned())
}

/// What the sink files results under; running a test again with the same
/// identity replaces the previous results.
#[derive(Debug, Clone, Builder)]
pub struct TestIdentity {
    #[builder(setter(into))]
    pub suite: String,
    #[builder(setter(into))]
    pub test_type: String,
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into, strip_option), default)]
    pub desc: Option<String>,
    #[builder(setter(into), default = "default_user()")]
    pub user: String,
    #[builder(setter(into), default = "\"-\".to_owned()")]
    pub commit_id: String,
}

impl TestIdentity {
    pub fn builder() -> TestIdentityBuilder {
        TestIdentityBuilder::default()
    }
}

#[derive(Debug, Clone)]
struct Assertion {
    desc: String,
    cond: String,
    status: &'static str,
}

/// One test run reporting to the sink.
pub struct TadaTest {
    identity: TestIdentity,
    addr: (String, u16),
    socket: UdpSocket,
    test_id: String,
    assertions: BTreeMap<u32, Assertion>,
}

impl TadaTest {
    pub async fn new(identity: TestIdentity, addr: (String, u16)) -> Result<Self, TadaError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(TadaError::SocketError)?;

        Ok(Self {
            identity,
            addr,
            socket,
            test_id: String::new(),
            assertions: BTreeMap::new(),
        })
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Registers an assertion that's reported as skipped unless it gets
    /// asserted before [`TadaTest::finish`].
    pub fn add_assertion(&mut self, number: u32, desc: impl Into<String>) {
        self.assertions.insert(
            number,
            Assertion {
                desc: desc.into(),
                cond: "none".to_owned(),
                status: SKIPPED,
            },
        );
    }

    pub async fn start(&mut self) {
        let timestamp = get_secs_since_unix_epoch();
        self.test_id = test_id(&self.identity, timestamp as u64);
        let identity = &self.identity;

        info!("Starting test '{}'", identity.name);
        info!("  test-id: {}", self.test_id);
        info!("  test-suite: {}", identity.suite);
        info!("  test-user: {}", identity.user);
        info!("  commit-id: {}", identity.commit_id);

        let message = json!({
            "msg-type": "test-start",
            "test-suite": identity.suite,
            "test-type": identity.test_type,
            "test-name": identity.name,
            "test-user": identity.user,
            "commit-id": identity.commit_id,
            "timestamp": timestamp,
            "test-desc": identity.desc.as_deref().unwrap_or(&identity.name),
        });
        self.send(message).await;
    }

    /// Reports assertion `number` as passed or failed right away.
    pub async fn assert_that(&mut self, number: u32, desc: impl Into<String>, cond: bool) {
        let assertion = Assertion {
            desc: desc.into(),
            cond: cond.to_string(),
            status: if cond { PASSED } else { FAILED },
        };

        info!("assertion {number}, {}: {}", assertion.desc, assertion.status);

        self.send(self.assertion_message(number, &assertion)).await;
        self.assertions.insert(number, assertion);
    }

    /// Marks assertion `number` as skipped, it's reported by
    /// [`TadaTest::finish`].
    pub fn skip(&mut self, number: u32, desc: impl Into<String>) {
        self.add_assertion(number, desc);
    }

    /// Reports every assertion still skipped, then the end of the test.
    pub async fn finish(&mut self) {
        let skipped = self
            .assertions
            .iter()
            .filter(|(_, a)| a.status == SKIPPED)
            .map(|(number, a)| {
                info!("assertion {number}, {}: {}", a.desc, a.status);
                self.assertion_message(*number, a)
            })
            .collect::<Vec<_>>();

        for message in skipped {
            self.send(message).await;
        }

        self.send(json!({
            "msg-type": "test-finish",
            "timestamp": get_secs_since_unix_epoch(),
        }))
        .await;

        info!("Test '{}' ended", self.identity.name);
    }

    fn assertion_message(&self, number: u32, assertion: &Assertion) -> Value {
        json!({
            "msg-type": "assert-status",
            "test-suite": self.identity.suite,
            "test-type": self.identity.test_type,
            "test-name": self.identity.name,
            "assert-no": number,
            "assert-desc": assertion.desc,
            "assert-cond": assertion.cond,
            "test-status": assertion.status,
        })
    }

    async fn send(&self, mut message: Value) {
        if let Some(fields) = message.as_object_mut() {
            fields.insert("test-id".to_owned(), Value::String(self.test_id.clone()));
        }

        let payload = message.to_string();
        let (host, port) = &self.addr;
        if let Err(error) = self.socket.send_to(payload.as_bytes(), (host.as_str(), *port)).await {
            warn!("Couldn't report to {host}:{port}: {error}");
        }
    }
}

/// Hex encoded `suite:type:name:user:commit:timestamp`.
fn test_id(identity: &TestIdentity, timestamp: u64) -> String {
    HEXLOWER.encode(
        format!(
            "{}:{}:{}:{}:{}:{timestamp}",
            identity.suite, identity.test_type, identity.name, identity.user, identity.commit_id
        )
        .as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn identity() -> TestIdentity {
        TestIdentity::builder()
            .suite("ldms")
            .test_type("FVT")
            .name("agg")
            .user("tester")
            .build()
            .map_err(TadaError::TestIdentityBuilderError)
            .unwrap()
    }

    async fn receive(sink: &UdpSocket) -> Value {
        let mut buffer = vec![0u8; 4096];
        let (read, _) = timeout(Duration::from_secs(5), sink.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();

        serde_json::from_slice(&buffer[..read]).unwrap()
    }

    #[test]
    fn identity_defaults_commit_and_description() {
        let identity = identity();

        assert_eq!(identity.commit_id, "-");
        assert_eq!(identity.desc, None);
        assert!(TestIdentity::builder().suite("x").build().is_err());
    }

    #[test]
    fn test_id_is_hex_of_the_identity() {
        assert_eq!(
            test_id(&identity(), 7),
            HEXLOWER.encode(b"ldms:FVT:agg:tester:-:7")
        );
    }

    #[tokio::test]
    async fn results_are_reported_in_order() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        let mut test = TadaTest::new(identity(), ("127.0.0.1".to_owned(), port))
            .await
            .unwrap();

        test.add_assertion(1, "daemon starts");
        test.skip(3, "store works");
        test.start().await;
        test.assert_that(1, "daemon starts", true).await;
        test.assert_that(2, "set is there", false).await;
        test.finish().await;

        let start = receive(&sink).await;
        assert_eq!(start["msg-type"], "test-start");
        assert_eq!(start["test-desc"], "agg");
        assert_eq!(start["test-id"], test.test_id());

        let first = receive(&sink).await;
        assert_eq!(first["assert-no"], 1);
        assert_eq!(first["test-status"], PASSED);

        let second = receive(&sink).await;
        assert_eq!(second["assert-no"], 2);
        assert_eq!(second["test-status"], FAILED);
        assert_eq!(second["assert-cond"], "false");

        let skipped = receive(&sink).await;
        assert_eq!(skipped["assert-no"], 3);
        assert_eq!(skipped["test-status"], SKIPPED);
        assert_eq!(skipped["assert-cond"], "none");

        let finish = receive(&sink).await;
        assert_eq!(finish["msg-type"], "test-finish");
        assert_eq!(finish["test-id"], test.test_id());
    }

    #[tokio::test]
    async fn unreachable_sinks_are_ignored() {
        let mut test = TadaTest::new(identity(), ("no-such-host.invalid".to_owned(), 9))
            .await
            .unwrap();

        test.start().await;
        test.finish().await;
    }
}
