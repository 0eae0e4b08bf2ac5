use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
    fs,
    path::Path,
};

use ipnet::Ipv4Net;
use itertools::Itertools;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{Spec, SpecError};

pub const OVIS_MOUNT_POINT: &str = "/opt/ovis";

const DEFAULT_PYTHONPATH: &str =
    "/opt/ovis/lib/python3.6/site-packages:/opt/ovis/lib64/python3.6/site-packages";

/// Typed view of the parts of a resolved spec that shape the cluster itself.
///
/// Everything else in the tree (daemons, plugin configs, ...) is left to the
/// payload running inside the containers.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "deserialize_nodes")]
    pub nodes: Vec<NodeSpec>,
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub subnet: Option<Ipv4Net>,
    #[serde(default)]
    pub ovis_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub hostname: String,
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    /// container port (`"10000"` or `"10000/udp"`) to host port
    #[serde(default)]
    pub binds: BTreeMap<String, u16>,
}

impl NodeSpec {
    pub fn with_hostname(hostname: String) -> Self {
        Self {
            hostname,
            aliases: Vec::new(),
            image: None,
            env: BTreeMap::new(),
            mounts: Vec::new(),
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            binds: BTreeMap::new(),
        }
    }
}

/// Effective container settings of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub binds: BTreeMap<String, u16>,
}

impl NodeSettings {
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    /// Parses `SRC:DST[:ro|rw]`.
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let invalid = || SpecError::InvalidCluster(format!("invalid mount '{raw}'"));
        let mut parts = raw.split(':');
        let source = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let target = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(_) => return Err(invalid()),
        };

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            source: source.to_owned(),
            target: target.to_owned(),
            read_only,
        })
    }
}

impl Display for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.read_only { "ro" } else { "rw" };

        write!(f, "{}:{}:{mode}", self.source, self.target)
    }
}

impl ClusterSpec {
    pub fn from_spec(spec: &Spec) -> Result<Self, SpecError> {
        let cluster: ClusterSpec = serde_json::from_value(Value::Object(spec.as_map().clone()))
            .map_err(|e| SpecError::InvalidCluster(e.to_string()))?;

        cluster.validate()?;

        Ok(cluster)
    }

    fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::InvalidCluster("'name' must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.hostname.is_empty() {
                return Err(SpecError::InvalidCluster(
                    "node 'hostname' must not be empty".into(),
                ));
            }

            if !seen.insert(node.hostname.as_str()) {
                return Err(SpecError::InvalidCluster(format!(
                    "duplicate hostname '{}'",
                    node.hostname
                )));
            }
        }

        for mount in self.nodes.iter().flat_map(|n| &n.mounts).chain(&self.mounts) {
            Mount::parse(mount)?;
        }

        Ok(())
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.hostname.clone()).collect()
    }

    pub fn node(&self, hostname: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }

    /// hostname -> aliases, nodes without aliases are left out
    pub fn node_aliases(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .iter()
            .filter(|n| !n.aliases.is_empty())
            .map(|n| (n.hostname.clone(), n.aliases.clone()))
            .collect()
    }

    /// Node values laid over the cluster-wide ones: env merges by key, lists
    /// append, the image is replaced. `TZ` is filled in from `host_tz` when
    /// neither level sets it.
    pub fn node_settings(
        &self,
        node: &NodeSpec,
        default_image: &str,
        host_tz: &str,
    ) -> Result<NodeSettings, SpecError> {
        let mut env = ovis_env(self.ovis_prefix.as_deref());
        env.extend(self.env.clone());
        env.extend(node.env.clone());
        env.entry("TZ".to_owned())
            .or_insert_with(|| host_tz.to_owned());

        let ovis_mount = self
            .ovis_prefix
            .as_ref()
            .map(|prefix| format!("{prefix}:{OVIS_MOUNT_POINT}:ro"));
        let mounts = ovis_mount
            .iter()
            .chain(&self.mounts)
            .chain(&node.mounts)
            .map(|m| Mount::parse(m))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NodeSettings {
            image: node
                .image
                .as_ref()
                .or(self.image.as_ref())
                .map(String::as_str)
                .unwrap_or(default_image)
                .to_owned(),
            env,
            mounts,
            cap_add: self.cap_add.iter().chain(&node.cap_add).unique().cloned().collect(),
            cap_drop: self.cap_drop.iter().chain(&node.cap_drop).unique().cloned().collect(),
            binds: node.binds.clone(),
        })
    }
}

/// Default environment for binaries installed under [`OVIS_MOUNT_POINT`].
fn ovis_env(prefix: Option<&str>) -> BTreeMap<String, String> {
    let python_path = prefix
        .map(python_site_dirs)
        .filter(|dirs| !dirs.is_empty())
        .map(|dirs| dirs.join(":"))
        .unwrap_or_else(|| DEFAULT_PYTHONPATH.to_owned());

    [
        (
            "PATH",
            "/opt/ovis/bin:/opt/ovis/sbin:/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin",
        ),
        ("LD_LIBRARY_PATH", "/opt/ovis/lib:/opt/ovis/lib64"),
        (
            "ZAP_LIBPATH",
            "/opt/ovis/lib/ovis-ldms:/opt/ovis/lib64/ovis-ldms:/opt/ovis/lib/ovis-lib:/opt/ovis/lib64/ovis-lib",
        ),
        (
            "LDMSD_PLUGIN_LIBPATH",
            "/opt/ovis/lib/ovis-ldms:/opt/ovis/lib64/ovis-ldms",
        ),
        ("PYTHONPATH", python_path.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect()
}

/// `PREFIX/lib*/python*/*-packages`, remapped under the mount point.
fn python_site_dirs(prefix: &str) -> Vec<String> {
    let matching = |dir: &Path, predicate: &dyn Fn(&str) -> bool| -> Vec<String> {
        fs::read_dir(dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| predicate(name))
            .sorted()
            .collect()
    };

    let root = Path::new(prefix);
    let mut dirs = Vec::new();
    for lib in matching(root, &|n| n.starts_with("lib")) {
        for python in matching(&root.join(&lib), &|n| n.starts_with("python")) {
            for packages in matching(&root.join(&lib).join(&python), &|n| n.ends_with("-packages")) {
                dirs.push(format!("{OVIS_MOUNT_POINT}/{lib}/{python}/{packages}"));
            }
        }
    }

    dirs
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Integer(i64),
    Flag(bool),
}

impl Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Text(text) => f.write_str(text),
            Scalar::Integer(number) => number.fmt(f),
            Scalar::Flag(flag) => flag.fmt(f),
        }
    }
}

/// Accepts `{NAME: VALUE}` or `["NAME=VALUE"]`.
fn deserialize_env<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawEnv {
        Map(BTreeMap<String, Scalar>),
        List(Vec<String>),
    }

    match RawEnv::deserialize(deserializer)? {
        RawEnv::Map(map) => Ok(map.into_iter().map(|(k, v)| (k, v.to_string())).collect()),
        RawEnv::List(list) => list
            .into_iter()
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .ok_or_else(|| D::Error::custom(format!("invalid env entry '{entry}'")))
            })
            .collect(),
    }
}

/// Accepts a list of node objects or a node count (`node-1` .. `node-N`).
fn deserialize_nodes<'de, D>(deserializer: D) -> Result<Vec<NodeSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawNodes {
        Count(u32),
        List(Vec<NodeSpec>),
    }

    match RawNodes::deserialize(deserializer)? {
        RawNodes::Count(count) => Ok((1..=count)
            .map(|i| NodeSpec::with_hostname(format!("node-{i}")))
            .collect()),
        RawNodes::List(nodes) => Ok(nodes),
    }
}

fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(one) => Ok(vec![one]),
        OneOrMany::Many(many) => Ok(many),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::spec::resolve;

    fn cluster(raw: Value) -> Result<ClusterSpec, SpecError> {
        resolve(&raw)?.cluster()
    }

    #[test]
    fn node_count_expands_to_numbered_hostnames() {
        let spec = cluster(json!({"name": "c", "nodes": 3})).unwrap();

        assert_eq!(spec.hostnames(), ["node-1", "node-2", "node-3"]);
    }

    #[test]
    fn aliases_accept_a_single_string() {
        let spec = cluster(json!({
            "name": "c",
            "nodes": [
                {"hostname": "node-1", "aliases": "head"},
                {"hostname": "node-2", "aliases": ["agg", "agg-1"]},
                {"hostname": "node-3"},
            ],
        }))
        .unwrap();

        assert_eq!(
            spec.node_aliases(),
            BTreeMap::from([
                ("node-1".to_owned(), vec!["head".to_owned()]),
                ("node-2".to_owned(), vec!["agg".to_owned(), "agg-1".to_owned()]),
            ])
        );
    }

    #[test]
    fn duplicate_hostnames_are_rejected() {
        let result = cluster(json!({
            "name": "c",
            "nodes": [{"hostname": "a"}, {"hostname": "a"}],
        }));

        assert!(matches!(result, Err(SpecError::InvalidCluster(_))));
    }

    #[test]
    fn missing_name_is_rejected() {
        let result = cluster(json!({"nodes": 1}));

        assert!(matches!(result, Err(SpecError::InvalidCluster(_))));
    }

    #[test]
    fn invalid_mount_is_rejected() {
        let result = cluster(json!({"name": "c", "mounts": ["/data:/data:rx"]}));

        assert!(matches!(result, Err(SpecError::InvalidCluster(_))));
    }

    #[test]
    fn env_list_form_is_accepted() {
        let spec = cluster(json!({"name": "c", "env": ["A=1", "B=x=y"]})).unwrap();

        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(spec.env.get("B").map(String::as_str), Some("x=y"));
    }

    #[test]
    fn node_settings_layer_node_over_cluster() {
        let spec = cluster(json!({
            "name": "c",
            "image": "centos:7",
            "env": {"A": "cluster", "B": 2},
            "mounts": ["/data:/data:ro"],
            "cap_add": ["SYS_PTRACE"],
            "ovis_prefix": "/nonexistent/ovis",
            "nodes": [{
                "hostname": "node-1",
                "image": "custom",
                "env": {"A": "node"},
                "mounts": ["/scratch:/scratch"],
                "cap_add": ["SYS_PTRACE", "SYS_ADMIN"],
                "binds": {"10000": 20000},
            }],
        }))
        .unwrap();

        let settings = spec
            .node_settings(&spec.nodes[0], "default", "Etc/UTC")
            .unwrap();

        assert_eq!(settings.image, "custom");
        assert_eq!(settings.env["A"], "node");
        assert_eq!(settings.env["B"], "2");
        assert_eq!(settings.env["TZ"], "Etc/UTC");
        assert_eq!(settings.env["PYTHONPATH"], DEFAULT_PYTHONPATH);
        assert_eq!(
            settings.mounts.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
            [
                "/nonexistent/ovis:/opt/ovis:ro",
                "/data:/data:ro",
                "/scratch:/scratch:rw",
            ]
        );
        assert_eq!(settings.cap_add, ["SYS_PTRACE", "SYS_ADMIN"]);
        assert_eq!(settings.binds.get("10000"), Some(&20000));
    }

    #[test]
    fn spec_timezone_wins_over_host_timezone() {
        let spec = cluster(json!({"name": "c", "env": {"TZ": "Europe/Warsaw"}, "nodes": 1})).unwrap();
        let settings = spec
            .node_settings(&spec.nodes[0], "default", "Etc/UTC")
            .unwrap();

        assert_eq!(settings.image, "default");
        assert_eq!(settings.env["TZ"], "Europe/Warsaw");
    }

    #[test]
    fn python_site_dirs_are_discovered_under_the_prefix() {
        let prefix = tempfile::tempdir().unwrap();
        fs::create_dir_all(prefix.path().join("lib/python3.9/site-packages")).unwrap();
        fs::create_dir_all(prefix.path().join("lib64/python3.9/dist-packages")).unwrap();
        fs::create_dir_all(prefix.path().join("share/python3.9/site-packages")).unwrap();

        let env = ovis_env(prefix.path().to_str());

        assert_eq!(
            env["PYTHONPATH"],
            "/opt/ovis/lib/python3.9/site-packages:/opt/ovis/lib64/python3.9/dist-packages"
        );
    }
}
