pub mod allocation;
pub mod config;
pub mod helpers;
pub mod ip;
pub mod protocol;
pub mod runtime;
pub mod spec;
pub mod tada;

/// Labels and tags this crate puts on backend objects.
pub const SPEC_LABEL: &str = "VirtualCluster.spec";
pub const NODE_ALIASES_LABEL: &str = "VirtualCluster.node_aliases";
pub const CLUSTER_NAME_LABEL: &str = "VirtualCluster.name";
pub const HOSTNAME_LABEL: &str = "VirtualCluster.hostname";
