use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future::{join_all, try_join_all};
use log::{debug, info, warn};
use serde_json::Value;

use crate::{
    allocation::plan,
    spec::{resolve, Spec},
};

use super::{
    host_timezone,
    hosts::{synthesize_etc_hosts, HostsEntry, ETC_HOSTS_PATH},
    ClusterBackend, ClusterMetadata, Container, NodeLaunchBuilder, RuntimeError,
};

/// How long a freshly created cluster gets to have every node running.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle of a virtual cluster living on some backend.
///
/// The container list and the hostname/alias index are snapshots taken when
/// the handle was made; [`Cluster::refresh`] re-reads both.
pub struct Cluster {
    backend: Arc<dyn ClusterBackend>,
    metadata: ClusterMetadata,
    containers: Vec<Arc<dyn Container>>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.metadata.name)
            .field("containers", &self.containers)
            .finish()
    }
}

impl Cluster {
    /// Resolves a raw spec tree and creates the cluster it describes.
    pub async fn create_from_raw(
        backend: Arc<dyn ClusterBackend>,
        raw: &Value,
    ) -> Result<Self, RuntimeError> {
        let spec = resolve(raw).map_err(RuntimeError::Spec)?;

        Self::create(backend, spec).await
    }

    /// Creates the cluster, or returns the existing one when it was created
    /// from the very same spec.
    pub async fn create(backend: Arc<dyn ClusterBackend>, spec: Spec) -> Result<Self, RuntimeError> {
        let metadata = ClusterMetadata::from_spec(spec).map_err(RuntimeError::Spec)?;
        let cluster_spec = metadata.spec.cluster().map_err(RuntimeError::Spec)?;

        if let Some(existing) = backend.lookup(&metadata.name).await? {
            if existing.spec != metadata.spec {
                return Err(RuntimeError::SpecMismatch(metadata.name));
            }

            info!("Cluster '{}' already exists with the same spec", metadata.name);
            return Self::from_metadata(backend, existing).await;
        }

        info!(
            "Creating cluster '{}' with {} node(s)...",
            metadata.name,
            cluster_spec.nodes.len()
        );

        let loads = backend
            .host_loads()
            .await?
            .into_iter()
            .map(|h| (h.host, h.load))
            .collect::<Vec<_>>();
        let assignments = plan(&cluster_spec.hostnames(), &loads).map_err(RuntimeError::Allocation)?;
        let placement = assignments
            .iter()
            .flat_map(|a| a.nodes.iter().map(move |n| (n.as_str(), a.host.as_str())))
            .collect::<HashMap<_, _>>();

        let host_tz = host_timezone();
        let launches = cluster_spec
            .nodes
            .iter()
            .enumerate()
            .map(|(order, node)| {
                let host = placement
                    .get(node.hostname.as_str())
                    .copied()
                    .unwrap_or_default();

                NodeLaunchBuilder::default()
                    .order(order)
                    .host(host.to_owned())
                    .settings(
                        cluster_spec
                            .node_settings(node, backend.default_image(), &host_tz)
                            .map_err(RuntimeError::Spec)?,
                    )
                    .node(node.clone())
                    .build()
                    .map_err(RuntimeError::NodeLaunchBuilderError)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let containers = backend.provision(&metadata, launches).await?;
        let cluster = Self::new(backend, metadata, containers);

        if !cluster.wait_running(CREATE_TIMEOUT).await? {
            return Err(RuntimeError::Timeout(format!(
                "cluster '{}' didn't start within {CREATE_TIMEOUT:?}",
                cluster.name()
            )));
        }

        cluster.update_etc_hosts().await?;

        info!("Cluster '{}' created", cluster.name());

        Ok(cluster)
    }

    pub async fn get(backend: Arc<dyn ClusterBackend>, name: &str) -> Result<Self, RuntimeError> {
        debug!("Looking up cluster '{name}'...");

        let metadata = backend
            .lookup(name)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("cluster '{name}'")))?;

        Self::from_metadata(backend, metadata).await
    }

    /// Names of every cluster the backend runs.
    pub async fn list(backend: &dyn ClusterBackend) -> Result<Vec<String>, RuntimeError> {
        let mut names = backend.list().await?;
        names.sort();
        names.dedup();

        Ok(names)
    }

    async fn from_metadata(
        backend: Arc<dyn ClusterBackend>,
        metadata: ClusterMetadata,
    ) -> Result<Self, RuntimeError> {
        let containers = backend.containers(&metadata).await?;

        Ok(Self::new(backend, metadata, containers))
    }

    fn new(
        backend: Arc<dyn ClusterBackend>,
        metadata: ClusterMetadata,
        mut containers: Vec<Arc<dyn Container>>,
    ) -> Self {
        let order = metadata
            .spec
            .cluster()
            .map(|c| c.hostnames())
            .unwrap_or_default();
        containers.sort_by_key(|c| {
            order
                .iter()
                .position(|h| h == c.hostname())
                .unwrap_or(usize::MAX)
        });

        let index = build_index(&metadata, &containers);

        Self {
            backend,
            metadata,
            containers,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn spec(&self) -> &Spec {
        &self.metadata.spec
    }

    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    pub fn node_aliases(&self) -> &std::collections::BTreeMap<String, Vec<String>> {
        &self.metadata.node_aliases
    }

    pub fn aliases_of(&self, hostname: &str) -> &[String] {
        self.metadata.aliases_of(hostname)
    }

    /// Containers in node declaration order.
    pub fn containers(&self) -> &[Arc<dyn Container>] {
        &self.containers
    }

    /// Looks a container up by hostname, alias or backend name.
    pub fn get_container(&self, name: &str) -> Option<&Arc<dyn Container>> {
        self.index.get(name).map(|i| &self.containers[*i])
    }

    /// Re-reads the containers from the backend and rebuilds the lookup index.
    pub async fn refresh(&mut self) -> Result<(), RuntimeError> {
        if let Some(metadata) = self.backend.lookup(&self.metadata.name).await? {
            self.metadata = metadata;
        }

        let fresh = self.backend.containers(&self.metadata).await?;
        let backend = self.backend.clone();
        let metadata = self.metadata.clone();
        *self = Self::new(backend, metadata, fresh);

        Ok(())
    }

    pub async fn is_running(&self) -> Result<bool, RuntimeError> {
        let states = try_join_all(self.containers.iter().map(|c| c.is_running())).await?;

        Ok(!states.is_empty() && states.into_iter().all(|running| running))
    }

    pub async fn wait_running(&self, timeout: Duration) -> Result<bool, RuntimeError> {
        let states = try_join_all(self.containers.iter().map(|c| c.wait_running(timeout))).await?;

        Ok(states.into_iter().all(|running| running))
    }

    /// Rewrites `/etc/hosts` of every container from the current addresses.
    pub async fn update_etc_hosts(&self) -> Result<(), RuntimeError> {
        let addresses = try_join_all(self.containers.iter().map(|c| c.ip_addr())).await?;

        let entries = self
            .containers
            .iter()
            .zip(addresses)
            .filter_map(|(container, ip)| match ip {
                Some(ip) => Some(HostsEntry {
                    ip,
                    hostname: container.hostname(),
                    aliases: self.aliases_of(container.hostname()),
                }),
                None => {
                    warn!("{} has no address, leaving it out of {ETC_HOSTS_PATH}", container.name());
                    None
                }
            })
            .collect::<Vec<_>>();
        let hosts = synthesize_etc_hosts(&entries);

        debug!("Writing {ETC_HOSTS_PATH} to {} container(s)", self.containers.len());

        try_join_all(
            self.containers
                .iter()
                .map(|c| c.write_file(ETC_HOSTS_PATH, hosts.as_bytes(), None)),
        )
        .await?;

        Ok(())
    }

    /// Removes every container and then the cluster's network.
    pub async fn remove(self) -> Result<(), RuntimeError> {
        info!("Removing cluster '{}'...", self.name());

        let results = join_all(self.containers.iter().map(|c| c.remove(true))).await;
        for (container, result) in self.containers.iter().zip(results) {
            if let Err(error) = result {
                warn!("Couldn't remove {}: {error}", container.name());
            }
        }

        self.backend.teardown(&self.metadata.name).await?;

        info!("Cluster '{}' removed", self.metadata.name);

        Ok(())
    }
}

fn build_index(
    metadata: &ClusterMetadata,
    containers: &[Arc<dyn Container>],
) -> HashMap<String, usize> {
    let mut index = HashMap::new();

    for (i, container) in containers.iter().enumerate() {
        index.insert(container.name().to_owned(), i);
        for alias in metadata.aliases_of(container.hostname()) {
            index.insert(alias.clone(), i);
        }
    }

    // literal hostnames win over aliases and names
    for (i, container) in containers.iter().enumerate() {
        index.insert(container.hostname().to_owned(), i);
    }

    index
}
