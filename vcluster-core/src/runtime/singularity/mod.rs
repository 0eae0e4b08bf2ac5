use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use ipnet::Ipv4Net;
use log::{debug, info, warn};

use crate::{
    config::{BackendKind, RuntimeConfig},
    ip::{db::IpAddrDb, ranges::AddressRanges},
    protocol::quote,
    runtime::{
        host_timezone, metadata::ClusterMetadata, ClusterBackend, Container, HostLoad, NodeLaunch,
        RuntimeError,
    },
    spec::{
        cluster::{NodeSettings, NodeSpec},
        Spec,
    },
};

use self::{
    container::{InstanceParams, SingularityContainer, CLUSTER_SPEC_PATH},
    host::{InstanceInfo, SshTarget},
};

pub mod container;
pub mod host;

const DEFAULT_LOCAL_DIR: &str = "/tmp";

/// Clusters made of singularity instances on ssh reachable hosts.
///
/// There's no network object to hang the metadata on, every instance carries
/// the cluster spec in its filesystem instead. Addresses come from a table
/// shared by every process using the same hosts.
pub struct SingularityBackend {
    targets: Vec<SshTarget>,
    db: IpAddrDb,
    default_image: String,
    local_dir: PathBuf,
}

impl SingularityBackend {
    pub fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let targets = config
            .singularity
            .hosts
            .iter()
            .map(|host| SshTarget::parse(host))
            .collect::<Result<Vec<_>, _>>()?;

        if targets.is_empty() {
            return Err(RuntimeError::Unsupported(
                "no singularity hosts are configured".to_owned(),
            ));
        }

        let db = IpAddrDb::open(&config.singularity.ip_addr_db, config.singularity.ip_addr_space)
            .map_err(RuntimeError::AddressDb)?;

        debug!(
            "Using {} singularity host(s): {}",
            targets.len(),
            targets.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            targets,
            db,
            default_image: config.image.clone(),
            local_dir: config
                .singularity
                .local_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_DIR)),
        })
    }

    fn target(&self, host: &str) -> Result<&SshTarget, RuntimeError> {
        self.targets
            .iter()
            .find(|t| t.to_string() == host)
            .ok_or_else(|| RuntimeError::NotFound(format!("singularity host '{host}'")))
    }

    async fn all_instances(&self) -> Result<Vec<(&SshTarget, InstanceInfo)>, RuntimeError> {
        let per_target =
            try_join_all(self.targets.iter().map(|target| target.list_instances(None))).await?;

        Ok(self
            .targets
            .iter()
            .zip(per_target)
            .flat_map(|(target, instances)| instances.into_iter().map(move |i| (target, i)))
            .collect())
    }

    /// Cluster spec stored in `instance`, `None` for foreign instances.
    async fn instance_spec(&self, target: &SshTarget, instance: &str) -> Option<Spec> {
        let command = format!(
            "singularity exec instance://{} cat {CLUSTER_SPEC_PATH}",
            quote(instance)
        );

        match target.run(&command, None).await {
            Ok(output) if output.success() => Spec::from_json(&output.text()).ok(),
            Ok(_) => None,
            Err(error) => {
                debug!("Couldn't read the spec of {instance} on {target}: {error}");
                None
            }
        }
    }

    /// Instances of the cluster `name` with the spec they carry.
    async fn cluster_instances(
        &self,
        name: &str,
    ) -> Result<Vec<(&SshTarget, InstanceInfo, Spec)>, RuntimeError> {
        let prefix = format!("{name}-");
        let mut found = Vec::new();

        for (target, instance) in self.all_instances().await? {
            if !instance.instance.starts_with(&prefix) {
                continue;
            }

            // `a-b` could also be a node of cluster `a`
            match self.instance_spec(target, &instance.instance).await {
                Some(spec) if spec.name() == Some(name) => found.push((target, instance, spec)),
                _ => {}
            }
        }

        Ok(found)
    }

    fn addresses(&self, ranges: &AddressRanges) -> Result<Vec<Ipv4Net>, RuntimeError> {
        let prefix = self.db.space().prefix_len();

        ranges
            .addresses()
            .map(|ip| {
                Ipv4Net::new(ip, prefix)
                    .map_err(|e| RuntimeError::Unsupported(format!("invalid address prefix: {e}")))
            })
            .collect()
    }

    async fn alloc_addresses(&self, name: &str, count: u64) -> Result<Vec<Ipv4Net>, RuntimeError> {
        let db = self.db.clone();
        let cluster = name.to_owned();
        let ranges = tokio::task::spawn_blocking(move || db.alloc_addr(&cluster, count))
            .await
            .map_err(|e| RuntimeError::Transport(format!("address table task failed: {e}")))?
            .map_err(RuntimeError::AddressDb)?;

        self.addresses(&ranges)
    }

    async fn free_addresses(&self, name: &str) -> Result<(), RuntimeError> {
        let db = self.db.clone();
        let cluster = name.to_owned();

        tokio::task::spawn_blocking(move || db.free_addr(&cluster))
            .await
            .map_err(|e| RuntimeError::Transport(format!("address table task failed: {e}")))?
            .map_err(RuntimeError::AddressDb)
    }

    async fn allocation(&self, name: &str) -> Result<Option<AddressRanges>, RuntimeError> {
        let db = self.db.clone();
        let name = name.to_owned();

        tokio::task::spawn_blocking(move || db.allocation(&name))
            .await
            .map_err(|e| RuntimeError::Transport(format!("address table task failed: {e}")))?
            .map_err(RuntimeError::AddressDb)
    }

    fn instance_params(
        &self,
        metadata: &ClusterMetadata,
        node: &NodeSpec,
        settings: NodeSettings,
        address: Option<Ipv4Net>,
    ) -> Result<InstanceParams, RuntimeError> {
        let name = instance_name(&metadata.name, &node.hostname);

        Ok(InstanceParams {
            settings,
            hostname: node.hostname.clone(),
            aliases: metadata.aliases_of(&node.hostname).to_vec(),
            cluster: metadata.name.clone(),
            address,
            cluster_json: metadata.spec.to_json(),
            node_json: serde_json::to_string(node)
                .map_err(|e| RuntimeError::Unsupported(format!("node spec of {name}: {e}")))?,
            workdir: self.local_dir.join(&name),
            name,
        })
    }

    /// Starts every launch of one host in order, stopping at the first
    /// failure.
    ///
    /// Everything that was attempted is handed back, including the instance
    /// that failed, so that a failed launch can be cleaned up.
    async fn launch_on_host(
        &self,
        host: &str,
        launches: Vec<(usize, InstanceParams)>,
    ) -> (Vec<(usize, SingularityContainer)>, Option<RuntimeError>) {
        let target = match self.target(host) {
            Ok(target) => target,
            Err(error) => return (Vec::new(), Some(error)),
        };
        let mut attempted = Vec::with_capacity(launches.len());

        for (order, params) in launches {
            let container = SingularityContainer::new(target.clone(), params);
            let result = container.start().await;
            attempted.push((order, container));

            if let Err(error) = result {
                return (attempted, Some(error));
            }
        }

        (attempted, None)
    }

    /// Builds and starts the instances of `launches`, `addresses` being in
    /// node order.
    async fn start_instances(
        &self,
        metadata: &ClusterMetadata,
        launches: Vec<NodeLaunch>,
        addresses: &[Ipv4Net],
    ) -> Result<Vec<(usize, SingularityContainer)>, RuntimeError> {
        let mut per_host: BTreeMap<String, Vec<(usize, InstanceParams)>> = BTreeMap::new();
        for launch in launches {
            let address = addresses.get(launch.order).copied().ok_or_else(|| {
                RuntimeError::Unsupported(format!(
                    "'{}' got {} address(es), node {} has none",
                    metadata.name,
                    addresses.len(),
                    launch.node.hostname
                ))
            })?;
            let params =
                self.instance_params(metadata, &launch.node, launch.settings, Some(address))?;

            if !params.settings.binds.is_empty() {
                warn!("Port binds of {} are ignored by singularity instances", params.name);
            }

            per_host
                .entry(launch.host)
                .or_default()
                .push((launch.order, params));
        }

        info!(
            "Starting {} instance(s) on {} host(s)...",
            addresses.len(),
            per_host.len()
        );

        let mut attempted = Vec::new();
        let mut failure = None;
        for (started, error) in join_all(
            per_host
                .into_iter()
                .map(|(host, launches)| async move { self.launch_on_host(&host, launches).await }),
        )
        .await
        {
            attempted.extend(started);
            failure = failure.or(error);
        }

        if let Some(error) = failure {
            for (_, container) in &attempted {
                if let Err(cleanup) = container.remove(true).await {
                    warn!("Couldn't stop {}: {cleanup}", container.name());
                }
            }

            return Err(error);
        }

        attempted.sort_by_key(|(order, _)| *order);

        Ok(attempted)
    }
}

pub(crate) fn instance_name(cluster: &str, hostname: &str) -> String {
    format!("{cluster}-{hostname}")
}

#[async_trait]
impl ClusterBackend for SingularityBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Singularity
    }

    fn default_image(&self) -> &str {
        &self.default_image
    }

    async fn host_loads(&self) -> Result<Vec<HostLoad>, RuntimeError> {
        try_join_all(self.targets.iter().map(|target| async move {
            Ok::<_, RuntimeError>(HostLoad {
                host: target.to_string(),
                load: target.list_instances(None).await?.len(),
            })
        }))
        .await
    }

    async fn lookup(&self, name: &str) -> Result<Option<ClusterMetadata>, RuntimeError> {
        match self.cluster_instances(name).await?.into_iter().next() {
            Some((_, _, spec)) => ClusterMetadata::from_spec(spec)
                .map(Some)
                .map_err(RuntimeError::Spec),
            None => Ok(None),
        }
    }

    async fn provision(
        &self,
        metadata: &ClusterMetadata,
        launches: Vec<NodeLaunch>,
    ) -> Result<Vec<Arc<dyn Container>>, RuntimeError> {
        let addresses = self
            .alloc_addresses(&metadata.name, launches.len() as u64)
            .await?;

        match self.start_instances(metadata, launches, &addresses).await {
            Ok(started) => Ok(started
                .into_iter()
                .map(|(_, c)| Arc::new(c) as Arc<dyn Container>)
                .collect()),
            Err(error) => {
                if let Err(cleanup) = self.free_addresses(&metadata.name).await {
                    warn!("Couldn't release the addresses of '{}': {cleanup}", metadata.name);
                }

                Err(error)
            }
        }
    }

    async fn containers(
        &self,
        metadata: &ClusterMetadata,
    ) -> Result<Vec<Arc<dyn Container>>, RuntimeError> {
        let cluster = metadata.spec.cluster().map_err(RuntimeError::Spec)?;
        let addresses = match self.allocation(&metadata.name).await? {
            Some(ranges) => self.addresses(&ranges)?,
            None => Vec::new(),
        };
        let running = self
            .all_instances()
            .await?
            .into_iter()
            .map(|(target, i)| (i.instance, target))
            .collect::<BTreeMap<_, _>>();
        let host_tz = host_timezone();

        let mut containers = Vec::new();
        for (order, node) in cluster.nodes.iter().enumerate() {
            let name = instance_name(&metadata.name, &node.hostname);
            let Some(target) = running.get(&name) else {
                continue;
            };

            let settings = cluster
                .node_settings(node, &self.default_image, &host_tz)
                .map_err(RuntimeError::Spec)?;
            let params =
                self.instance_params(metadata, node, settings, addresses.get(order).copied())?;
            containers.push(Arc::new(SingularityContainer::new((*target).clone(), params))
                as Arc<dyn Container>);
        }

        Ok(containers)
    }

    async fn list(&self) -> Result<Vec<String>, RuntimeError> {
        let mut names = BTreeSet::new();

        for (target, instance) in self.all_instances().await? {
            if let Some(name) = self
                .instance_spec(target, &instance.instance)
                .await
                .and_then(|spec| spec.name().map(str::to_owned))
            {
                names.insert(name);
            }
        }

        Ok(names.into_iter().collect())
    }

    async fn teardown(&self, name: &str) -> Result<(), RuntimeError> {
        for (target, instance, _) in self.cluster_instances(name).await? {
            let command = format!("singularity instance stop {}", quote(&instance.instance));

            match target.run(&command, None).await {
                Ok(output) if output.success() => debug!("Stopped {}", instance.instance),
                Ok(output) => warn!(
                    "Couldn't stop {} on {target}: {}",
                    instance.instance,
                    output.text().trim()
                ),
                Err(error) => warn!("Couldn't stop {} on {target}: {error}", instance.instance),
            }
        }

        self.free_addresses(name).await?;

        info!("Removed the instances of '{name}'");

        Ok(())
    }
}
