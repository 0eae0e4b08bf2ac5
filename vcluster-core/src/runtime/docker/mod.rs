use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    sync::Arc,
};

use async_trait::async_trait;
use bollard::{
    container::{Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig, RemoveContainerOptions},
    errors::Error as DockerError,
    network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions},
    service::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, PortBinding},
    Docker, API_DEFAULT_VERSION,
};
use futures::future::try_join_all;
use log::{debug, info, warn};
use tokio::time::sleep;

use crate::{
    config::{BackendKind, DockerConfig, RuntimeConfig},
    helpers::{AndIf, AndIfSome},
    ip::SubnetLayout,
    runtime::{
        metadata::ClusterMetadata, ClusterBackend, Container, HostLoad, NodeLaunch, RuntimeError,
        POLL_INTERVAL,
    },
    CLUSTER_NAME_LABEL, HOSTNAME_LABEL, SPEC_LABEL,
};

use self::container::DockerContainer;

pub mod container;

const CONNECT_TIMEOUT_SECS: u64 = 120;
const LOCAL_ENGINE: &str = "localhost";
const CONTAINER_SHELL: &str = "/bin/bash";

pub(crate) fn is_status(error: &DockerError, code: u16) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

/// One container engine of the fleet.
#[derive(Debug, Clone)]
struct Engine {
    host: String,
    docker: Docker,
}

impl Engine {
    fn connect(endpoint: &str) -> Result<Self, RuntimeError> {
        let docker = if endpoint.starts_with("unix://") {
            Docker::connect_with_unix(endpoint, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(endpoint, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        .map_err(RuntimeError::Docker)?;

        Ok(Self {
            host: endpoint.to_owned(),
            docker,
        })
    }

    fn local() -> Result<Self, RuntimeError> {
        Ok(Self {
            host: LOCAL_ENGINE.to_owned(),
            docker: Docker::connect_with_local_defaults().map_err(RuntimeError::Docker)?,
        })
    }

    async fn cluster_containers(&self, name: &str) -> Result<Vec<(String, String)>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_owned(),
                vec![format!("{CLUSTER_NAME_LABEL}={name}")],
            )]),
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(RuntimeError::Docker)?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                let name = s.names?.into_iter().next()?.trim_start_matches('/').to_owned();
                let hostname = s.labels?.get(HOSTNAME_LABEL)?.clone();
                Some((name, hostname))
            })
            .collect())
    }
}

/// Clusters made of engine containers joined by one labelled network.
///
/// The network lives on the first engine of the fleet (the swarm manager when
/// there are more of them) and carries the cluster metadata.
pub struct DockerBackend {
    engines: Vec<Engine>,
    config: DockerConfig,
    default_image: String,
}

impl DockerBackend {
    pub fn connect(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let engines = if config.docker.hosts.is_empty() {
            vec![Engine::local()?]
        } else {
            config
                .docker
                .hosts
                .iter()
                .map(|endpoint| Engine::connect(endpoint))
                .collect::<Result<Vec<_>, _>>()?
        };

        debug!(
            "Using {} engine(s): {}",
            engines.len(),
            engines.iter().map(|e| e.host.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            engines,
            config: config.docker.clone(),
            default_image: config.image.clone(),
        })
    }

    fn manager(&self) -> &Engine {
        // connect() never leaves the fleet empty
        &self.engines[0]
    }

    fn engine(&self, host: &str) -> Result<&Engine, RuntimeError> {
        self.engines
            .iter()
            .find(|e| e.host == host)
            .ok_or_else(|| RuntimeError::NotFound(format!("engine '{host}'")))
    }

    async fn create_network(
        &self,
        metadata: &ClusterMetadata,
        layout: Option<&SubnetLayout>,
    ) -> Result<(), RuntimeError> {
        let labels = metadata.to_labels();
        let options = CreateNetworkOptions {
            name: metadata.name.clone(),
            driver: self.config.network_driver().to_owned(),
            attachable: true,
            labels,
            ..Default::default()
        }
        .and_if_some(
            || layout,
            |options, layout| CreateNetworkOptions {
                ipam: Ipam {
                    config: Some(vec![IpamConfig {
                        subnet: Some(layout.subnet().to_string()),
                        ip_range: Some(layout.engine_range().to_string()),
                        gateway: Some(layout.gateway().to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                ..options
            },
        );

        match self.manager().docker.create_network(options).await {
            Ok(_) => {
                info!(
                    "Created network '{}' ({})",
                    metadata.name,
                    self.config.network_driver()
                );
                Ok(())
            }
            Err(e) if is_status(&e, 409) => Err(RuntimeError::AlreadyExists {
                name: metadata.name.clone(),
                reason: format!(
                    "a network with this name appeared while creating the cluster, this could be \
                     an artifact from a previous run; check it with `docker network inspect {0}` \
                     and remove it with `docker network rm {0}`",
                    metadata.name
                ),
            }),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn launch(
        &self,
        engine: &Engine,
        metadata: &ClusterMetadata,
        launch: &NodeLaunch,
        ip: Option<Ipv4Addr>,
    ) -> Result<DockerContainer, RuntimeError> {
        let name = container_name(&metadata.name, &launch.node.hostname);
        let settings = &launch.settings;

        let (exposed_ports, port_bindings) = port_config(&settings.binds);
        let host_config = HostConfig {
            binds: Some(settings.mounts.iter().map(ToString::to_string).collect()),
            cap_add: Some(settings.cap_add.clone()),
            cap_drop: Some(settings.cap_drop.clone()),
            network_mode: Some(metadata.name.clone()),
            ..Default::default()
        }
        .and_if(!port_bindings.is_empty(), |config| HostConfig {
            port_bindings: Some(port_bindings),
            ..config
        });

        let endpoint = EndpointSettings {
            aliases: Some(metadata.aliases_of(&launch.node.hostname).to_vec()),
            ipam_config: ip.map(|ip| EndpointIpamConfig {
                ipv4_address: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(settings.image.clone()),
            hostname: Some(launch.node.hostname.clone()),
            cmd: Some(vec![CONTAINER_SHELL.to_owned()]),
            tty: Some(true),
            open_stdin: Some(true),
            env: Some(settings.env_list()),
            labels: Some(HashMap::from([
                (CLUSTER_NAME_LABEL.to_owned(), metadata.name.clone()),
                (HOSTNAME_LABEL.to_owned(), launch.node.hostname.clone()),
            ])),
            exposed_ports: Some(exposed_ports).filter(|p| !p.is_empty()),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(metadata.name.clone(), endpoint)]),
            }),
            ..Default::default()
        };

        engine
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(RuntimeError::Docker)?;

        debug!("Created {name} on {}", engine.host);

        let container = DockerContainer::new(
            engine.docker.clone(),
            engine.host.clone(),
            name,
            launch.node.hostname.clone(),
            metadata.aliases_of(&launch.node.hostname).to_vec(),
            metadata.name.clone(),
        );
        self.start_with_retries(&container).await?;

        Ok(container)
    }

    async fn start_with_retries(&self, container: &DockerContainer) -> Result<(), RuntimeError> {
        let attempts = self.config.start_attempts.max(1);
        let mut attempt = 1;

        loop {
            match container.start().await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < attempts => {
                    warn!(
                        "Starting {} failed (attempt {attempt}/{attempts}): {error}",
                        container.name()
                    );
                    attempt += 1;
                    sleep(POLL_INTERVAL).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Starts every launch of one engine in order.
    async fn launch_on_engine(
        &self,
        metadata: &ClusterMetadata,
        host: &str,
        launches: &[(&NodeLaunch, Option<Ipv4Addr>)],
    ) -> Result<Vec<(usize, DockerContainer)>, RuntimeError> {
        let engine = self.engine(host)?;
        let mut started = Vec::with_capacity(launches.len());

        for (launch, ip) in launches {
            let container = self.launch(engine, metadata, launch, *ip).await?;
            started.push((launch.order, container));
        }

        Ok(started)
    }
}

pub(crate) fn container_name(cluster: &str, hostname: &str) -> String {
    format!("{cluster}-{hostname}")
}

type PortConfig = (
    HashMap<String, HashMap<(), ()>>,
    HashMap<String, Option<Vec<PortBinding>>>,
);

/// `"10000"`/`"10000/udp"` -> host port into the engine's port maps.
fn port_config(binds: &BTreeMap<String, u16>) -> PortConfig {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();

    for (port, host_port) in binds {
        let port = if port.contains('/') {
            port.clone()
        } else {
            format!("{port}/tcp")
        };

        exposed.insert(port.clone(), HashMap::new());
        bindings.insert(
            port,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    (exposed, bindings)
}

#[async_trait]
impl ClusterBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn default_image(&self) -> &str {
        &self.default_image
    }

    async fn host_loads(&self) -> Result<Vec<HostLoad>, RuntimeError> {
        try_join_all(self.engines.iter().map(|engine| async move {
            let info = engine.docker.info().await.map_err(RuntimeError::Docker)?;

            Ok::<_, RuntimeError>(HostLoad {
                host: engine.host.clone(),
                load: info.containers_running.unwrap_or_default().max(0) as usize,
            })
        }))
        .await
    }

    async fn lookup(&self, name: &str) -> Result<Option<ClusterMetadata>, RuntimeError> {
        let network = match self
            .manager()
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => network,
            Err(e) if is_status(&e, 404) => return Ok(None),
            Err(e) => return Err(RuntimeError::Docker(e)),
        };

        let labels = network.labels.unwrap_or_default();
        if !ClusterMetadata::is_managed(&labels) {
            return Err(RuntimeError::AlreadyExists {
                name: name.to_owned(),
                reason: format!(
                    "network '{name}' wasn't created by vcluster (no '{SPEC_LABEL}' label), \
                     pick another cluster name or remove the network"
                ),
            });
        }

        ClusterMetadata::from_labels(&labels)
            .map(Some)
            .map_err(RuntimeError::Metadata)
    }

    async fn provision(
        &self,
        metadata: &ClusterMetadata,
        launches: Vec<NodeLaunch>,
    ) -> Result<Vec<Arc<dyn Container>>, RuntimeError> {
        let layout = metadata
            .spec
            .cluster()
            .map_err(RuntimeError::Spec)?
            .subnet
            .map(SubnetLayout::new);

        self.create_network(metadata, layout.as_ref()).await?;

        let addresses = layout
            .map(|l| l.static_addresses().take(launches.len()).collect::<Vec<_>>())
            .unwrap_or_default();
        if layout.is_some() && addresses.len() < launches.len() {
            return Err(RuntimeError::Unsupported(format!(
                "the subnet of '{}' is too small for {} node(s)",
                metadata.name,
                launches.len()
            )));
        }

        let mut per_host: BTreeMap<&str, Vec<(&NodeLaunch, Option<Ipv4Addr>)>> = BTreeMap::new();
        for launch in &launches {
            per_host
                .entry(launch.host.as_str())
                .or_default()
                .push((launch, addresses.get(launch.order).copied()));
        }

        info!(
            "Starting {} container(s) on {} engine(s)...",
            launches.len(),
            per_host.len()
        );

        let mut started = try_join_all(
            per_host
                .iter()
                .map(|(host, launches)| self.launch_on_engine(metadata, host, launches)),
        )
        .await?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
        started.sort_by_key(|(order, _)| *order);

        Ok(started
            .into_iter()
            .map(|(_, c)| Arc::new(c) as Arc<dyn Container>)
            .collect())
    }

    async fn containers(
        &self,
        metadata: &ClusterMetadata,
    ) -> Result<Vec<Arc<dyn Container>>, RuntimeError> {
        let per_engine = try_join_all(
            self.engines
                .iter()
                .map(|engine| engine.cluster_containers(&metadata.name)),
        )
        .await?;

        Ok(self
            .engines
            .iter()
            .zip(per_engine)
            .flat_map(|(engine, found)| {
                found.into_iter().map(move |(name, hostname)| {
                    let aliases = metadata.aliases_of(&hostname).to_vec();

                    Arc::new(DockerContainer::new(
                        engine.docker.clone(),
                        engine.host.clone(),
                        name,
                        hostname,
                        aliases,
                        metadata.name.clone(),
                    )) as Arc<dyn Container>
                })
            })
            .collect())
    }

    async fn list(&self) -> Result<Vec<String>, RuntimeError> {
        let options = ListNetworksOptions::<String> {
            filters: HashMap::from([("label".to_owned(), vec![SPEC_LABEL.to_owned()])]),
        };

        let networks = self
            .manager()
            .docker
            .list_networks(Some(options))
            .await
            .map_err(RuntimeError::Docker)?;

        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn teardown(&self, name: &str) -> Result<(), RuntimeError> {
        for engine in &self.engines {
            for (container, _) in engine.cluster_containers(name).await? {
                let options = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };

                if let Err(error) = engine.docker.remove_container(&container, Some(options)).await {
                    warn!("Couldn't remove {container} from {}: {error}", engine.host);
                }
            }
        }

        match self.manager().docker.remove_network(name).await {
            Ok(()) => {
                info!("Removed network '{name}'");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                debug!("Network '{name}' is already gone");
                Ok(())
            }
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_default_to_tcp() {
        let binds = BTreeMap::from([("10000".to_owned(), 20000), ("411/udp".to_owned(), 411)]);

        let (exposed, bindings) = port_config(&binds);

        assert!(exposed.contains_key("10000/tcp"));
        assert!(exposed.contains_key("411/udp"));
        assert_eq!(
            bindings["10000/tcp"].as_ref().unwrap()[0].host_port.as_deref(),
            Some("20000")
        );
    }

    #[test]
    fn server_errors_are_classified_by_status() {
        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "network with name x already exists".to_owned(),
        };

        assert!(is_status(&conflict, 409));
        assert!(!is_status(&conflict, 404));
    }

    #[test]
    fn containers_are_named_after_cluster_and_host() {
        assert_eq!(container_name("mycluster", "node-1"), "mycluster-node-1");
    }
}
