use std::{
    fs::File,
    io::stdin,
    path::Path,
    sync::Arc,
};

use anyhow::{anyhow, Context};
use log::debug;
use vcluster_core::{
    config::RuntimeConfig,
    runtime::{backend_from_config, Cluster, ClusterBackend, Container},
    spec::Spec,
};

use crate::cli::GlobalArgs;

/// Everything commands share: the runtime config with command line overrides
/// applied.
pub struct ConfigContext {
    config: RuntimeConfig,
}

impl ConfigContext {
    pub fn new(global_args: &GlobalArgs) -> anyhow::Result<Self> {
        let config_path = match &global_args.config {
            Some(path) => {
                if path.file_name().is_none() {
                    return Err(anyhow!("Config path is invalid!"));
                }

                path.clone()
            }
            None => RuntimeConfig::default_path().context("Couldn't locate the config file!")?,
        };

        debug!("Used config path: {config_path:?}");

        let mut config =
            RuntimeConfig::load_or_default(&config_path).context("Couldn't load the config!")?;
        if let Some(backend) = global_args.backend {
            config.backend = backend.into();
        }

        Ok(Self { config })
    }

    pub fn create_backend(&self) -> anyhow::Result<Arc<dyn ClusterBackend>> {
        backend_from_config(&self.config).context(format!(
            "Couldn't initialize the {} backend!",
            self.config.backend
        ))
    }

    pub async fn get_cluster(&self, name: &str) -> anyhow::Result<Cluster> {
        Cluster::get(self.create_backend()?, name)
            .await
            .context(format!("Couldn't get '{name}' cluster!"))
    }
}

/// Reads and resolves a spec file, `-` being stdin.
pub fn read_spec(path: &Path) -> anyhow::Result<Spec> {
    let spec = if path == Path::new("-") {
        Spec::from_reader(stdin())
    } else {
        let file = File::open(path).context(format!("Couldn't open {path:?}!"))?;
        Spec::from_reader(file)
    };

    spec.context(format!("Couldn't resolve the spec from {path:?}!"))
}

pub fn find_node<'a>(cluster: &'a Cluster, node: &str) -> anyhow::Result<&'a Arc<dyn Container>> {
    cluster.get_container(node).ok_or(anyhow!(
        "'{node}' isn't a node of '{}' cluster!",
        cluster.name()
    ))
}
