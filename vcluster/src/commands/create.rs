use std::time::Duration;

use anyhow::{anyhow, Context};
use log::info;
use vcluster_core::runtime::Cluster;

use crate::{cli::CreateArgs, commands::get::print_nodes, context::{read_spec, ConfigContext}};

pub async fn create(args: CreateArgs, context: ConfigContext) -> anyhow::Result<()> {
    let spec = read_spec(&args.spec)?;
    let name = spec
        .name()
        .ok_or(anyhow!("The spec doesn't name the cluster!"))?
        .to_owned();
    let backend = context.create_backend()?;

    info!("Creating '{name}' cluster...");

    let cluster = Cluster::create(backend, spec)
        .await
        .context(format!("Couldn't create '{name}' cluster!"))?;

    if !cluster.wait_running(Duration::from_secs(args.timeout)).await? {
        return Err(anyhow!(
            "'{name}' cluster didn't come up in {} seconds!",
            args.timeout
        ));
    }

    info!("Cluster '{name}' is up!");

    print_nodes(&cluster, args.output).await
}
