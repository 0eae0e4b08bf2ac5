use anyhow::Context;
use log::info;
use vcluster_core::runtime::{Cluster, RuntimeError};

use crate::{cli::RemoveArgs, context::ConfigContext};

pub async fn remove(args: RemoveArgs, context: ConfigContext) -> anyhow::Result<()> {
    let cluster = match Cluster::get(context.create_backend()?, &args.name).await {
        Ok(cluster) => cluster,
        Err(RuntimeError::NotFound(_)) => {
            info!("Couldn't find '{}' cluster!", args.name);
            return Ok(());
        }
        Err(error) => {
            return Err(error).context(format!("Couldn't get '{}' cluster!", args.name))
        }
    };

    info!("Removing '{}' cluster...", args.name);

    cluster
        .remove()
        .await
        .context(format!("Couldn't remove '{}' cluster!", args.name))?;

    info!("Cluster successfully removed!");

    Ok(())
}
