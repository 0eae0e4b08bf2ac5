use anyhow::Context;
use log::info;

use crate::{cli::UpdateHostsArgs, context::ConfigContext};

pub async fn update_hosts(args: UpdateHostsArgs, context: ConfigContext) -> anyhow::Result<()> {
    let cluster = context.get_cluster(&args.name).await?;

    cluster
        .update_etc_hosts()
        .await
        .context(format!("Couldn't update /etc/hosts of '{}' cluster!", args.name))?;

    info!(
        "Updated /etc/hosts on {} node(s)",
        cluster.containers().len()
    );

    Ok(())
}
