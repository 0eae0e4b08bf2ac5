use anyhow::Context;
use log::info;

use crate::{
    cli::PushArgs,
    context::{find_node, ConfigContext},
};

pub async fn push(args: PushArgs, context: ConfigContext) -> anyhow::Result<()> {
    let content = tokio::fs::read(&args.source)
        .await
        .context(format!("Couldn't read {:?}!", args.source))?;
    let cluster = context.get_cluster(&args.name).await?;
    let node = find_node(&cluster, &args.node)?;

    node.write_file(&args.destination, &content, args.user.as_deref())
        .await
        .context(format!(
            "Couldn't write {} on {}!",
            args.destination,
            node.hostname()
        ))?;

    info!(
        "Copied {} byte(s) to {}:{}",
        content.len(),
        node.hostname(),
        args.destination
    );

    Ok(())
}
