use std::io::{stdout, Write};

use anyhow::Context;
use log::info;

use crate::{
    cli::PullArgs,
    context::{find_node, ConfigContext},
};

pub async fn pull(args: PullArgs, context: ConfigContext) -> anyhow::Result<()> {
    let cluster = context.get_cluster(&args.name).await?;
    let node = find_node(&cluster, &args.node)?;

    let content = node
        .read_file(&args.source)
        .await
        .context(format!("Couldn't read {} on {}!", args.source, node.hostname()))?;

    match args.destination {
        Some(destination) => {
            tokio::fs::write(&destination, &content)
                .await
                .context(format!("Couldn't write {destination:?}!"))?;

            info!(
                "Copied {} byte(s) from {}:{}",
                content.len(),
                node.hostname(),
                args.source
            );
        }
        None => stdout()
            .write_all(&content)
            .context("Couldn't write the output!")?,
    }

    Ok(())
}
