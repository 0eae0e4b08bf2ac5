use std::net::Ipv4Addr;

use futures::future::try_join_all;
use serde::Serialize;
use vcluster_core::runtime::{Cluster, Container};
use vcluster_macros::TableOutputRow;

use crate::{
    cli::{GetArgs, OutputFormat},
    context::ConfigContext,
    output::{CliPrint, TableCellOption, TableCellSlice},
};

pub async fn get(args: GetArgs, context: ConfigContext) -> anyhow::Result<()> {
    let cluster = context.get_cluster(&args.name).await?;

    print_nodes(&cluster, args.output).await
}

pub async fn print_nodes(cluster: &Cluster, format: OutputFormat) -> anyhow::Result<()> {
    let states = try_join_all(cluster.containers().iter().map(|c| async move {
        let running = c.is_running().await?;
        let ip = if running { c.ip_addr().await? } else { None };

        Ok::<_, anyhow::Error>((running, ip))
    }))
    .await?;

    let views = cluster
        .containers()
        .iter()
        .zip(states)
        .map(|(container, (running, ip))| NodeView {
            hostname: container.hostname(),
            name: container.name(),
            host: container.host(),
            ip: ip.into(),
            aliases: container.aliases().into(),
            state: if running { "running" } else { "stopped" },
        })
        .collect::<Vec<_>>();

    views.print(format)
}

#[derive(Serialize, TableOutputRow)]
struct NodeView<'a> {
    #[name_column]
    pub hostname: &'a str,
    #[column(header = "CONTAINER")]
    pub name: &'a str,
    pub host: &'a str,
    pub ip: TableCellOption<Ipv4Addr>,
    pub aliases: TableCellSlice<'a, String>,
    pub state: &'a str,
}
