use serde::Serialize;
use vcluster_core::{config::BackendKind, runtime::Cluster};
use vcluster_macros::TableOutputRow;

use crate::{cli::ListArgs, context::ConfigContext, output::CliPrint};

pub async fn list(args: ListArgs, context: ConfigContext) -> anyhow::Result<()> {
    let backend = context.create_backend()?;
    let names = Cluster::list(backend.as_ref()).await?;
    let views = names
        .iter()
        .map(|name| ClusterView {
            name,
            backend: backend.kind(),
        })
        .collect::<Vec<_>>();

    views.print(args.output)
}

#[derive(Serialize, TableOutputRow)]
struct ClusterView<'a> {
    #[name_column]
    pub name: &'a str,
    pub backend: BackendKind,
}
