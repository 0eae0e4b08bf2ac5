use crate::{cli::ResolveArgs, context::read_spec, output::DocumentPrint};

pub fn resolve(args: ResolveArgs) -> anyhow::Result<()> {
    read_spec(&args.spec)?.print_document(args.output)
}
