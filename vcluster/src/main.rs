use clap::Parser;
use cli::{Commands, GlobalArgs, LogLevel};
use commands::{
    create::create, exec::exec, get::get, list::list, pull::pull, push::push, remove::remove,
    resolve::resolve, update_hosts::update_hosts,
};
use context::ConfigContext;
use env_logger::Target;
use log::LevelFilter;

use crate::cli::Cli;

mod cli;
mod commands;
mod context;
mod output;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    configure_logging(&cli.global_args);

    let Some(command) = cli.command else {
        return Ok(());
    };

    let global_args = cli.global_args;
    let context = || ConfigContext::new(&global_args);

    match command {
        Commands::Create(args) => create(args, context()?).await?,
        Commands::Get(args) => get(args, context()?).await?,
        Commands::List(args) => list(args, context()?).await?,
        Commands::Remove(args) => remove(args, context()?).await?,
        Commands::Exec(args) => {
            let exit_code = exec(args, context()?).await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        Commands::Resolve(args) => resolve(args)?,
        Commands::Push(args) => push(args, context()?).await?,
        Commands::Pull(args) => pull(args, context()?).await?,
        Commands::UpdateHosts(args) => update_hosts(args, context()?).await?,
    }

    Ok(())
}

fn configure_logging(global_args: &GlobalArgs) {
    let log_level = global_args.get_log_level();
    let mut logger = env_logger::builder();

    logger
        .format_timestamp(None)
        .format_module_path(matches!(log_level, LogLevel::Trace))
        .format_target(false)
        .format_level(false)
        .target(Target::Stderr);

    if let LogLevel::Normal = log_level {
        logger.filter(Some("vcluster"), LevelFilter::Info);
    }

    if let LogLevel::Verbose = log_level {
        logger.filter(Some("vcluster"), LevelFilter::Debug);
    }

    if let LogLevel::Trace = log_level {
        logger.filter(None, LevelFilter::Debug);
    }

    logger.init();
}
