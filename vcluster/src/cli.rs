use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use vcluster_core::config::BackendKind;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    #[command(flatten)]
    pub global_args: GlobalArgs,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// override the default config file (~/.vcluster/config.yaml or $VCLUSTER_CONFIG)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,
    /// override the backend selected in the config file
    #[arg(short = 'b', long, global = true, value_enum)]
    pub backend: Option<BackendArg>,
    /// enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose_logging: bool,
    /// enable trace output (more detailed than verbose, overrides it if present)
    #[arg(long = "trace", global = true)]
    pub trace_logging: bool,
}

impl GlobalArgs {
    pub fn get_log_level(&self) -> LogLevel {
        if self.trace_logging {
            return LogLevel::Trace;
        }

        if self.verbose_logging {
            return LogLevel::Verbose;
        }

        LogLevel::Normal
    }
}

pub enum LogLevel {
    Normal,
    Verbose,
    Trace,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Docker,
    Singularity,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Docker => BackendKind::Docker,
            BackendArg::Singularity => BackendKind::Singularity,
        }
    }
}

#[derive(Debug, Subcommand)]
#[command(arg_required_else_help = true)]
pub enum Commands {
    /// create a virtual cluster from a spec file (or attach to the identical running one)
    #[command(alias = "c")]
    Create(CreateArgs),
    /// show the nodes of a virtual cluster
    #[command(alias = "g")]
    Get(GetArgs),
    /// list virtual clusters managed by the backend
    #[command(alias = "l")]
    List(ListArgs),
    /// remove a virtual cluster with all of its nodes
    #[command(alias = "rm")]
    Remove(RemoveArgs),
    /// run a command on a node
    #[command(alias = "x")]
    Exec(ExecArgs),
    /// print a spec file with templates and substitutions resolved
    Resolve(ResolveArgs),
    /// copy a local file to a node
    Push(PushArgs),
    /// copy a file from a node
    Pull(PullArgs),
    /// rewrite /etc/hosts of every node of a cluster
    UpdateHosts(UpdateHostsArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// prints only names
    Names,
    /// prints a table
    Table,
    /// prints a table with headers
    TableWithHeaders,
    /// prints a JSON
    Json,
    /// prints a human-readable JSON
    JsonPretty,
    /// prints a YAML
    Yaml,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SpecFormat {
    Json,
    JsonPretty,
    Yaml,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// YAML or JSON spec file, `-` reads it from stdin
    pub spec: PathBuf,
    /// seconds to wait for every node to come up
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,
    /// output format
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::TableWithHeaders)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// name of the cluster
    pub name: String,
    /// output format
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::TableWithHeaders)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// output format
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Names)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct RemoveArgs {
    /// name of the cluster
    pub name: String,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// name of the cluster
    pub name: String,
    /// hostname, alias or container name of the node
    pub node: String,
    /// user to run the command as
    #[arg(short = 'u', long)]
    pub user: Option<String>,
    /// extra environment variables (KEY=VALUE)
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,
    /// file fed to the command's stdin, `-` forwards this process' stdin
    #[arg(short = 'i', long, conflicts_with_all = ["user", "env"])]
    pub input: Option<PathBuf>,
    /// command to run, a single argument is handed to a shell as is
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// YAML or JSON spec file, `-` reads it from stdin
    pub spec: PathBuf,
    /// output format
    #[arg(short = 'o', long, value_enum, default_value_t = SpecFormat::Yaml)]
    pub output: SpecFormat,
}

#[derive(Debug, Args)]
pub struct PushArgs {
    /// name of the cluster
    pub name: String,
    /// hostname, alias or container name of the node
    pub node: String,
    /// local file to copy
    pub source: PathBuf,
    /// path on the node
    pub destination: String,
    /// user owning the written file
    #[arg(short = 'u', long)]
    pub user: Option<String>,
}

#[derive(Debug, Args)]
pub struct PullArgs {
    /// name of the cluster
    pub name: String,
    /// hostname, alias or container name of the node
    pub node: String,
    /// path on the node
    pub source: String,
    /// local file to write, stdout if unset
    pub destination: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct UpdateHostsArgs {
    /// name of the cluster
    pub name: String,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exec_takes_everything_after_the_separator() {
        let cli = Cli::parse_from([
            "vcluster", "exec", "c1", "agg", "-e", "A=1", "--", "ls", "-l", "/",
        ]);

        let Some(Commands::Exec(args)) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.node, "agg");
        assert_eq!(args.env, ["A=1"]);
        assert_eq!(args.command, ["ls", "-l", "/"]);
    }

    #[test]
    fn exec_input_goes_without_user_or_env() {
        let cli = Cli::parse_from(["vcluster", "exec", "c1", "agg", "-i", "-", "--", "wc", "-c"]);

        let Some(Commands::Exec(args)) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.input, Some(PathBuf::from("-")));

        let conflicting = Cli::try_parse_from([
            "vcluster", "exec", "c1", "agg", "-i", "x", "-u", "root", "--", "cat",
        ]);
        assert!(conflicting.is_err());
    }

    #[test]
    fn backend_can_be_overridden_globally() {
        let cli = Cli::parse_from(["vcluster", "list", "--backend", "singularity", "-v"]);

        assert!(matches!(cli.global_args.backend, Some(BackendArg::Singularity)));
        assert!(matches!(cli.global_args.get_log_level(), LogLevel::Verbose));
    }
}
