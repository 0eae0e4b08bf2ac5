use std::{
    collections::BTreeMap,
    io::{stdin, stdout, Read, Write},
    path::Path,
};

use anyhow::{anyhow, Context};
use vcluster_core::runtime::Command;

use crate::{
    cli::ExecArgs,
    context::{find_node, ConfigContext},
};

/// Runs the command and returns its exit code.
pub async fn exec(args: ExecArgs, context: ConfigContext) -> anyhow::Result<i32> {
    let cluster = context.get_cluster(&args.name).await?;
    let node = find_node(&cluster, &args.node)?;
    let env = parse_env_args(&args.env)?;
    let command = to_command(args.command);

    let output = match &args.input {
        Some(path) => {
            let content = read_input(path).await?;
            node.pipe(&command, &content).await
        }
        None => node.exec_run(&command, &env, args.user.as_deref()).await,
    }
    .context(format!("Couldn't run '{command}' on {}!", node.hostname()))?;

    stdout()
        .write_all(&output.output)
        .context("Couldn't write the output!")?;

    Ok(output.exit_code.clamp(0, 255) as i32)
}

async fn read_input(path: &Path) -> anyhow::Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut content = Vec::new();
        stdin()
            .read_to_end(&mut content)
            .context("Couldn't read stdin!")?;

        return Ok(content);
    }

    tokio::fs::read(path)
        .await
        .context(format!("Couldn't read {path:?}!"))
}

fn to_command(mut args: Vec<String>) -> Command {
    if args.len() == 1 {
        Command::Shell(args.remove(0))
    } else {
        Command::Args(args)
    }
}

fn parse_env_args(env: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    env.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or(anyhow!("'{entry}' isn't a KEY=VALUE pair!"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_argument_goes_to_a_shell() {
        assert_eq!(
            to_command(vec!["ls /opt | wc -l".to_owned()]),
            Command::Shell("ls /opt | wc -l".to_owned())
        );
        assert_eq!(
            to_command(vec!["ls".to_owned(), "/opt".to_owned()]),
            Command::Args(vec!["ls".to_owned(), "/opt".to_owned()])
        );
    }

    #[tokio::test]
    async fn input_files_are_read_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        std::fs::write(&path, b"\x00\xFFdata").unwrap();

        assert_eq!(read_input(&path).await.unwrap(), b"\x00\xFFdata");
        assert!(read_input(&dir.path().join("missing")).await.is_err());
    }

    #[test]
    fn env_pairs_split_on_the_first_equals_sign() {
        let env = parse_env_args(&["A=1".to_owned(), "OPTS=x=y".to_owned()]).unwrap();

        assert_eq!(env["A"], "1");
        assert_eq!(env["OPTS"], "x=y");
        assert!(parse_env_args(&["NOPE".to_owned()]).is_err());
    }
}
