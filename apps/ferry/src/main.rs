//! Ferry command-line entry point.

mod config;
mod run;

use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::EnvFilter;

use crate::config::{FerryConfig, default_config_path};

fn cli() -> Command {
    Command::new("ferry")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sandboxed, resumable file transfers")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file (default ~/.config/ferry/ferry.toml)"),
        )
        .subcommand(
            Command::new("upload")
                .about("Upload a file or directory")
                .arg(Arg::new("local").required(true))
                .arg(Arg::new("remote").required(true)),
        )
        .subcommand(
            Command::new("download")
                .about("Download a file or directory")
                .arg(Arg::new("remote").required(true))
                .arg(Arg::new("local").required(true)),
        )
        .subcommand(
            Command::new("mkdir")
                .about("Create a remote directory")
                .arg(Arg::new("remote").required(true)),
        )
        .subcommand(
            Command::new("rm")
                .about("Delete a remote file or directory tree")
                .arg(Arg::new("remote").required(true)),
        )
        .subcommand(
            Command::new("mv")
                .about("Rename a remote entry")
                .arg(Arg::new("from").required(true))
                .arg(Arg::new("to").required(true)),
        )
        .subcommand(
            Command::new("ls")
                .about("List a remote directory")
                .arg(Arg::new("remote").required(true)),
        )
        .subcommand(
            Command::new("probe")
                .about("Check whether a remote directory is writable")
                .arg(Arg::new("remote").required(true)),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Only print final task states"),
        )
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> anyhow::Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow::anyhow!("missing argument <{name}>"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = FerryConfig::load(&config_path)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        sandbox = %config.sandbox_root,
        "starting ferry"
    );

    let quiet = matches.get_flag("quiet");
    let app = run::App::start(&config, quiet)?;

    match matches.subcommand() {
        Some(("upload", m)) => app.upload(arg(m, "local")?, arg(m, "remote")?).await,
        Some(("download", m)) => app.download(arg(m, "remote")?, arg(m, "local")?).await,
        Some(("mkdir", m)) => app.mkdir(arg(m, "remote")?).await,
        Some(("rm", m)) => app.delete(arg(m, "remote")?).await,
        Some(("mv", m)) => app.rename(arg(m, "from")?, arg(m, "to")?).await,
        Some(("ls", m)) => app.list(arg(m, "remote")?).await,
        Some(("probe", m)) => app.probe(arg(m, "remote")?).await,
        _ => anyhow::bail!("unknown command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn parses_global_config_after_subcommand() {
        let matches = cli()
            .try_get_matches_from(["ferry", "upload", "a.bin", "/data/a.bin", "-c", "f.toml"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("config").unwrap(), "f.toml");
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "upload");
        assert_eq!(arg(sub, "remote").unwrap(), "/data/a.bin");
    }

    #[test]
    fn subcommand_is_required() {
        assert!(cli().try_get_matches_from(["ferry"]).is_err());
    }
}
