//! Command-line interface for the hub
//!
//! `serve` runs the hub (the default when no subcommand is given);
//! `validate` parses and validates a configuration file, echoing the
//! normalized document.

use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};

use crate::config::Config;
use crate::secrets::{EnvSecretsProvider, SecretsProvider};
use crate::{Result, constants};

fn build_cli() -> Command {
    Command::new("mcphub")
        .about("MCP hub - one MCP endpoint over many upstream tool servers")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Path to the configuration file")
                .default_value(constants::CONFIG_FILE_NAME),
        )
        .subcommand(
            Command::new("serve")
                .about("Start the hub server")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .value_name("HOST")
                        .help("Override the bind host"),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_name("PORT")
                        .help("Override the bind port"),
                ),
        )
        .subcommand(Command::new("validate").about("Validate the configuration and print it"))
}

async fn load_config(matches: &ArgMatches) -> Result<Config> {
    let provider: Arc<dyn SecretsProvider> = Arc::new(EnvSecretsProvider::new());
    let path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(constants::CONFIG_FILE_NAME);
    Config::load_from_path(path, &provider).await
}

async fn handle_serve(matches: &ArgMatches, serve_matches: Option<&ArgMatches>) -> Result<()> {
    let mut config = load_config(matches).await?;

    if let Some(serve_matches) = serve_matches {
        if let Some(host) = serve_matches.get_one::<String>("host") {
            config.host = host.clone();
        }
        if let Some(port) = serve_matches
            .get_one::<String>("port")
            .and_then(|p| p.parse::<u16>().ok())
        {
            config.port = port;
        }
        config.validate()?;
    }

    crate::http::start_server(config).await
}

/// Main CLI entry point
pub async fn run() -> Result<()> {
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("serve", serve_matches)) => handle_serve(&matches, Some(serve_matches)).await,
        Some(("validate", _)) => {
            let config = load_config(&matches).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        // no subcommand: serve with the plain configuration
        _ => handle_serve(&matches, None).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve_overrides() {
        let matches = build_cli()
            .try_get_matches_from(["mcphub", "serve", "--port", "8080"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "serve");
        assert_eq!(sub.get_one::<String>("port").unwrap(), "8080");
    }

    #[test]
    fn config_flag_is_global() {
        let matches = build_cli()
            .try_get_matches_from(["mcphub", "--config", "custom.yaml", "validate"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("config").unwrap(), "custom.yaml");
    }
}
