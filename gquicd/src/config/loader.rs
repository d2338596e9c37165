//! Configuration loading and parsing.
//!
//! Sources are layered with increasing priority: built-in defaults, the TOML
//! file, `GQUICD_` environment variables and finally command-line flags.

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config as ConfigLoader, Environment};
use std::path::{Path, PathBuf};

use super::ServerConfig;

/// Command-line interface for the server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "gquicd.toml")]
    pub config: String,

    /// Host address to bind to (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,

    /// Print the SNI of a captured client hello datagram and exit
    #[arg(long, value_name = "FILE")]
    pub extract_sni: Option<PathBuf>,
}

/// Load and parse server configuration.
///
/// The one-shot flags (`--print-default-config`, `--extract-sni`,
/// `--validate`) exit the process once handled.
pub fn load_config() -> Result<ServerConfig> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        print_default_config()?;
        std::process::exit(0);
    }

    if let Some(ref path) = cli.extract_sni {
        match extract_sni(path)? {
            Some(name) => println!("{}", name),
            None => println!("client hello carries no SNI"),
        }
        std::process::exit(0);
    }

    let config = resolve(&cli, env_source())?;

    if cli.validate {
        println!("✓ Configuration is valid");
        std::process::exit(0);
    }

    Ok(config)
}

/// Apply every configuration layer for `cli` and validate the result.
pub(crate) fn resolve(cli: &CliArgs, env: Environment) -> Result<ServerConfig> {
    let mut config = load_config_file(&cli.config)?;
    apply_env_overrides(&mut config, env)?;
    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;

    Ok(config)
}

/// Load configuration from a TOML file.
pub(crate) fn load_config_file(path: &str) -> Result<ServerConfig> {
    let path_obj = Path::new(path);

    // If file doesn't exist, use default config
    if !path_obj.exists() {
        tracing::warn!(
            config_path = %path,
            "Configuration file not found, using defaults"
        );
        return Ok(ServerConfig::default());
    }

    let config_str = std::fs::read_to_string(path_obj)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    toml::from_str(&config_str).with_context(|| format!("Failed to parse TOML config: {}", path))
}

/// Process environment, `GQUICD_` prefix with `__` between nested keys.
///
/// Examples:
/// - `GQUICD_NETWORK__HOST=127.0.0.1`
/// - `GQUICD_LOGGING__LEVEL=debug`
/// - `GQUICD_SESSION__IDLE_TIMEOUT_SECS=60`
pub(crate) fn env_source() -> Environment {
    Environment::with_prefix("GQUICD")
        .prefix_separator("_")
        .separator("__")
}

/// Apply environment variable overrides.
fn apply_env_overrides(config: &mut ServerConfig, env: Environment) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(env)
        .build()
        .context("Failed to load environment variables")?;

    if let Ok(host) = env_config.get_string("network.host") {
        config.network.host = host;
    }
    if let Ok(port) = env_config.get_int("network.port") {
        config.network.port =
            u16::try_from(port).with_context(|| format!("GQUICD_NETWORK__PORT out of range: {}", port))?;
    }
    if let Ok(level) = env_config.get_string("logging.level") {
        match level.parse() {
            Ok(parsed_level) => config.logging.level = parsed_level,
            Err(_) => tracing::warn!(level = %level, "Invalid log level in environment, ignoring"),
        }
    }
    if let Ok(sni) = env_config.get_string("sni") {
        config.sni = Some(sni);
    }
    if let Ok(secs) = env_config.get_int("session.idle_timeout_secs") {
        config.session.idle_timeout_secs = u64::try_from(secs).ok().filter(|secs| *secs > 0);
    }

    Ok(())
}

/// Apply command-line argument overrides.
fn apply_cli_overrides(config: &mut ServerConfig, cli: &CliArgs) {
    if let Some(ref host) = cli.host {
        config.network.host = host.clone();
    }

    if let Some(port) = cli.port {
        config.network.port = port;
    }

    if let Some(ref level_str) = cli.log_level {
        if let Ok(level) = level_str.parse() {
            config.logging.level = level;
        } else {
            tracing::warn!(level = %level_str, "Invalid log level specified, ignoring");
        }
    }
}

/// Run the SNI extractor over a datagram captured to `path`.
pub(crate) fn extract_sni(path: &Path) -> Result<Option<String>> {
    let datagram =
        std::fs::read(path).with_context(|| format!("Failed to read datagram: {}", path.display()))?;
    gquic::sni::parse_client_hello_sni(&datagram)
        .with_context(|| format!("Not a client hello: {}", path.display()))
}

/// Print the default configuration in TOML format.
fn print_default_config() -> Result<()> {
    let default_config = ServerConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;
    println!("{}", toml_str);
    Ok(())
}
