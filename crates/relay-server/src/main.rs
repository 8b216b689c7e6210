//! # Relay Server
//!
//! Relays a filtered upstream stream to any number of WebSocket clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with custom config
//! relay --config /path/to/relay.toml
//!
//! # Run with environment variables
//! RELAY_PORT=8081 RELAY_QUERY='#rustlang' RELAY_BEARER_TOKEN=... relay
//!
//! # Sign upstream requests with OAuth 1.0a user credentials
//! RELAY_CONSUMER_KEY=... RELAY_CONSUMER_SECRET=... \
//!     RELAY_ACCESS_TOKEN_KEY=... RELAY_ACCESS_TOKEN_SECRET=... relay
//! ```

mod config;
mod handlers;
mod metrics;
mod oauth;
mod upstream;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relays a filtered upstream stream to WebSocket clients", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,relay_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let args = Args::parse();
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!("Starting relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_path_parsing() {
        let args = Args::try_parse_from(["relay"]).unwrap();
        assert_eq!(args.config, None);

        let args = Args::try_parse_from(["relay", "--config", "relay.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("relay.toml")));

        let args = Args::try_parse_from(["relay", "-c", "relay.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("relay.toml")));

        let args = Args::try_parse_from(["relay", "--config=/etc/relay.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/relay.toml")));

        assert!(Args::try_parse_from(["relay", "--config"]).is_err());
        assert!(Args::try_parse_from(["relay", "--verbose"]).is_err());
    }
}
