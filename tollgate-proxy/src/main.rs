//! tollgate x402 MCP proxy.
//!
//! # Usage
//!
//! ```bash
//! # Run with default config (config.toml in current directory)
//! cargo run -p tollgate-proxy --release
//!
//! # Custom config path and port
//! tollgate-proxy --config /etc/tollgate.toml --port 8080
//!
//! # Configure logging level
//! RUST_LOG=tollgate_mcp=debug,info tollgate-proxy
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to TOML configuration file (default: `config.toml`)
//! - `HOST` - Override bind address
//! - `PORT` - Override port
//! - `RUST_LOG` - Log level filter (default: `info`)
//!
//! A `.env` file in the working directory is loaded first.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tollgate_proxy::{ProxyConfig, ProxyError};

/// x402 payment proxy for MCP servers.
#[derive(Debug, Parser)]
#[command(name = "tollgate-proxy", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Bind address, overriding the configuration file.
    #[arg(long, env = "HOST")]
    host: Option<IpAddr>,

    /// Bind port, overriding the configuration file.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("Proxy failed: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ProxyError> {
    let config = ProxyConfig::load_from(&args.config)?.with_overrides(args.host, args.port);
    tollgate_proxy::run(config).await
}
