use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (JUSTIRC_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("JUSTIRC_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("justirc_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = justirc_server::config::ServerConfig::parse();
    tracing::info!("Starting {} on {}", config.server_name, config.listen_addr());
    if config.require_authentication {
        tracing::info!("Authentication is mandatory for registration");
    }
    if config.enable_ip_whitelist {
        tracing::info!("IP filter running in whitelist mode");
    }

    let server = justirc_server::server::Server::new(config);
    server.run().await
}
