//! Main entry point for the janus-proxy daemon.

use std::path::PathBuf;

use janus_proxy::{config::Config, daemon::Supervisor, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("JANUS_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("janus.toml"));

    let config = Config::load_from(&config_path)?;
    let supervisor = Supervisor::new(config).with_config_path(config_path);
    supervisor.run().await
}
