use pipebus_app::app::App;
use pipebus_app::config::AppConfig;
use pipebus_core::task::runner::Runner;
use std::env;
use std::path::PathBuf;
use std::process;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Environment variable naming the configuration file.
const CONFIG_PATH: &str = "CONFIG_PATH";

#[tokio::main]
async fn main() {
    // Install global log collector, filtered by RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = env::var(CONFIG_PATH).ok().map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).unwrap_or_else(|err| {
        error!("Failed to load configuration: {}", err);
        process::exit(1);
    });

    if let Err(err) = (App { config }).run().await {
        error!("{}", err);
        process::exit(1);
    }
}
