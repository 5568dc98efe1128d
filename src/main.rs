mod app;
mod auth;
mod config;
mod protocol;
mod server;
mod state;
mod stats;
mod tunnel;

use clap::Parser;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate()?;
    init_tracing(&config);
    app::run(config).await
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_new(config.log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
