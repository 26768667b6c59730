mod auth;
mod config;
mod duplex;
mod error;
mod handshake;
mod protocol;
mod proxy;
mod resolver;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let config = match config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = proxy::run(config).await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
