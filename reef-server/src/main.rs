//! Binary entrypoint for `reef-server`.

mod app;
mod network;

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(error) = app::run() {
        eprintln!("failed to start reef-server: {error}");
        std::process::exit(1);
    }
}
