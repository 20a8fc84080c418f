//! Process composition root for `reef-server`.

use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use reef_common::config::{NetworkMode, PoolLimits, ServerConfig};
use reef_common::error::{ReefError, ReefResult};
use reef_storage::{MemoryStore, Storage};

use crate::network::NetworkServer;
use crate::network::blocking::BlockingServer;
use crate::network::reactor::ReactorServer;

/// Builds the configuration, wires the storage engine, and runs the selected deployment until
/// the process is terminated.
///
/// # Errors
///
/// Returns `ReefError::InvalidConfig` for malformed environment overrides and any setup error
/// surfaced by `start`.
pub fn run() -> ReefResult<()> {
    let config = config_from_env()?;
    let storage: Arc<dyn Storage> = if config.max_store_bytes > 0 {
        Arc::new(MemoryStore::with_capacity(config.max_store_bytes))
    } else {
        Arc::new(MemoryStore::new())
    };

    info!(?config, "starting reef-server");
    match config.network_mode {
        NetworkMode::Blocking => run_server(BlockingServer::new(config, storage)),
        NetworkMode::Reactor => run_server(ReactorServer::new(config, storage)),
    }
}

fn run_server<S: NetworkServer>(mut server: S) -> ReefResult<()> {
    server.start()?;
    // Runs until the process is killed; `stop` exists for embedders and tests.
    server.join();
    Ok(())
}

/// Applies `REEF_*` environment overrides on top of the default configuration.
fn config_from_env() -> ReefResult<ServerConfig> {
    let mut config = ServerConfig::default();

    if let Some(port) = env_parse::<u16>("REEF_PORT")? {
        config.port = port;
    }
    if let Some(mode) = std::env::var_os("REEF_MODE") {
        config.network_mode = match mode.to_str() {
            Some("blocking") => NetworkMode::Blocking,
            Some("reactor") => NetworkMode::Reactor,
            _ => return Err(ReefError::InvalidConfig("REEF_MODE")),
        };
    }
    if let Some(workers) = env_parse::<usize>("REEF_REACTOR_WORKERS")? {
        config.reactor_workers = workers.max(1);
    }
    if let Some(max_store_bytes) = env_parse::<usize>("REEF_MAX_STORE_BYTES")? {
        config.max_store_bytes = max_store_bytes;
    }
    if let Some(receive_timeout_secs) = env_parse::<u64>("REEF_RECEIVE_TIMEOUT_SECS")? {
        config.receive_timeout = std::time::Duration::from_secs(receive_timeout_secs);
    }

    let min_threads = env_parse::<usize>("REEF_POOL_MIN")?;
    let max_threads = env_parse::<usize>("REEF_POOL_MAX")?;
    let queue_capacity = env_parse::<usize>("REEF_POOL_QUEUE")?;
    if min_threads.is_some() || max_threads.is_some() || queue_capacity.is_some() {
        config.pool = PoolLimits::new(
            min_threads.unwrap_or(config.pool.min_threads()),
            max_threads.unwrap_or(config.pool.max_threads()),
            queue_capacity.unwrap_or(config.pool.queue_capacity()),
        )
        .ok_or(ReefError::InvalidConfig("REEF_POOL_MIN/MAX/QUEUE"))?;
    }

    Ok(config)
}

fn env_parse<T: FromStr>(name: &'static str) -> ReefResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ReefError::InvalidConfig(name)),
        Err(_) => Ok(None),
    }
}
