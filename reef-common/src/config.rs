//! Runtime configuration shared by server bootstrap code.

use std::time::Duration;

/// Connection scheduling model used by a server instance.
///
/// The two models serve the same protocol contract and are never combined in one running
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// One dedicated pool thread per active connection.
    Blocking,
    /// A fixed set of event-loop threads, each multiplexing many connections.
    Reactor,
}

/// Validated worker-pool sizing, kept as one value so invalid combinations are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    min_threads: usize,
    max_threads: usize,
    queue_capacity: usize,
}

impl PoolLimits {
    /// Creates validated pool limits.
    ///
    /// Returns `None` when `max_threads` is zero, when `min_threads` exceeds `max_threads`, or
    /// when the pending queue has no capacity, because a pool shaped that way could never accept
    /// work.
    #[must_use]
    pub fn new(min_threads: usize, max_threads: usize, queue_capacity: usize) -> Option<Self> {
        if max_threads == 0 || min_threads > max_threads || queue_capacity == 0 {
            return None;
        }
        Some(Self {
            min_threads,
            max_threads,
            queue_capacity,
        })
    }

    /// Warm thread floor that is never retired.
    #[must_use]
    pub const fn min_threads(self) -> usize {
        self.min_threads
    }

    /// Hard ceiling on live pool threads.
    #[must_use]
    pub const fn max_threads(self) -> usize {
        self.max_threads
    }

    /// Bound on tasks waiting for a free thread.
    #[must_use]
    pub const fn queue_capacity(self) -> usize {
        self.queue_capacity
    }
}

/// Bootstrap configuration used by `reef-server` during process startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// TCP port the listener binds to. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Connection scheduling model.
    pub network_mode: NetworkMode,
    /// Number of reactor event-loop threads. Ignored in blocking mode.
    pub reactor_workers: usize,
    /// Worker-pool sizing for the blocking model.
    pub pool: PoolLimits,
    /// How long a pool thread above the warm floor may idle before retiring itself.
    pub pool_idle_timeout: Duration,
    /// Receive timeout applied to each accepted socket in the blocking model, bounding how long
    /// one pool thread can be pinned on a stalled client.
    pub receive_timeout: Duration,
    /// Cache capacity in bytes. `0` means unbounded.
    pub max_store_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 11211,
            network_mode: NetworkMode::Blocking,
            reactor_workers: 2,
            pool: PoolLimits::new(2, 16, 16).expect("literal pool limits must be valid"),
            pool_idle_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(60),
            max_store_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PoolLimits;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0, 1)]
    #[case(4, 2, 8)]
    #[case(1, 2, 0)]
    fn pool_limits_reject_shapes_that_cannot_accept_work(
        #[case] min_threads: usize,
        #[case] max_threads: usize,
        #[case] queue_capacity: usize,
    ) {
        assert_that!(
            PoolLimits::new(min_threads, max_threads, queue_capacity),
            eq(None)
        );
    }

    #[rstest]
    fn pool_limits_accept_zero_warm_floor() {
        let limits = PoolLimits::new(0, 4, 8).expect("limits should be valid");
        assert_that!(limits.min_threads(), eq(0));
        assert_that!(limits.max_threads(), eq(4));
        assert_that!(limits.queue_capacity(), eq(8));
    }
}
