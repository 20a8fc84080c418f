//! Network deployments for the reef protocol contract.
//!
//! Two schedulers serve the same wire protocol and share the `reef-facade` connection state
//! machine: [`blocking::BlockingServer`] dedicates one worker-pool thread per connection, while
//! [`reactor::ReactorServer`] multiplexes many connections over a fixed set of `mio` event
//! loops. A deployment runs exactly one of them.

pub mod blocking;
pub mod reactor;

#[cfg(test)]
mod tests;

use reef_common::error::ReefResult;

/// Per-connection read buffer capacity; also the hard cap on one read and on a header line.
pub(crate) const READ_WINDOW_BYTES: usize = 4096;

/// Control surface shared by both deployments.
pub trait NetworkServer {
    /// Binds the listener and spawns the scheduling threads.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Io` when binding, socket options, or poll registration fail, and
    /// `ReefError::InvalidState` when the server is already started. Setup failures abort the
    /// start entirely; nothing keeps running.
    fn start(&mut self) -> ReefResult<()>;

    /// Signals shutdown and returns without waiting. Idempotent.
    ///
    /// In-flight commands always finish; the flag only prevents new work from starting.
    fn stop(&mut self);

    /// Blocks until every thread owned by the server has exited and in-flight connections have
    /// drained.
    fn join(&mut self);
}
