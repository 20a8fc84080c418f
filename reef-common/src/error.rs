//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `reef`.
pub type ReefResult<T> = Result<T, ReefError>;

/// Error categories used across the connection core and its collaborators.
///
/// The split matters for propagation: `Execution` is recoverable at the command level and is
/// converted into an in-band `SERVER_ERROR` response, while every other variant terminates the
/// one connection (or, during startup, the `start` call) that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReefError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client payload violates the text protocol framing rules. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Command execution was rejected by the storage collaborator.
    #[error("{0}")]
    Execution(String),

    /// Socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl ReefError {
    /// Returns `true` when the failure is recoverable at the single-command level.
    ///
    /// Recoverable failures become in-band error responses; the connection keeps serving
    /// subsequent commands.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Execution(_))
    }
}

#[cfg(test)]
mod tests {
    use super::ReefError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn execution_errors_are_recoverable() {
        let error = ReefError::Execution("value too large".to_owned());
        assert_that!(error.is_recoverable(), eq(true));
    }

    #[rstest]
    #[case(ReefError::Protocol("bad header".to_owned()))]
    #[case(ReefError::Io("connection reset".to_owned()))]
    #[case(ReefError::InvalidState("server is not running"))]
    fn connection_fatal_errors_are_not_recoverable(#[case] error: ReefError) {
        assert_that!(error.is_recoverable(), eq(false));
    }

    #[rstest]
    fn execution_error_displays_bare_message_for_in_band_responses() {
        let error = ReefError::Execution("key is too long".to_owned());
        assert_that!(error.to_string(), eq("key is too long"));
    }
}
