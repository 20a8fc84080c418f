//! Storage-facing interface consumed by command execution.

use reef_common::error::ReefResult;

/// One cached value together with the client-supplied flags echoed back on retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// Raw binary-safe payload.
    pub data: Vec<u8>,
    /// Opaque client flags stored verbatim.
    pub flags: u32,
}

/// Keyed byte store behind the command set.
///
/// Conditional operations report their outcome through the returned `bool` (`true` when the
/// mutation was applied) so callers can map them onto `STORED`/`NOT_STORED` responses. Errors
/// are reserved for conditions the storage engine itself rejects; `ReefError::Execution` marks
/// the recoverable ones.
pub trait Storage: Send + Sync {
    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Execution` when the entry can never fit the configured capacity.
    fn set(&self, key: &str, value: StoredValue) -> ReefResult<()>;

    /// Stores `value` only when `key` is absent.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Execution` when the entry can never fit the configured capacity.
    fn put_if_absent(&self, key: &str, value: StoredValue) -> ReefResult<bool>;

    /// Stores `value` only when `key` is already present.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Execution` when the entry can never fit the configured capacity.
    fn replace(&self, key: &str, value: StoredValue) -> ReefResult<bool>;

    /// Appends bytes to an existing entry, keeping its flags.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Execution` when the grown entry can never fit the configured
    /// capacity.
    fn append(&self, key: &str, suffix: &[u8]) -> ReefResult<bool>;

    /// Prepends bytes to an existing entry, keeping its flags.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Execution` when the grown entry can never fit the configured
    /// capacity.
    fn prepend(&self, key: &str, prefix: &[u8]) -> ReefResult<bool>;

    /// Returns the stored value for `key`, refreshing its recency.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::InvalidState` when the engine state is unusable.
    fn get(&self, key: &str) -> ReefResult<Option<StoredValue>>;

    /// Removes `key`, reporting whether an entry existed.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::InvalidState` when the engine state is unusable.
    fn delete(&self, key: &str) -> ReefResult<bool>;
}
