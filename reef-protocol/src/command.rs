//! Executable command objects produced by the header lexer.
//!
//! Every command consumes a storage handle plus the argument bytes accumulated by the
//! connection state machine and produces one response payload. The payload deliberately
//! excludes the final line terminator; the connection driver appends it exactly once per
//! response.

use std::fmt;

use reef_common::error::ReefResult;
use reef_storage::{Storage, StoredValue};

use crate::CRLF;

/// Mutating header verbs that carry a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVerb {
    /// Unconditional store.
    Set,
    /// Store only when the key is absent.
    Add,
    /// Store only when the key is present.
    Replace,
    /// Concatenate after an existing value.
    Append,
    /// Concatenate before an existing value.
    Prepend,
}

/// A parsed, executable protocol command.
///
/// Implementations must not retain the storage handle; execution is a single call that either
/// returns the response payload or fails. `ReefError::Execution` failures are recoverable and
/// become in-band error responses; any other error is fatal to the connection.
pub trait Command: fmt::Debug + Send {
    /// Canonical lower-case command name, used for logging.
    fn name(&self) -> &'static str;

    /// Executes against `storage` with the accumulated data block (empty for commands without
    /// an argument phase) and returns the response payload without its final line terminator.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Execution` for conditions reported in-band to the client and any
    /// other variant for connection-fatal faults.
    fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> ReefResult<Vec<u8>>;
}

fn stored_value(argument: &[u8], flags: u32) -> StoredValue {
    StoredValue {
        data: argument.to_vec(),
        flags,
    }
}

fn stored_or_not(applied: bool) -> Vec<u8> {
    if applied {
        b"STORED".to_vec()
    } else {
        b"NOT_STORED".to_vec()
    }
}

/// `set <key> <flags> <exptime> <bytes>`: unconditional store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCommand {
    key: String,
    flags: u32,
}

impl SetCommand {
    /// Creates the command for one parsed header.
    #[must_use]
    pub fn new(key: String, flags: u32) -> Self {
        Self { key, flags }
    }
}

impl Command for SetCommand {
    fn name(&self) -> &'static str {
        "set"
    }

    fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> ReefResult<Vec<u8>> {
        storage.set(&self.key, stored_value(argument, self.flags))?;
        Ok(b"STORED".to_vec())
    }
}

/// `add <key> <flags> <exptime> <bytes>`: store only when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutIfAbsentCommand {
    key: String,
    flags: u32,
}

impl PutIfAbsentCommand {
    /// Creates the command for one parsed header.
    #[must_use]
    pub fn new(key: String, flags: u32) -> Self {
        Self { key, flags }
    }
}

impl Command for PutIfAbsentCommand {
    fn name(&self) -> &'static str {
        "add"
    }

    fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> ReefResult<Vec<u8>> {
        let applied = storage.put_if_absent(&self.key, stored_value(argument, self.flags))?;
        Ok(stored_or_not(applied))
    }
}

/// `replace <key> <flags> <exptime> <bytes>`: store only when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceCommand {
    key: String,
    flags: u32,
}

impl ReplaceCommand {
    /// Creates the command for one parsed header.
    #[must_use]
    pub fn new(key: String, flags: u32) -> Self {
        Self { key, flags }
    }
}

impl Command for ReplaceCommand {
    fn name(&self) -> &'static str {
        "replace"
    }

    fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> ReefResult<Vec<u8>> {
        let applied = storage.replace(&self.key, stored_value(argument, self.flags))?;
        Ok(stored_or_not(applied))
    }
}

/// `append <key> <flags> <exptime> <bytes>`: concatenate after an existing value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendCommand {
    key: String,
}

impl AppendCommand {
    /// Creates the command for one parsed header.
    #[must_use]
    pub fn new(key: String) -> Self {
        Self { key }
    }
}

impl Command for AppendCommand {
    fn name(&self) -> &'static str {
        "append"
    }

    fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> ReefResult<Vec<u8>> {
        let applied = storage.append(&self.key, argument)?;
        Ok(stored_or_not(applied))
    }
}

/// `prepend <key> <flags> <exptime> <bytes>`: concatenate before an existing value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrependCommand {
    key: String,
}

impl PrependCommand {
    /// Creates the command for one parsed header.
    #[must_use]
    pub fn new(key: String) -> Self {
        Self { key }
    }
}

impl Command for PrependCommand {
    fn name(&self) -> &'static str {
        "prepend"
    }

    fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> ReefResult<Vec<u8>> {
        let applied = storage.prepend(&self.key, argument)?;
        Ok(stored_or_not(applied))
    }
}

/// `get <key>+` / `gets <key>+`: multi-key retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCommand {
    keys: Vec<String>,
}

impl GetCommand {
    /// Creates the command for one parsed header.
    #[must_use]
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }
}

impl Command for GetCommand {
    fn name(&self) -> &'static str {
        "get"
    }

    fn execute(&self, storage: &dyn Storage, _argument: &[u8]) -> ReefResult<Vec<u8>> {
        let mut response = Vec::new();
        for key in &self.keys {
            let Some(stored) = storage.get(key)? else {
                continue;
            };
            response
                .extend_from_slice(format!("VALUE {key} {} {}", stored.flags, stored.data.len())
                    .as_bytes());
            response.extend_from_slice(CRLF);
            response.extend_from_slice(&stored.data);
            response.extend_from_slice(CRLF);
        }
        response.extend_from_slice(b"END");
        Ok(response)
    }
}

/// `delete <key>`: removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCommand {
    key: String,
}

impl DeleteCommand {
    /// Creates the command for one parsed header.
    #[must_use]
    pub fn new(key: String) -> Self {
        Self { key }
    }
}

impl Command for DeleteCommand {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn execute(&self, storage: &dyn Storage, _argument: &[u8]) -> ReefResult<Vec<u8>> {
        let removed = storage.delete(&self.key)?;
        Ok(if removed {
            b"DELETED".to_vec()
        } else {
            b"NOT_FOUND".to_vec()
        })
    }
}
