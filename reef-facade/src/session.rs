//! Per-connection protocol state machine and the reactor-side response queue.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use tracing::debug;

use reef_common::error::{ReefError, ReefResult};
use reef_protocol::command::Command;
use reef_protocol::parser::Parser;
use reef_protocol::{CRLF, DATA_TERMINATOR_BYTES};
use reef_storage::Storage;

use crate::window::ReadWindow;

/// Protocol phases for one connection: header parse, argument fill, execute, respond.
///
/// `advance` is the single transition function shared by the blocking and reactor schedulers:
/// it consumes whatever bytes are available in the read window and emits every response that
/// became complete, through the caller-supplied sink. The blocking driver's sink writes
/// synchronously (so command *N*'s response is on the wire before command *N+1* executes); the
/// reactor driver's sink pushes into a [`ResponseQueue`] drained on write readiness.
pub struct Session {
    storage: Arc<dyn Storage>,
    parser: Parser,
    pending_command: Option<Box<dyn Command>>,
    arg_remaining: usize,
    arg_buffer: Vec<u8>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("parser", &self.parser)
            .field("pending_command", &self.pending_command)
            .field("arg_remaining", &self.arg_remaining)
            .field("arg_buffer_len", &self.arg_buffer.len())
            .finish()
    }
}

impl Session {
    /// Creates the parse state for one client connection.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            parser: Parser::new(),
            pending_command: None,
            arg_remaining: 0,
            arg_buffer: Vec::new(),
        }
    }

    /// Returns `true` while a recognized command is awaiting its argument bytes or execution.
    ///
    /// The shutdown path uses this to finish in-flight commands without starting new ones.
    #[must_use]
    pub fn has_pending_command(&self) -> bool {
        self.pending_command.is_some()
    }

    /// Argument bytes still required before the pending command may execute.
    #[must_use]
    pub fn arg_remaining(&self) -> usize {
        self.arg_remaining
    }

    /// Runs the protocol phases against the buffered bytes until no further progress is
    /// possible, handing each completed response (terminator included) to `sink`.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Protocol` for malformed headers, an overlong header line, or a data
    /// block without its trailing delimiter; these are fatal to the connection. Non-recoverable
    /// execution faults and sink failures propagate unchanged. Recoverable execution failures
    /// do not error: they become in-band `SERVER_ERROR` responses.
    pub fn advance(
        &mut self,
        window: &mut ReadWindow,
        sink: &mut dyn FnMut(Vec<u8>) -> ReefResult<()>,
    ) -> ReefResult<()> {
        loop {
            if self.pending_command.is_none() {
                let (recognized, consumed) = self.parser.parse(window.bytes())?;
                if !recognized {
                    if window.is_full() {
                        return Err(ReefError::Protocol(
                            "command header exceeds read window capacity".to_owned(),
                        ));
                    }
                    return Ok(());
                }
                window.consume(consumed);
                let (command, data_len) = self.parser.build()?;
                self.pending_command = Some(command);
                // Zero-length data blocks carry no trailing delimiter on this wire protocol.
                self.arg_remaining = if data_len > 0 {
                    data_len.saturating_add(DATA_TERMINATOR_BYTES)
                } else {
                    0
                };
            }

            if self.arg_remaining > 0 {
                let take = self.arg_remaining.min(window.len());
                self.arg_buffer.extend_from_slice(&window.bytes()[..take]);
                window.consume(take);
                self.arg_remaining -= take;
                if self.arg_remaining > 0 {
                    return Ok(());
                }
            }

            let Some(command) = self.pending_command.take() else {
                return Err(ReefError::InvalidState(
                    "execute phase reached without a pending command",
                ));
            };
            let argument = self.take_argument()?;
            let mut response = match command.execute(self.storage.as_ref(), &argument) {
                Ok(payload) => payload,
                Err(error) if error.is_recoverable() => {
                    debug!(command = command.name(), %error, "command execution rejected");
                    format!("SERVER_ERROR {error}").into_bytes()
                }
                Err(error) => return Err(error),
            };
            response.extend_from_slice(CRLF);
            sink(response)?;
            self.parser.reset();

            if window.is_empty() {
                return Ok(());
            }
        }
    }

    /// Takes the accumulated data block, validating and stripping its trailing delimiter.
    fn take_argument(&mut self) -> ReefResult<Vec<u8>> {
        let mut argument = std::mem::take(&mut self.arg_buffer);
        if argument.is_empty() {
            return Ok(argument);
        }
        if !argument.ends_with(CRLF) {
            return Err(ReefError::Protocol(
                "data block is not terminated by CRLF".to_owned(),
            ));
        }
        argument.truncate(argument.len() - DATA_TERMINATOR_BYTES);
        Ok(argument)
    }
}

/// Ordered not-yet-fully-written responses for one reactor connection.
///
/// A cursor into the head element tolerates partial writes; an element is popped only once
/// fully flushed, preserving per-connection response order.
#[derive(Debug, Default)]
pub struct ResponseQueue {
    pending: VecDeque<Vec<u8>>,
    head_written: usize,
}

impl ResponseQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues one complete response.
    pub fn push(&mut self, response: Vec<u8>) {
        self.pending.push_back(response);
    }

    /// Returns `true` when nothing is waiting to be written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total unwritten bytes across all queued responses.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        let queued: usize = self.pending.iter().map(Vec::len).sum();
        queued.saturating_sub(self.head_written)
    }

    /// Writes queued responses until the writer would block or the queue drains.
    ///
    /// Returns `Ok(true)` when fully drained and `Ok(false)` when the writer stopped accepting
    /// bytes (`WouldBlock`); the caller re-arms write interest in the latter case.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error, with a zero-length write surfaced as `WriteZero`.
    pub fn write_to<W: io::Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        while let Some(head) = self.pending.front() {
            match writer.write(&head[self.head_written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(written) => {
                    self.head_written += written;
                    if self.head_written >= head.len() {
                        let _ = self.pending.pop_front();
                        self.head_written = 0;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        Ok(true)
    }
}
