//! Incremental command-header lexer.
//!
//! The parser consumes bytes only when a full newline-terminated header is visible; a return of
//! zero consumed bytes means "need more data" and leaves the buffered remainder untouched in the
//! caller's read window. Once a header is recognized, [`Parser::build`] hands out the command
//! object plus the declared data-block length, and [`Parser::reset`] clears header state for the
//! next command.

use reef_common::error::{ReefError, ReefResult};

use crate::command::{
    AppendCommand, Command, DeleteCommand, GetCommand, PrependCommand, PutIfAbsentCommand,
    ReplaceCommand, SetCommand, StorageVerb,
};

/// Maximum number of keys accepted in one retrieval header.
const MAX_GET_KEYS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Header {
    Storage {
        verb: StorageVerb,
        key: String,
        flags: u32,
        data_len: usize,
    },
    Get {
        keys: Vec<String>,
    },
    Delete {
        key: String,
    },
}

/// Streaming header lexer; one instance per connection.
#[derive(Debug, Default)]
pub struct Parser {
    recognized: Option<Header>,
}

impl Parser {
    /// Creates a lexer with no header state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans `buffer` for one complete command header.
    ///
    /// Returns `(header_recognized, bytes_consumed)`. Zero consumed bytes with no recognition
    /// means more data is required; the caller keeps the bytes buffered. A recognized header
    /// stays latched until [`Parser::build`] or [`Parser::reset`].
    ///
    /// # Errors
    ///
    /// Returns `ReefError::Protocol` when a complete header line is malformed: unknown command
    /// name, wrong token count, or a non-numeric field. Header parse failures are fatal to the
    /// connection.
    pub fn parse(&mut self, buffer: &[u8]) -> ReefResult<(bool, usize)> {
        if self.recognized.is_some() {
            return Ok((true, 0));
        }

        let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') else {
            return Ok((false, 0));
        };
        let consumed = newline.saturating_add(1);
        let mut line = &buffer[..newline];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        self.recognized = Some(parse_header_line(line)?);
        Ok((true, consumed))
    }

    /// Converts the recognized header into an executable command and its required data-block
    /// length (zero for retrieval and delete headers).
    ///
    /// # Errors
    ///
    /// Returns `ReefError::InvalidState` when no header has been recognized since the last
    /// reset.
    pub fn build(&mut self) -> ReefResult<(Box<dyn Command>, usize)> {
        let Some(header) = self.recognized.take() else {
            return Err(ReefError::InvalidState(
                "no command header has been recognized",
            ));
        };

        Ok(match header {
            Header::Storage {
                verb,
                key,
                flags,
                data_len,
            } => {
                let command: Box<dyn Command> = match verb {
                    StorageVerb::Set => Box::new(SetCommand::new(key, flags)),
                    StorageVerb::Add => Box::new(PutIfAbsentCommand::new(key, flags)),
                    StorageVerb::Replace => Box::new(ReplaceCommand::new(key, flags)),
                    StorageVerb::Append => Box::new(AppendCommand::new(key)),
                    StorageVerb::Prepend => Box::new(PrependCommand::new(key)),
                };
                (command, data_len)
            }
            Header::Get { keys } => (Box::new(GetCommand::new(keys)), 0),
            Header::Delete { key } => (Box::new(DeleteCommand::new(key)), 0),
        })
    }

    /// Clears header-parse state between commands.
    pub fn reset(&mut self) {
        self.recognized = None;
    }
}

fn parse_header_line(line: &[u8]) -> ReefResult<Header> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ReefError::Protocol("command header is not valid ASCII".to_owned()))?;
    let mut tokens = text.split_ascii_whitespace();
    let Some(name) = tokens.next() else {
        return Err(ReefError::Protocol("empty command header".to_owned()));
    };

    match name {
        "set" | "add" | "replace" | "append" | "prepend" => {
            let verb = match name {
                "set" => StorageVerb::Set,
                "add" => StorageVerb::Add,
                "replace" => StorageVerb::Replace,
                "append" => StorageVerb::Append,
                _ => StorageVerb::Prepend,
            };
            let key = required_token(tokens.next(), name, "key")?.to_owned();
            let flags = parse_field::<u32>(tokens.next(), name, "flags")?;
            // The expiration field is accepted for wire compatibility but entries do not expire.
            let _exptime = parse_field::<u32>(tokens.next(), name, "exptime")?;
            let data_len = parse_field::<usize>(tokens.next(), name, "bytes")?;
            reject_trailing_tokens(tokens.next(), name)?;
            Ok(Header::Storage {
                verb,
                key,
                flags,
                data_len,
            })
        }
        "get" | "gets" => {
            let keys = tokens.map(str::to_owned).collect::<Vec<_>>();
            if keys.is_empty() {
                return Err(ReefError::Protocol(format!(
                    "{name} header requires at least one key"
                )));
            }
            if keys.len() > MAX_GET_KEYS {
                return Err(ReefError::Protocol(format!(
                    "{name} header exceeds {MAX_GET_KEYS} keys"
                )));
            }
            Ok(Header::Get { keys })
        }
        "delete" => {
            let key = required_token(tokens.next(), name, "key")?.to_owned();
            reject_trailing_tokens(tokens.next(), name)?;
            Ok(Header::Delete { key })
        }
        other => Err(ReefError::Protocol(format!("unknown command: {other}"))),
    }
}

fn required_token<'a>(
    token: Option<&'a str>,
    command: &str,
    field: &str,
) -> ReefResult<&'a str> {
    token.ok_or_else(|| ReefError::Protocol(format!("{command} header is missing {field}")))
}

fn parse_field<T: std::str::FromStr>(
    token: Option<&str>,
    command: &str,
    field: &str,
) -> ReefResult<T> {
    let raw = required_token(token, command, field)?;
    raw.parse::<T>()
        .map_err(|_| ReefError::Protocol(format!("{command} header has invalid {field}: {raw}")))
}

fn reject_trailing_tokens(token: Option<&str>, command: &str) -> ReefResult<()> {
    if token.is_some() {
        return Err(ReefError::Protocol(format!(
            "{command} header has trailing tokens"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Parser;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn partial_header_consumes_nothing() {
        let mut parser = Parser::new();
        let (recognized, consumed) = parser
            .parse(b"set foo 0 0")
            .expect("partial header should not fail");
        assert_that!(recognized, eq(false));
        assert_that!(consumed, eq(0));
    }

    #[rstest]
    fn storage_header_reports_declared_data_length() {
        let mut parser = Parser::new();
        let (recognized, consumed) = parser
            .parse(b"set foo 5 0 3\r\nbar\r\n")
            .expect("header should parse");
        assert_that!(recognized, eq(true));
        assert_that!(consumed, eq(15));

        let (command, data_len) = parser.build().expect("build should succeed");
        assert_that!(command.name(), eq("set"));
        assert_that!(data_len, eq(3));
    }

    #[rstest]
    fn retrieval_header_requires_no_data_block() {
        let mut parser = Parser::new();
        let (recognized, consumed) = parser
            .parse(b"get foo\r\n")
            .expect("header should parse");
        assert_that!(recognized, eq(true));
        assert_that!(consumed, eq(9));

        let (command, data_len) = parser.build().expect("build should succeed");
        assert_that!(command.name(), eq("get"));
        assert_that!(data_len, eq(0));
    }

    #[rstest]
    fn recognized_header_stays_latched_until_reset() {
        let mut parser = Parser::new();
        let _ = parser
            .parse(b"delete foo\r\n")
            .expect("header should parse");

        let (recognized, consumed) = parser
            .parse(b"get bar\r\n")
            .expect("latched parser should not consume");
        assert_that!(recognized, eq(true));
        assert_that!(consumed, eq(0));

        parser.reset();
        let (recognized, consumed) = parser
            .parse(b"get bar\r\n")
            .expect("header should parse after reset");
        assert_that!(recognized, eq(true));
        assert_that!(consumed, eq(9));
    }

    #[rstest]
    #[case::unknown_command(b"touch foo 0\r\n".as_slice())]
    #[case::missing_fields(b"set foo 0 0\r\n".as_slice())]
    #[case::negative_length(b"set foo 0 0 -1\r\n".as_slice())]
    #[case::non_numeric_length(b"set foo 0 0 abc\r\n".as_slice())]
    #[case::trailing_tokens(b"delete foo extra\r\n".as_slice())]
    #[case::empty_line(b"\r\n".as_slice())]
    #[case::get_without_keys(b"get\r\n".as_slice())]
    fn malformed_headers_are_protocol_errors(#[case] input: &[u8]) {
        let mut parser = Parser::new();
        let result = parser.parse(input);
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn build_without_recognized_header_is_rejected() {
        let mut parser = Parser::new();
        assert_that!(parser.build().is_err(), eq(true));
    }

    #[rstest]
    fn multi_key_retrieval_header_is_recognized() {
        let mut parser = Parser::new();
        let (recognized, _) = parser
            .parse(b"gets a b c\r\n")
            .expect("header should parse");
        assert_that!(recognized, eq(true));

        let (command, data_len) = parser.build().expect("build should succeed");
        assert_that!(command.name(), eq("get"));
        assert_that!(data_len, eq(0));
    }
}
