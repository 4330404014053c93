//! Command parsing for the line protocol.
//!
//! Commands arrive as a single frame of bytes (the `\r` separator already
//! stripped):
//!
//! ```text
//! write <key>|<value>   read <key>   delete <key>
//! reads <prefix>        keys         status
//! ```
//!
//! The frame splits on the first space; for `write` the remainder splits on
//! the first `|`, so values may contain pipes. Values are taken verbatim;
//! keys and prefixes are whitespace-trimmed and validated against the key
//! character class.

use crate::errinput;
use crate::error::Result;
use crate::memstore::validate_key;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Write { key: Vec<u8>, value: Vec<u8> },
    Read { key: Vec<u8> },
    Delete { key: Vec<u8> },
    Keys,
    PrefixScan { prefix: Vec<u8> },
    Status,
}

/// Parses a single command frame.
pub fn parse(line: &[u8]) -> Result<Command> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return errinput!("empty command");
    }

    let (name, rest) = match line.iter().position(|&b| b == b' ') {
        Some(i) => (&line[..i], &line[i + 1..]),
        None => (line, &line[..0]),
    };

    match name.to_ascii_lowercase().as_slice() {
        b"status" => Ok(Command::Status),

        b"keys" => Ok(Command::Keys),

        b"read" => {
            let key = rest.trim_ascii();
            if key.is_empty() {
                return errinput!("read requires a key");
            }
            validate_key(key)?;
            Ok(Command::Read { key: key.to_vec() })
        }

        b"write" => {
            if rest.is_empty() {
                return errinput!("write requires key and value");
            }
            let (key, value) = match rest.iter().position(|&b| b == b'|') {
                Some(i) => (rest[..i].trim_ascii(), &rest[i + 1..]),
                None => return errinput!("write format: write <key>|<value>"),
            };
            validate_key(key)?;
            Ok(Command::Write {
                key: key.to_vec(),
                value: value.to_vec(),
            })
        }

        b"delete" => {
            let key = rest.trim_ascii();
            if key.is_empty() {
                return errinput!("delete requires a key");
            }
            validate_key(key)?;
            Ok(Command::Delete { key: key.to_vec() })
        }

        b"reads" => {
            let prefix = rest.trim_ascii();
            if prefix.is_empty() {
                return errinput!("reads requires a prefix");
            }
            validate_key(prefix)?;
            Ok(Command::PrefixScan {
                prefix: prefix.to_vec(),
            })
        }

        _ => errinput!("unknown command"),
    }
}
