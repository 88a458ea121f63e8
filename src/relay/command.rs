//! Line framing and command classification.
//!
//! Raw bytes from a client accumulate in a [`LineBuffer`]. Each complete
//! newline-terminated record is classified as a [`Command`]:
//!
//! ```text
//! -q\n        Quit       disconnect the sender
//! -s\n        NoOp       ignored
//! <line>\n    Broadcast  relayed to every other client
//! ```
//!
//! A trailing `\r` is tolerated for classification so `-q\r\n` from a
//! telnet-style client still quits. Broadcast payloads keep their original
//! bytes, terminator included.

use bytes::{Bytes, BytesMut};

const QUIT: &[u8] = b"-q";
const NOOP: &[u8] = b"-s";

/// A classified input record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Disconnect the sending session.
    Quit,
    /// Explicitly ignored.
    NoOp,
    /// Relay the payload to all other sessions.
    Broadcast(Bytes),
}

impl Command {
    /// Classify one record (normally ending in `\n`).
    pub fn parse(record: Bytes) -> Command {
        let line = record.strip_suffix(b"\n").unwrap_or(&record[..]);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        match line {
            QUIT => Command::Quit,
            NOOP => Command::NoOp,
            _ => Command::Broadcast(record),
        }
    }
}

/// Per-connection accumulator for partial lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    max_line_length: usize,
}

impl LineBuffer {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line_length,
        }
    }

    /// Append bytes just read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Split off and classify the next complete record.
    ///
    /// Unterminated input longer than `max_line_length` is flushed as a
    /// single broadcast so a client that never sends a newline cannot grow
    /// the buffer without bound.
    pub fn next_command(&mut self) -> Option<Command> {
        // max_line_length excludes the terminator
        let window = self.buf.len().min(self.max_line_length + 1);
        if let Some(pos) = self.buf[..window].iter().position(|&b| b == b'\n') {
            let record = self.buf.split_to(pos + 1).freeze();
            return Some(Command::parse(record));
        }

        if self.buf.len() > self.max_line_length {
            let record = self.buf.split_to(self.max_line_length).freeze();
            return Some(Command::Broadcast(record));
        }

        None
    }

    /// Bytes buffered without a terminator yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
