//! Newline framing for the listener.
//!
//! The wire format is arbitrary bytes with `\n` as the only message boundary.
//! Each complete line (including its `\n`) is printed with a fixed label and
//! nothing appended:
//!
//! ```text
//! Wire:   hello\n
//! Stdout: Message Received:hello\n
//! ```

use bytes::BytesMut;

/// Printed once before the listening socket is opened.
pub const STARTUP_MESSAGE: &[u8] = b"Start server...\n";

/// Prefix written in front of every received line.
pub const MESSAGE_LABEL: &[u8] = b"Message Received:";

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full line is available; the value counts bytes through the `\n`.
    Complete(usize),
    /// No newline yet.
    Incomplete,
}

/// Look for one newline-terminated line at the start of `input`.
pub fn parse(input: &[u8]) -> ParseResult {
    match find_lf(input) {
        Some(pos) => ParseResult::Complete(pos + 1),
        None => ParseResult::Incomplete,
    }
}

/// Append a labelled message for `line` to `output`.
///
/// `line` is copied as-is, so a trailing `\n` is kept and none is added.
pub fn encode_message(line: &[u8], output: &mut BytesMut) {
    output.reserve(MESSAGE_LABEL.len() + line.len());
    output.extend_from_slice(MESSAGE_LABEL);
    output.extend_from_slice(line);
}

fn find_lf(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}
