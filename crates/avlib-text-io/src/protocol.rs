//! Line framing for newline-terminated text protocols.
//!
//! Commands are sent as a single line terminated by `\n`. Devices answer
//! with lines terminated by `\r\n` (some firmware sends a bare `\n`). This
//! module splits a receive buffer into complete lines; everything above the
//! line level (reply status, value grammar) belongs to the device driver.

/// The byte that terminates every line in both directions.
pub const LINE_FEED: u8 = b'\n';

/// Result of attempting to decode one line from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete line was decoded.
    Line {
        /// Line content with the trailing `\r\n` / `\n` removed.
        text: String,
        /// Number of bytes consumed from the input buffer.
        consumed: usize,
    },

    /// A complete line was found but is not valid UTF-8. The line is
    /// consumed and should be discarded.
    Invalid(usize),

    /// The buffer does not yet contain a complete line. More data is needed.
    Incomplete,
}

/// Decode one line from a byte buffer.
///
/// Returns the first complete line found, or [`DecodeResult::Incomplete`]
/// if no line feed is present yet.
pub fn decode_line(buf: &[u8]) -> DecodeResult {
    let lf_pos = match buf.iter().position(|&b| b == LINE_FEED) {
        Some(pos) => pos,
        None => return DecodeResult::Incomplete,
    };

    let consumed = lf_pos + 1;
    let mut body = &buf[..lf_pos];
    if let [rest @ .., b'\r'] = body {
        body = rest;
    }

    match std::str::from_utf8(body) {
        Ok(s) => DecodeResult::Line {
            text: s.to_string(),
            consumed,
        },
        Err(_) => DecodeResult::Invalid(consumed),
    }
}

/// Encode a command line, appending the line feed if it is missing.
///
/// # Examples
///
/// ```
/// use avlib_text_io::protocol::encode_command;
///
/// assert_eq!(encode_command("Level1 get level 1"), b"Level1 get level 1\n");
/// assert_eq!(encode_command("DEVICE get version\n"), b"DEVICE get version\n");
/// ```
pub fn encode_command(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    if bytes.last() != Some(&LINE_FEED) {
        bytes.push(LINE_FEED);
    }
    bytes
}

/// Whether `line` is the device echoing `command` back.
///
/// Devices in verbose or telnet-echo mode repeat every command before
/// answering. Comparison ignores surrounding whitespace.
pub fn is_echo(line: &str, command: &str) -> bool {
    let command = command.trim();
    !command.is_empty() && line.trim() == command
}
