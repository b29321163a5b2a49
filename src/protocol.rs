//! Line server text protocol parser and response generator.
//!
//! Every request is a single CRLF-terminated frame, matched exactly:
//!
//! ```text
//! GET <digits>\r\n   -> Get { line }
//! QUIT\r\n           -> Quit
//! SHUTDOWN\r\n       -> Shutdown
//! ```
//!
//! Anything else (lowercase verbs, extra spaces, signs, trailing bytes) is
//! rejected as a whole rather than partially accepted.

use bytes::BytesMut;

/// Maximum frame length accepted from a client, terminator included
pub const MAX_FRAME_LENGTH: usize = 1024;

const CRLF: &[u8] = b"\r\n";

/// Parsed client command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Fetch a line by its 1-based number
    Get { line: u64 },
    /// Close this connection
    Quit,
    /// Close this connection and stop the server
    Shutdown,
}

/// Reasons a frame is not a valid command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Frame does not end with CRLF
    MissingTerminator,
    /// Frame is not one of the known commands
    UnknownCommand,
    /// GET argument is not a u64 made of ASCII digits
    InvalidNumber,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MissingTerminator => write!(f, "Command not terminated by CRLF"),
            ParseError::UnknownCommand => write!(f, "Unknown command"),
            ParseError::InvalidNumber => write!(f, "Invalid line number"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of classifying a frame
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    Complete(Command),
    Invalid(ParseError),
}

/// Parser for the line server protocol
pub struct Parser;

impl Parser {
    /// Classify one complete frame.
    pub fn parse(frame: &[u8]) -> ParseResult {
        let line = match frame.strip_suffix(CRLF) {
            Some(line) => line,
            None => return ParseResult::Invalid(ParseError::MissingTerminator),
        };

        match line {
            b"QUIT" => ParseResult::Complete(Command::Quit),
            b"SHUTDOWN" => ParseResult::Complete(Command::Shutdown),
            _ => match line.strip_prefix(b"GET ") {
                Some(digits) => Self::parse_get(digits),
                None => ParseResult::Invalid(ParseError::UnknownCommand),
            },
        }
    }

    fn parse_get(digits: &[u8]) -> ParseResult {
        // u64::from_str would also take a leading '+'
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return ParseResult::Invalid(ParseError::InvalidNumber);
        }

        match std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(line) => ParseResult::Complete(Command::Get { line }),
            None => ParseResult::Invalid(ParseError::InvalidNumber),
        }
    }
}

/// Response builders
pub struct Response;

impl Response {
    /// `OK\r\n<text>\r\n`, with the line's own terminator replaced by CRLF.
    pub fn line(text: &[u8]) -> BytesMut {
        let text = trim_terminator(text);
        let mut response = BytesMut::with_capacity(4 + text.len() + 2);
        response.extend_from_slice(b"OK\r\n");
        response.extend_from_slice(text);
        response.extend_from_slice(CRLF);
        response
    }

    pub fn error() -> &'static [u8] {
        b"ERR\r\n"
    }
}

/// Strip a trailing `\n` or `\r\n` from a source line.
pub fn trim_terminator(text: &[u8]) -> &[u8] {
    match text.strip_suffix(b"\n") {
        Some(rest) => rest.strip_suffix(b"\r").unwrap_or(rest),
        None => text,
    }
}
