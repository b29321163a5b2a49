//! Read-only line lookup over an indexed source file.
//!
//! Each connection opens its own `LineStore`, so no file handle or seek
//! position is ever shared between tasks.

use crate::index::{IndexRecord, Session, RECORD_SIZE};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use tracing::{trace, warn};

/// Reasons a line could not be returned
#[derive(Debug)]
pub enum LookupError {
    /// Line number outside `1..=line_count`
    OutOfRange { line: u64, line_count: u64 },
    /// The source yielded fewer bytes than the index promised
    ShortRead {
        line: u64,
        expected: u64,
        actual: u64,
    },
    /// Seek or read failure on the source or index
    Io(io::Error),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::OutOfRange { line, line_count } => {
                write!(f, "Line {} is out of range 1..={}", line, line_count)
            }
            LookupError::ShortRead {
                line,
                expected,
                actual,
            } => write!(
                f,
                "Short read for line {}: expected {} bytes, got {}",
                line, expected, actual
            ),
            LookupError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for LookupError {}

impl From<io::Error> for LookupError {
    fn from(e: io::Error) -> Self {
        LookupError::Io(e)
    }
}

/// Line accessor over a source file and its index artifact
#[derive(Debug)]
pub struct LineStore {
    source: File,
    index: File,
    line_count: u64,
}

impl LineStore {
    /// Open private read-only handles on the session's source and index.
    pub fn open(session: &Session) -> io::Result<Self> {
        let source = File::open(session.source_path())?;
        let index = File::open(session.index_path())?;

        Ok(Self {
            source,
            index,
            line_count: session.line_count(),
        })
    }

    /// Fetch a line by its 1-based number, terminator included.
    ///
    /// Returns `None` when the line does not exist. Integrity failures are
    /// logged and also reported as `None`.
    pub fn get_line(&mut self, line: u64) -> Option<Bytes> {
        match self.lookup(line) {
            Ok(text) => Some(text),
            Err(e @ LookupError::OutOfRange { .. }) => {
                trace!(error = %e, "Line not found");
                None
            }
            Err(e) => {
                warn!(line, error = %e, "Line lookup failed");
                None
            }
        }
    }

    /// Fetch a line by its 1-based number, terminator included.
    pub fn lookup(&mut self, line: u64) -> Result<Bytes, LookupError> {
        if line == 0 || line > self.line_count {
            return Err(LookupError::OutOfRange {
                line,
                line_count: self.line_count,
            });
        }

        let record = self.read_record(line)?;

        self.source.seek(SeekFrom::Start(record.offset))?;
        let mut text = Vec::with_capacity(record.length as usize);
        let actual = (&mut self.source)
            .take(record.length)
            .read_to_end(&mut text)? as u64;

        if actual != record.length {
            return Err(LookupError::ShortRead {
                line,
                expected: record.length,
                actual,
            });
        }

        Ok(Bytes::from(text))
    }

    fn read_record(&mut self, line: u64) -> io::Result<IndexRecord> {
        let position = (line - 1) * RECORD_SIZE as u64;
        self.index.seek(SeekFrom::Start(position))?;

        let mut raw = [0u8; RECORD_SIZE];
        self.index.read_exact(&mut raw)?;
        Ok(IndexRecord::decode(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{build_index, build_index_with, IndexOptions, TrailingLine};
    use std::fs::{self, OpenOptions};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, content: &[u8]) -> (Session, LineStore) {
        let path = dir.path().join("source.txt");
        fs::write(&path, content).unwrap();
        let session = build_index(&path).unwrap();
        let store = LineStore::open(&session).unwrap();
        (session, store)
    }

    #[test]
    fn test_get_line() {
        let dir = TempDir::new().unwrap();
        let (_, mut store) = open_store(&dir, b"a\nb\nc\n");

        assert_eq!(store.get_line(1).as_deref(), Some(&b"a\n"[..]));
        assert_eq!(store.get_line(2).as_deref(), Some(&b"b\n"[..]));
        assert_eq!(store.get_line(3).as_deref(), Some(&b"c\n"[..]));
    }

    #[test]
    fn test_out_of_range() {
        let dir = TempDir::new().unwrap();
        let (_, mut store) = open_store(&dir, b"a\nb\nc\n");

        assert!(store.get_line(0).is_none());
        assert!(store.get_line(4).is_none());
        assert!(store.get_line(u64::MAX).is_none());
        assert!(matches!(
            store.lookup(4),
            Err(LookupError::OutOfRange {
                line: 4,
                line_count: 3
            })
        ));
    }

    #[test]
    fn test_empty_file_has_no_lines() {
        let dir = TempDir::new().unwrap();
        let (_, mut store) = open_store(&dir, b"");

        assert!(store.get_line(0).is_none());
        assert!(store.get_line(1).is_none());
    }

    #[test]
    fn test_lines_reproduce_file() {
        let dir = TempDir::new().unwrap();
        let mut content = Vec::new();
        for i in 0..300 {
            content.extend_from_slice(format!("{}:{}\r\n", i, "y".repeat(i * 7)).as_bytes());
        }
        content.extend_from_slice(b"no terminator");
        let (session, mut store) = open_store(&dir, &content);

        // Out-of-order access must not depend on previous seek positions
        let expected = format!("299:{}\r\n", "y".repeat(299 * 7));
        assert_eq!(store.get_line(300).as_deref(), Some(expected.as_bytes()));
        assert_eq!(store.get_line(301).as_deref(), Some(&b"no terminator"[..]));
        assert_eq!(store.get_line(1).as_deref(), Some(&b"0:\r\n"[..]));

        let mut rebuilt = Vec::new();
        for line in 1..=session.line_count() {
            rebuilt.extend_from_slice(&store.get_line(line).unwrap());
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_dropped_tail_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.txt");
        fs::write(&path, b"a\ntail").unwrap();
        let options = IndexOptions {
            trailing_line: TrailingLine::Drop,
            ..IndexOptions::default()
        };
        let session = build_index_with(&path, &options).unwrap();
        let mut store = LineStore::open(&session).unwrap();

        assert_eq!(store.get_line(1).as_deref(), Some(&b"a\n"[..]));
        assert!(store.get_line(2).is_none());
    }

    #[test]
    fn test_short_read_is_detected() {
        let dir = TempDir::new().unwrap();
        let (session, mut store) = open_store(&dir, b"first\nsecond\n");

        // Truncate the source behind the index's back
        OpenOptions::new()
            .write(true)
            .open(session.source_path())
            .unwrap()
            .set_len(8)
            .unwrap();

        assert!(matches!(
            store.lookup(2),
            Err(LookupError::ShortRead {
                line: 2,
                expected: 7,
                actual: 2
            })
        ));
        assert!(store.get_line(2).is_none());
        assert_eq!(store.get_line(1).as_deref(), Some(&b"first\n"[..]));
    }

    #[test]
    fn test_truncated_index_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let (session, mut store) = open_store(&dir, b"a\nb\n");

        OpenOptions::new()
            .write(true)
            .open(session.index_path())
            .unwrap()
            .set_len(RECORD_SIZE as u64)
            .unwrap();

        assert!(matches!(store.lookup(2), Err(LookupError::Io(_))));
    }

    #[test]
    fn test_open_fails_without_index() {
        let dir = TempDir::new().unwrap();
        let (session, _) = open_store(&dir, b"a\n");
        fs::remove_file(session.index_path()).unwrap();

        assert!(LineStore::open(&session).is_err());
    }
}
