//! Line indexer for the served source file.
//!
//! The source file is scanned once, in fixed-size chunks, and one
//! fixed-width record is streamed to a sibling `<source>.idx` file per line:
//!
//! ```text
//! +----------------+----------------+
//! | offset (u64 LE)| length (u64 LE)|   record for line n at (n - 1) * 16
//! +----------------+----------------+
//! ```
//!
//! `offset` is the byte position of the first byte of the line and `length`
//! counts every byte of the line including its `\n` terminator, so records
//! are contiguous: `offset[i + 1] == offset[i] + length[i]`.
//!
//! Memory use is bounded by the chunk size regardless of file size.

use bytes::{Buf, BufMut};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Size of one encoded index record in bytes
pub const RECORD_SIZE: usize = 16;

/// Default scan chunk size (typical page size)
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Extension appended to the source path to name the index artifact
pub const INDEX_EXTENSION: &str = "idx";

const LINE_TERMINATOR: u8 = b'\n';

/// Position of one line in the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Byte offset of the first byte of the line
    pub offset: u64,
    /// Line length in bytes, terminator included
    pub length: u64,
}

impl IndexRecord {
    /// Encode as two little-endian u64 values.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.length);
        out
    }

    /// Decode a record previously produced by [`IndexRecord::encode`].
    pub fn decode(raw: &[u8; RECORD_SIZE]) -> Self {
        let mut buf = &raw[..];
        let offset = buf.get_u64_le();
        let length = buf.get_u64_le();
        Self { offset, length }
    }

    /// Byte position where the next line starts
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// What to do with a final line that has no terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingLine {
    /// Index the tail as a last line without a terminator
    #[default]
    Index,
    /// Only terminated lines are indexed; the tail is ignored
    Drop,
}

/// Indexing options
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    /// Bytes read from the source per scan step
    pub chunk_size: usize,
    /// Policy for an unterminated final line
    pub trailing_line: TrailingLine,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            trailing_line: TrailingLine::default(),
        }
    }
}

/// An indexed source file, shared read-only by every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    source_path: PathBuf,
    index_path: PathBuf,
    line_count: u64,
}

impl Session {
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Number of indexed lines; valid line numbers are `1..=line_count`
    pub fn line_count(&self) -> u64 {
        self.line_count
    }
}

/// Indexing errors. All of them are fatal at startup.
#[derive(Debug)]
pub enum IndexError {
    OpenSource(PathBuf, io::Error),
    CreateIndex(PathBuf, io::Error),
    Read(PathBuf, io::Error),
    Write(PathBuf, io::Error),
    InvalidChunkSize,
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::OpenSource(path, e) => {
                write!(f, "Failed to open source file '{}': {}", path.display(), e)
            }
            IndexError::CreateIndex(path, e) => {
                write!(f, "Failed to create index file '{}': {}", path.display(), e)
            }
            IndexError::Read(path, e) => {
                write!(f, "Failed to read source file '{}': {}", path.display(), e)
            }
            IndexError::Write(path, e) => {
                write!(f, "Failed to write index file '{}': {}", path.display(), e)
            }
            IndexError::InvalidChunkSize => write!(f, "Chunk size must be greater than zero"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IndexError::OpenSource(_, e)
            | IndexError::CreateIndex(_, e)
            | IndexError::Read(_, e)
            | IndexError::Write(_, e) => Some(e),
            IndexError::InvalidChunkSize => None,
        }
    }
}

/// Path of the index artifact for `source`: the source path with `.idx` appended.
pub fn index_path_for(source: &Path) -> PathBuf {
    let mut path = source.as_os_str().to_owned();
    path.push(".");
    path.push(INDEX_EXTENSION);
    PathBuf::from(path)
}

/// Index `source` with default options.
#[cfg(test)]
pub fn build_index(source: impl AsRef<Path>) -> Result<Session, IndexError> {
    build_index_with(source, &IndexOptions::default())
}

/// Index `source`, writing the artifact next to it.
///
/// On a failure after the artifact was created, the partial artifact is
/// removed before returning.
pub fn build_index_with(
    source: impl AsRef<Path>,
    options: &IndexOptions,
) -> Result<Session, IndexError> {
    if options.chunk_size == 0 {
        return Err(IndexError::InvalidChunkSize);
    }

    let source_path = source.as_ref().to_path_buf();

    info!(source = %source_path.display(), "Opening source file");
    let reader =
        File::open(&source_path).map_err(|e| IndexError::OpenSource(source_path.clone(), e))?;

    write_index(reader, source_path, options)
}

/// Index the contents of `reader`, which were read from `source_path`.
fn write_index<R: Read>(
    reader: R,
    source_path: PathBuf,
    options: &IndexOptions,
) -> Result<Session, IndexError> {
    let index_path = index_path_for(&source_path);

    info!(index = %index_path.display(), "Creating index file");
    let index =
        File::create(&index_path).map_err(|e| IndexError::CreateIndex(index_path.clone(), e))?;
    let mut writer = BufWriter::new(index);

    let scanned = scan(reader, &mut writer, options).and_then(|lines| {
        writer.flush().map_err(ScanError::Write)?;
        Ok(lines)
    });
    drop(writer);

    match scanned {
        Ok(line_count) => {
            info!(
                index = %index_path.display(),
                lines = line_count,
                "Index built"
            );
            Ok(Session {
                source_path,
                index_path,
                line_count,
            })
        }
        Err(e) => {
            if let Err(rm) = fs::remove_file(&index_path) {
                warn!(index = %index_path.display(), error = %rm, "Failed to remove partial index");
            }
            Err(match e {
                ScanError::Read(e) => IndexError::Read(source_path, e),
                ScanError::Write(e) => IndexError::Write(index_path, e),
            })
        }
    }
}

enum ScanError {
    Read(io::Error),
    Write(io::Error),
}

/// Scan `reader` chunk by chunk and write one record per line to `writer`.
/// Returns the number of records written.
fn scan<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    options: &IndexOptions,
) -> Result<u64, ScanError> {
    let mut chunk = vec![0u8; options.chunk_size];
    let mut offset = 0u64;
    // Bytes of the current line seen in earlier chunks
    let mut carry = 0u64;
    let mut lines = 0u64;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ScanError::Read(e)),
        };

        let mut rest = &chunk[..n];
        while let Some(pos) = rest.iter().position(|&b| b == LINE_TERMINATOR) {
            let record = IndexRecord {
                offset,
                length: pos as u64 + 1 + carry,
            };
            writer
                .write_all(&record.encode())
                .map_err(ScanError::Write)?;

            offset = record.end();
            carry = 0;
            lines += 1;
            rest = &rest[pos + 1..];
        }

        // Lines longer than a chunk keep accumulating
        carry += rest.len() as u64;
    }

    if carry > 0 {
        match options.trailing_line {
            TrailingLine::Index => {
                let record = IndexRecord {
                    offset,
                    length: carry,
                };
                writer
                    .write_all(&record.encode())
                    .map_err(ScanError::Write)?;
                lines += 1;
            }
            TrailingLine::Drop => {
                debug!(bytes = carry, "Dropping unterminated final line");
            }
        }
    }

    Ok(lines)
}
