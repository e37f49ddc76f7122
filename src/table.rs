//! Typed row sinks for the output tables
//!
//! Every output stream is a [`TableSink`]: a fixed column list plus a row
//! writer. Text mode is tab-delimited with a header row, compatible with the
//! existing downstream tooling; binary mode is a length-prefixed packed
//! encoding, optionally gzip-compressed. Column order is load-bearing and is
//! checked on every row.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

/// One typed value in a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Real(f64),
    Str(String),
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Cell::Bool(v)
    }
}

impl From<i32> for Cell {
    fn from(v: i32) -> Self {
        Cell::Int(v as i64)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<u64> for Cell {
    fn from(v: u64) -> Self {
        Cell::UInt(v)
    }
}

impl From<usize> for Cell {
    fn from(v: usize) -> Self {
        Cell::UInt(v as u64)
    }
}

impl From<u32> for Cell {
    fn from(v: u32) -> Self {
        Cell::UInt(v as u64)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Real(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Str(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Str(v)
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open table file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("row has {got} cells but table '{table}' declares {want} columns")]
    Arity {
        table: String,
        want: usize,
        got: usize,
    },
    #[error("write to table '{table}' failed: {source}")]
    Write {
        table: String,
        #[source]
        source: io::Error,
    },
}

/// Cell tags for the binary encoding.
const TAG_BOOL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_UINT: u8 = 2;
const TAG_REAL: u8 = 3;
const TAG_STR: u8 = 4;

enum SinkWriter {
    Plain(BufWriter<File>),
    Gzip(Box<GzEncoder<BufWriter<File>>>),
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Plain(w) => w.write(buf),
            SinkWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Plain(w) => w.flush(),
            SinkWriter::Gzip(w) => w.flush(),
        }
    }
}

pub struct TableSink {
    name: String,
    columns: &'static [&'static str],
    binary: bool,
    writer: SinkWriter,
}

impl std::fmt::Debug for TableSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSink")
            .field("name", &self.name)
            .field("columns", &self.columns.len())
            .field("binary", &self.binary)
            .finish()
    }
}

impl TableSink {
    /// Open (or append to) `dir/name`, writing the header immediately.
    ///
    /// Compression applies to binary mode only; text tables stay greppable.
    pub fn open(
        dir: &Path,
        name: &str,
        columns: &'static [&'static str],
        truncate: bool,
        binary: bool,
        compression_level: u32,
    ) -> Result<Self, SinkError> {
        let path = dir.join(name);
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        if truncate {
            options.truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(&path).map_err(|source| SinkError::Open {
            path: path.clone(),
            source,
        })?;
        let buffered = BufWriter::new(file);

        let writer = if binary && compression_level > 0 {
            SinkWriter::Gzip(Box::new(GzEncoder::new(
                buffered,
                Compression::new(compression_level),
            )))
        } else {
            SinkWriter::Plain(buffered)
        };

        let mut sink = Self {
            name: name.to_string(),
            columns,
            binary,
            writer,
        };
        sink.write_header()?;
        Ok(sink)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn io_err(&self, source: io::Error) -> SinkError {
        SinkError::Write {
            table: self.name.clone(),
            source,
        }
    }

    fn write_header(&mut self) -> Result<(), SinkError> {
        if self.binary {
            let count = self.columns.len() as u32;
            let mut buf = count.to_le_bytes().to_vec();
            for column in self.columns {
                buf.extend_from_slice(&(column.len() as u32).to_le_bytes());
                buf.extend_from_slice(column.as_bytes());
            }
            self.writer.write_all(&buf).map_err(|e| self.io_err(e))
        } else {
            let header = self.columns.join("\t");
            self.writer
                .write_all(header.as_bytes())
                .and_then(|_| self.writer.write_all(b"\n"))
                .map_err(|e| self.io_err(e))
        }
    }

    pub fn write_row(&mut self, cells: &[Cell]) -> Result<(), SinkError> {
        if cells.len() != self.columns.len() {
            return Err(SinkError::Arity {
                table: self.name.clone(),
                want: self.columns.len(),
                got: cells.len(),
            });
        }
        if self.binary {
            self.write_binary_row(cells)
        } else {
            self.write_text_row(cells)
        }
    }

    fn write_text_row(&mut self, cells: &[Cell]) -> Result<(), SinkError> {
        let mut line = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                line.push('\t');
            }
            match cell {
                Cell::Bool(v) => line.push_str(if *v { "1" } else { "0" }),
                Cell::Int(v) => line.push_str(&v.to_string()),
                Cell::UInt(v) => line.push_str(&v.to_string()),
                Cell::Real(v) => line.push_str(&v.to_string()),
                Cell::Str(v) => line.push_str(&escape_text_field(v)),
            }
        }
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .map_err(|e| self.io_err(e))
    }

    fn write_binary_row(&mut self, cells: &[Cell]) -> Result<(), SinkError> {
        let mut buf = Vec::with_capacity(cells.len() * 9);
        for cell in cells {
            match cell {
                Cell::Bool(v) => {
                    buf.push(TAG_BOOL);
                    buf.push(u8::from(*v));
                }
                Cell::Int(v) => {
                    buf.push(TAG_INT);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                Cell::UInt(v) => {
                    buf.push(TAG_UINT);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                Cell::Real(v) => {
                    buf.push(TAG_REAL);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                Cell::Str(v) => {
                    buf.push(TAG_STR);
                    buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    buf.extend_from_slice(v.as_bytes());
                }
            }
        }
        self.writer.write_all(&buf).map_err(|e| self.io_err(e))
    }

    /// Flush buffered rows and finalize the compressed stream, if any.
    pub fn finish(self) -> Result<(), SinkError> {
        let name = self.name;
        let err = |source| SinkError::Write {
            table: name.clone(),
            source,
        };
        match self.writer {
            SinkWriter::Plain(mut w) => w.flush().map_err(err),
            SinkWriter::Gzip(w) => w.finish().and_then(|mut inner| inner.flush()).map_err(err),
        }
    }
}

/// Keep tab-delimited rows parseable when a string field carries the
/// delimiter or a line break.
fn escape_text_field(field: &str) -> String {
    if field.contains('\t') || field.contains('\n') {
        field.replace('\t', "\\t").replace('\n', "\\n")
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const COLUMNS: &[&str] = &["name", "count", "flag"];

    fn row(name: &str, count: u64, flag: bool) -> Vec<Cell> {
        vec![Cell::from(name), Cell::from(count), Cell::from(flag)]
    }

    #[test]
    fn test_text_sink_writes_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let mut sink = TableSink::open(dir.path(), "counts", COLUMNS, true, false, 0).unwrap();
        sink.write_row(&row("force", 3, true)).unwrap();
        sink.write_row(&row("lookup", 0, false)).unwrap();
        sink.finish().unwrap();

        let text = fs::read_to_string(dir.path().join("counts")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name\tcount\tflag");
        assert_eq!(lines[1], "force\t3\t1");
        assert_eq!(lines[2], "lookup\t0\t0");
    }

    #[test]
    fn test_text_escapes_embedded_delimiters() {
        assert_eq!(escape_text_field("a\tb"), "a\\tb");
        assert_eq!(escape_text_field("a\nb"), "a\\nb");
        assert_eq!(escape_text_field("plain"), "plain");
    }

    #[test]
    fn test_arity_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut sink = TableSink::open(dir.path(), "counts", COLUMNS, true, false, 0).unwrap();
        let err = sink.write_row(&[Cell::from("x")]).unwrap_err();
        assert!(matches!(err, SinkError::Arity { want: 3, got: 1, .. }));
    }

    #[test]
    fn test_binary_sink_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut sink = TableSink::open(dir.path(), "counts", COLUMNS, true, true, 0).unwrap();
        sink.write_row(&row("force", 7, true)).unwrap();
        sink.finish().unwrap();

        let bytes = fs::read(dir.path().join("counts")).unwrap();
        let mut at = 0usize;

        let ncols = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        at += 4;
        assert_eq!(ncols, 3);
        for expected in COLUMNS {
            let len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
            at += 4;
            assert_eq!(&bytes[at..at + len], expected.as_bytes());
            at += len;
        }

        assert_eq!(bytes[at], TAG_STR);
        at += 1;
        let len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        assert_eq!(&bytes[at..at + len], b"force");
        at += len;

        assert_eq!(bytes[at], TAG_UINT);
        at += 1;
        assert_eq!(
            u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()),
            7
        );
        at += 8;

        assert_eq!(bytes[at], TAG_BOOL);
        assert_eq!(bytes[at + 1], 1);
        assert_eq!(at + 2, bytes.len());
    }

    #[test]
    fn test_compressed_binary_sink_has_gzip_magic() {
        let dir = TempDir::new().unwrap();
        let mut sink = TableSink::open(dir.path(), "counts", COLUMNS, true, true, 6).unwrap();
        sink.write_row(&row("force", 1, false)).unwrap();
        sink.finish().unwrap();

        let bytes = fs::read(dir.path().join("counts")).unwrap();
        assert_eq!(&bytes[0..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_truncate_replaces_previous_contents() {
        let dir = TempDir::new().unwrap();
        let mut sink = TableSink::open(dir.path(), "counts", COLUMNS, true, false, 0).unwrap();
        sink.write_row(&row("stale", 9, false)).unwrap();
        sink.finish().unwrap();

        let sink = TableSink::open(dir.path(), "counts", COLUMNS, true, false, 0).unwrap();
        sink.finish().unwrap();

        let text = fs::read_to_string(dir.path().join("counts")).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(!text.contains("stale"));
    }
}
