//! JSON-lines record source
//!
//! One record per line:
//!
//! ```text
//! {"encoded":[1,2,3],"derived":[{"encoded":[4],"features":{"1":2}}]}
//! {"hash":42,"encoded":[9],"derived":[]}
//! ```
//!
//! `hash` is optional; when absent it is computed from `encoded`. Blank
//! lines are skipped.

use crate::error::{SourceError, SourceResult};
use crate::record::{DerivedRecord, Record, RecordSource};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk shape of one line
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<u64>,

    pub encoded: Vec<u8>,

    #[serde(default)]
    pub derived: Vec<DerivedRecord>,
}

impl From<RecordLine> for Record {
    fn from(line: RecordLine) -> Self {
        match line.hash {
            Some(hash) => Record::with_hash(hash, line.encoded, line.derived),
            None => Record::new(line.encoded, line.derived),
        }
    }
}

impl From<&Record> for RecordLine {
    fn from(record: &Record) -> Self {
        Self {
            hash: Some(record.content_hash()),
            encoded: record.encoded().to_vec(),
            derived: record.derived().to_vec(),
        }
    }
}

/// One undecoded non-blank line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// 1-based physical line number
    pub line: usize,
    pub text: String,
}

/// Streams records from a JSON-lines file
pub struct JsonLinesSource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,

    /// Physical line number of the last line read
    line: usize,

    /// Records handed out
    position: usize,

    /// Non-blank lines, counted once at open
    total: usize,
}

impl JsonLinesSource {
    /// Open `path`, counting its records up front for progress reporting
    pub fn open(path: &Path) -> SourceResult<Self> {
        let io_err = |source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut total = 0;
        for line in BufReader::new(File::open(path).map_err(io_err)?).lines() {
            if !line.map_err(io_err)?.trim().is_empty() {
                total += 1;
            }
        }

        let lines = BufReader::new(File::open(path).map_err(io_err)?).lines();
        debug!(path = %path.display(), records = total, "Opened record source");

        Ok(Self {
            path: path.to_path_buf(),
            lines,
            line: 0,
            position: 0,
            total,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for JsonLinesSource {
    type Raw = RawLine;

    fn next_raw(&mut self) -> SourceResult<Option<RawLine>> {
        for text in self.lines.by_ref() {
            self.line += 1;
            let text = text.map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
            if text.trim().is_empty() {
                continue;
            }

            self.position += 1;
            return Ok(Some(RawLine {
                line: self.line,
                text,
            }));
        }
        Ok(None)
    }

    fn decode(raw: RawLine) -> SourceResult<Record> {
        let parsed: RecordLine =
            serde_json::from_str(raw.text.trim()).map_err(|e| SourceError::Parse {
                line: raw.line,
                reason: e.to_string(),
            })?;
        Ok(parsed.into())
    }

    fn record_count(&self) -> usize {
        self.total
    }

    fn current_index(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn source(contents: &str) -> (NamedTempFile, JsonLinesSource) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        let source = JsonLinesSource::open(file.path()).unwrap();
        (file, source)
    }

    #[test]
    fn test_reads_records_and_skips_blank_lines() {
        let (_file, mut src) = source(
            "{\"encoded\":[1,2],\"derived\":[{\"encoded\":[3],\"features\":{\"7\":2}}]}\n\
             \n\
             {\"hash\":42,\"encoded\":[9]}\n",
        );
        assert_eq!(src.record_count(), 2);

        let first = src.next_record().unwrap().unwrap();
        assert_eq!(first.content_hash(), content_hash(&[1, 2]));
        assert_eq!(first.derived_count(), 1);
        assert_eq!(first.derived()[0].features.get(&7), Some(&2));

        let second = src.next_record().unwrap().unwrap();
        assert_eq!(second.content_hash(), 42);
        assert_eq!(second.derived_count(), 0);

        assert!(src.next_record().unwrap().is_none());
        assert_eq!(src.current_index(), 2);
    }

    #[test]
    fn test_parse_error_names_line() {
        let (_file, mut src) = source("{\"encoded\":[1]}\n\n{not json}\n");
        assert!(src.next_record().unwrap().is_some());
        match src.next_record() {
            Err(SourceError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {:?}", other.map(|r| r.is_some())),
        }
    }

    #[test]
    fn test_raw_stage_defers_parsing() {
        let (_file, mut src) = source("\n{broken\n{\"encoded\":[4]}\n");

        let bad = src.next_raw().unwrap().unwrap();
        assert_eq!(bad.line, 2);
        assert_eq!(src.current_index(), 1);
        let good = src.next_raw().unwrap().unwrap();
        assert!(src.next_raw().unwrap().is_none());

        assert!(matches!(
            JsonLinesSource::decode(bad),
            Err(SourceError::Parse { line: 2, .. })
        ));
        let record = JsonLinesSource::decode(good).unwrap();
        assert_eq!(record.content_hash(), content_hash(&[4]));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            JsonLinesSource::open(Path::new("/nonexistent/records.jsonl")),
            Err(SourceError::Io { .. })
        ));
    }

    #[test]
    fn test_record_line_keeps_hash() {
        let record = Record::with_hash(5, vec![1], Vec::new());
        let json = serde_json::to_string(&RecordLine::from(&record)).unwrap();
        assert_eq!(json, "{\"hash\":5,\"encoded\":[1],\"derived\":[]}");
    }
}
