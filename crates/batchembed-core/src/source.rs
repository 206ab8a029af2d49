//! Line-delimited JSON record source.
//!
//! Every physical line counts toward chunk positions, valid or not, so chunk
//! boundaries depend only on line numbers.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::Record;

/// Outcome of reading one physical line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLine {
    Record(Record),
    /// Blank, malformed, missing fields, or empty after cleaning.
    Skipped,
}

/// Strips links, mentions/hashtag markers and redundant whitespace, then caps length.
#[derive(Debug, Clone)]
pub struct TextCleaner {
    url: Regex,
    spaces: Regex,
    max_chars: usize,
}

impl TextCleaner {
    pub fn new(max_chars: usize) -> Result<Self> {
        let url = Regex::new(r"https?://\S+").map_err(|e| Error::Operation(e.to_string()))?;
        let spaces = Regex::new(r"\s+").map_err(|e| Error::Operation(e.to_string()))?;
        Ok(Self { url, spaces, max_chars })
    }

    pub fn clean(&self, text: &str) -> String {
        let no_links = self.url.replace_all(text, "");
        let no_markers = no_links.replace(['@', '#'], "");
        let collapsed = self.spaces.replace_all(&no_markers, " ");
        collapsed.trim().chars().take(self.max_chars).collect()
    }
}

#[derive(Deserialize)]
struct RawLine {
    #[serde(rename = "_id")]
    id: Option<Value>,
    text: Option<Value>,
}

fn extract_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => match map.get("$oid") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

pub struct RecordSource<R> {
    reader: R,
    label: String,
    line_no: u64,
    buf: Vec<u8>,
    cleaner: Option<TextCleaner>,
}

impl RecordSource<BufReader<File>> {
    pub fn open(path: &Path, cleaner: Option<TextCleaner>) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::from_reader(BufReader::with_capacity(1 << 20, file), path.display().to_string(), cleaner))
    }
}

impl<R: BufRead> RecordSource<R> {
    pub fn from_reader(reader: R, label: impl Into<String>, cleaner: Option<TextCleaner>) -> Self {
        Self { reader, label: label.into(), line_no: 0, buf: Vec::with_capacity(4096), cleaner }
    }

    /// Number of physical lines consumed so far.
    pub fn line_no(&self) -> u64 {
        self.line_no
    }

    fn read_raw(&mut self) -> Result<bool> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|e| Error::io(PathBuf::from(&self.label), e))?;
        if n == 0 {
            return Ok(false);
        }
        self.line_no += 1;
        Ok(true)
    }

    /// Read and classify the next line; `None` at end of input.
    pub fn next_line(&mut self) -> Result<Option<SourceLine>> {
        if !self.read_raw()? {
            return Ok(None);
        }
        let line_no = self.line_no;
        let Ok(line) = std::str::from_utf8(&self.buf) else {
            warn!(source = %self.label, line = line_no, "skipping non-UTF-8 line");
            return Ok(Some(SourceLine::Skipped));
        };
        let line = line.trim();
        if line.is_empty() {
            return Ok(Some(SourceLine::Skipped));
        }
        let raw: RawLine = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(source = %self.label, line = line_no, error = %e, "skipping malformed line");
                return Ok(Some(SourceLine::Skipped));
            }
        };
        let Some(id) = raw.id.as_ref().and_then(extract_id) else {
            warn!(source = %self.label, line = line_no, "skipping line without usable _id");
            return Ok(Some(SourceLine::Skipped));
        };
        let text = match raw.text {
            Some(Value::String(t)) => t,
            _ => return Ok(Some(SourceLine::Skipped)),
        };
        let text = match &self.cleaner {
            Some(c) => c.clean(&text),
            None => text,
        };
        if text.trim().is_empty() {
            return Ok(Some(SourceLine::Skipped));
        }
        Ok(Some(SourceLine::Record(Record { id, text })))
    }

    /// Discard up to `n` lines without parsing them; returns how many existed.
    pub fn skip_lines(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n && self.read_raw()? {
            skipped += 1;
        }
        Ok(skipped)
    }
}

impl<R: BufRead> Iterator for RecordSource<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_line() {
                Ok(Some(SourceLine::Record(r))) => return Some(Ok(r)),
                Ok(Some(SourceLine::Skipped)) => continue,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(input: &str, cleaner: Option<TextCleaner>) -> RecordSource<Cursor<Vec<u8>>> {
        RecordSource::from_reader(Cursor::new(input.as_bytes().to_vec()), "mem", cleaner)
    }

    #[test]
    fn reads_string_numeric_and_oid_ids() {
        let input = concat!(
            "{\"_id\": \"a\", \"text\": \"first\"}\n",
            "{\"_id\": 42, \"text\": \"second\"}\n",
            "{\"_id\": {\"$oid\": \"65f0\"}, \"text\": \"third\"}\n",
        );
        let ids: Vec<String> = source(input, None).map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec!["a", "42", "65f0"]);
    }

    #[test]
    fn malformed_lines_are_skipped_but_counted() {
        let input = "not json\n\n{\"_id\":\"x\"}\n{\"_id\":\"y\",\"text\":\"ok\"}\n{\"_id\":\"z\",\"text\":\"\"}";
        let mut src = source(input, None);
        let mut kinds = Vec::new();
        while let Some(line) = src.next_line().unwrap() {
            kinds.push(matches!(line, SourceLine::Record(_)));
        }
        assert_eq!(kinds, vec![false, false, false, true, false]);
        assert_eq!(src.line_no(), 5);
    }

    #[test]
    fn skip_lines_stops_at_eof() {
        let mut src = source("1\n2\n3\n", None);
        assert_eq!(src.skip_lines(2).unwrap(), 2);
        assert_eq!(src.skip_lines(5).unwrap(), 1);
        assert_eq!(src.skip_lines(5).unwrap(), 0);
        assert_eq!(src.line_no(), 3);
    }

    #[test]
    fn cleaner_strips_links_and_markers() {
        let c = TextCleaner::new(1000).unwrap();
        assert_eq!(c.clean("hey @bob   look https://t.co/xyz #rust\n now"), "hey bob look rust now");
        let short = TextCleaner::new(4).unwrap();
        assert_eq!(short.clean("abcdefgh"), "abcd");
    }

    #[test]
    fn text_that_cleans_to_nothing_is_skipped() {
        let c = TextCleaner::new(1000).unwrap();
        let mut src = source("{\"_id\":\"a\",\"text\":\"https://only.link\"}\n", Some(c));
        assert_eq!(src.next_line().unwrap(), Some(SourceLine::Skipped));
    }
}
