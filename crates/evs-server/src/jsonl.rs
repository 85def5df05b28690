// crates/evs-server/src/jsonl.rs
// Lossless JSONL codec. Every line becomes a record: parsed JSON with its
// line number, or the raw text of a line that failed to parse. Invalid
// lines survive every operation except a rewrite that drops them, and a
// rewrite records that as a change.

use crate::error::{IoResultExt, Result};
use serde_json::Value;
use std::path::Path;

/// One line of a JSONL file. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Valid { line_number: usize, value: Value },
    Invalid {
        line_number: usize,
        raw: String,
        error: String,
    },
}

impl Record {
    pub fn line_number(&self) -> usize {
        match self {
            Self::Valid { line_number, .. } | Self::Invalid { line_number, .. } => *line_number,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Valid { value, .. } => Some(value),
            Self::Invalid { .. } => None,
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut Value> {
        match self {
            Self::Valid { value, .. } => Some(value),
            Self::Invalid { .. } => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }
}

/// Parse a JSONL document. A trailing empty segment (the text after the
/// final newline) is not a record; interior blank lines are, and round-trip
/// verbatim as invalid records.
pub fn parse_str(data: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut rest = data;
    let mut line_number = 0;
    while !rest.is_empty() {
        line_number += 1;
        let (segment, remainder) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };
        rest = remainder;
        match serde_json::from_str::<Value>(segment) {
            Ok(value) => records.push(Record::Valid { line_number, value }),
            Err(e) => records.push(Record::Invalid {
                line_number,
                raw: segment.to_string(),
                error: e.to_string(),
            }),
        }
    }
    records
}

/// Parse a JSONL file from disk.
pub fn parse_file(path: &Path) -> Result<Vec<Record>> {
    let data = std::fs::read_to_string(path).at(path)?;
    Ok(parse_str(&data))
}

/// Re-emit records: raw text for invalid lines, one-line canonical JSON for
/// valid ones, `\n` separators, a single trailing newline. Empty input
/// yields an empty string.
pub fn stringify(records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        match record {
            Record::Valid { value, .. } => {
                out.push_str(&value.to_string());
            }
            Record::Invalid { raw, .. } => out.push_str(raw),
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert!(parse_str("").is_empty());
        assert_eq!(stringify(&[]), "");
    }

    #[test]
    fn test_parse_valid_and_invalid() {
        let data = "{\"a\":1}\nnot json\n{\"b\":2}\n";
        let records = parse_str(data);
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], Record::Valid { line_number: 1, .. }));
        match &records[1] {
            Record::Invalid { line_number, raw, error } => {
                assert_eq!(*line_number, 2);
                assert_eq!(raw, "not json");
                assert!(!error.is_empty());
            }
            other => panic!("expected invalid record, got {other:?}"),
        }
        assert_eq!(records[2].line_number(), 3);
    }

    #[test]
    fn test_trailing_segment_without_newline_is_a_record() {
        let records = parse_str("{\"a\":1}\n{\"b\":2}");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_trailing_newline_emits_no_empty_record() {
        let records = parse_str("{\"a\":1}\n");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_interior_blank_line_preserved() {
        let data = "{\"a\":1}\n\n{\"b\":2}\n";
        let records = parse_str(data);
        assert_eq!(records.len(), 3);
        assert!(records[1].is_invalid());
        assert_eq!(stringify(&records), data);
    }

    #[test]
    fn test_round_trip_preserves_key_order_and_invalid_lines() {
        let data = "{\"z\":1,\"a\":{\"y\":2,\"b\":3}}\n{oops\n{\"k\":[1,2,3]}\n";
        let records = parse_str(data);
        assert_eq!(stringify(&records), data);
    }

    #[test]
    fn test_round_trip_adds_final_newline() {
        let records = parse_str("{\"a\":1}");
        assert_eq!(stringify(&records), "{\"a\":1}\n");
    }
}
