//! Log records and line framing.

use crate::utils::Timestamp;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

/// One log line of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// When the line was written; the read time if the line had no
    /// parseable timestamp.
    pub timestamp: Timestamp,
    /// Pod that wrote the line.
    pub pod_name: String,
    /// The line, with or without its timestamp prefix as requested.
    pub content: String,
}

impl LogEntry {
    /// Parses a line read with timestamps on (`"<rfc3339> <content>"`).
    ///
    /// The prefix is kept in `content` only when `keep_timestamp` is set.
    #[must_use]
    pub fn parse(pod_name: &str, line: &str, keep_timestamp: bool, now: Timestamp) -> Self {
        let parsed = line.split_once(' ').and_then(|(prefix, rest)| {
            chrono::DateTime::parse_from_rfc3339(prefix)
                .ok()
                .map(|ts| (ts.with_timezone(&chrono::Utc), rest))
        });
        let (timestamp, content) = match parsed {
            Some((ts, rest)) if !keep_timestamp => (ts, rest.to_string()),
            Some((ts, _)) => (ts, line.to_string()),
            None => (now, line.to_string()),
        };
        Self {
            timestamp,
            pod_name: pod_name.to_string(),
            content,
        }
    }
}

/// Sorts entries by timestamp, keeping arrival order for equal times.
pub fn sort_entries(entries: &mut [LogEntry]) {
    entries.sort_by_key(|e| e.timestamp);
}

/// Cuts a byte stream into lines, splitting lines longer than a limit.
#[derive(Debug)]
pub struct LineSplitter {
    buffer: BytesMut,
    max_line_bytes: usize,
}

impl LineSplitter {
    /// Creates a splitter emitting at most `max_line_bytes` per line.
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Feeds a chunk and returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        loop {
            match self.buffer.iter().position(|b| *b == b'\n') {
                Some(pos) if pos <= self.max_line_bytes => {
                    let line = self.buffer.split_to(pos);
                    self.buffer.advance(1);
                    lines.push(decode(&line));
                }
                _ if self.buffer.len() > self.max_line_bytes => {
                    let part = self.buffer.split_to(self.max_line_bytes);
                    lines.push(decode(&part));
                }
                _ => return lines,
            }
        }
    }

    /// Returns the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        Some(decode(&rest))
    }
}

fn decode(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.strip_suffix('\r').unwrap_or(&*text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> Timestamp {
        chrono::Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_strips_or_keeps_prefix() {
        let line = "2024-01-01T00:00:10.5Z hello world";
        let stripped = LogEntry::parse("p", line, false, now());
        assert_eq!(stripped.content, "hello world");
        assert_eq!(
            stripped.timestamp,
            chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap() + chrono::Duration::milliseconds(500)
        );

        let kept = LogEntry::parse("p", line, true, now());
        assert_eq!(kept.content, line);
        assert_eq!(kept.timestamp, stripped.timestamp);
    }

    #[test]
    fn test_unparseable_timestamp_uses_now() {
        let entry = LogEntry::parse("p", "no timestamp here", false, now());
        assert_eq!(entry.timestamp, now());
        assert_eq!(entry.content, "no timestamp here");
        assert_eq!(LogEntry::parse("p", "", false, now()).content, "");
    }

    #[test]
    fn test_sort_is_stable() {
        let t = now();
        let mut entries = vec![
            LogEntry { timestamp: t, pod_name: "b".into(), content: "2".into() },
            LogEntry { timestamp: t - chrono::Duration::seconds(1), pod_name: "a".into(), content: "1".into() },
            LogEntry { timestamp: t, pod_name: "a".into(), content: "3".into() },
        ];
        sort_entries(&mut entries);
        let order: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(order, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_splitter_across_chunks() {
        let mut splitter = LineSplitter::new(1024);
        assert_eq!(splitter.push(b"one\ntw"), vec!["one".to_string()]);
        assert_eq!(splitter.push(b"o\r\nthree"), vec!["two".to_string()]);
        assert_eq!(splitter.finish(), Some("three".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_cuts_long_lines() {
        let mut splitter = LineSplitter::new(4);
        assert_eq!(splitter.push(b"abcdefghij"), vec!["abcd".to_string(), "efgh".to_string()]);
        assert_eq!(splitter.push(b"\nxy\n"), vec!["ij".to_string(), "xy".to_string()]);
        assert_eq!(splitter.finish(), None);
    }
}
