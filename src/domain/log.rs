use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of captured container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub content: Vec<u8>,
}

impl LogRecord {
    pub fn new(source: LogSource, content: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            content: content.into(),
        }
    }

    /// Parses a line produced with the runtime's `--timestamps` flag
    /// (`<RFC 3339 timestamp> <content>`). Lines without a valid timestamp
    /// are kept whole and stamped with the current time.
    pub fn from_timestamped(source: LogSource, line: &[u8]) -> Self {
        let split = line.iter().position(|b| *b == b' ');
        if let Some(idx) = split {
            let parsed = std::str::from_utf8(&line[..idx])
                .ok()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok());
            if let Some(timestamp) = parsed {
                return Self {
                    timestamp: timestamp.with_timezone(&Utc),
                    source,
                    content: line[idx + 1..].to_vec(),
                };
            }
        }
        Self::new(source, line)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}
