//! Duplicate line suppression
//!
//! Devices sometimes flood their console with the same line. The suppressor
//! admits a bounded run of identical lines and drops the rest until a
//! different line shows up.

use log::debug;
use regex::Regex;
use std::sync::OnceLock;

/// `2024 Jan 01 00:00:00.000000 ` style prefix
fn long_timestamp() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{4} [a-zA-Z]{3} \d{2}\s\d{2}:\d{2}:\d{2}\.[0-9]{6}")
            .expect("long timestamp pattern is valid")
    })
}

/// `190318-05:17:38.304828` style prefix
fn compact_timestamp() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{6}-\d{2}:\d{2}:\d{2}\.[0-9]{6}").expect("compact timestamp pattern is valid")
    })
}

/// Strip a recognized timestamp prefix for comparison
///
/// Lines without one of the two recognized prefixes are returned unchanged.
pub fn strip_timestamp(line: &str) -> &str {
    for re in [long_timestamp(), compact_timestamp()] {
        if let Some(m) = re.find(line) {
            return line[m.end()..].trim_start();
        }
    }
    line
}

/// Decision for a single line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Keep the line
    Admitted,
    /// First line dropped in the current run of repeats
    FloodDetected,
    /// Dropped as a repeat
    Suppressed,
    /// Dropped as blank, before any comparison
    Blank,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Admission::Admitted
    }
}

/// Stateful filter limiting consecutive identical lines
///
/// Lines are compared after their timestamp prefix has been removed. A run of
/// identical lines is admitted up to `limit` lines in total; further repeats are
/// dropped but counted. Any distinct line resets the run and is always admitted.
#[derive(Debug)]
pub struct DuplicateSuppressor {
    /// Maximum lines admitted per run of identical lines
    limit: usize,
    /// Last normalized line seen
    previous: Option<String>,
    /// Length of the current run, including the first line
    run_length: u64,
    /// Lines dropped across the suppressor's lifetime
    suppressed_total: u64,
}

impl DuplicateSuppressor {
    /// Create a suppressor admitting at most `limit` identical lines in a row
    ///
    /// A limit of zero behaves like one: a distinct line is never dropped.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            previous: None,
            run_length: 0,
            suppressed_total: 0,
        }
    }

    /// Decide whether `line` is kept
    pub fn admit(&mut self, line: &str) -> Admission {
        if line.trim().is_empty() {
            return Admission::Blank;
        }

        let normalized = strip_timestamp(line);
        if self.previous.as_deref() != Some(normalized) {
            self.previous = Some(normalized.to_string());
            self.run_length = 1;
            return Admission::Admitted;
        }

        self.run_length += 1;
        if self.run_length <= self.limit as u64 {
            return Admission::Admitted;
        }

        self.suppressed_total += 1;
        if self.run_length == self.limit as u64 + 1 {
            debug!("Line repeated {} times, suppressing: {}", self.limit, normalized);
            Admission::FloodDetected
        } else {
            Admission::Suppressed
        }
    }

    /// Length of the current run of identical lines
    pub fn run_length(&self) -> u64 {
        self.run_length
    }

    /// Lines dropped as repeats so far
    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total
    }

}

impl Default for DuplicateSuppressor {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DUPLICATE_LINE_LIMIT)
    }
}
