//! Blocking regex search over the trace buffer
//!
//! A search scans from the buffer's mark (or from the first line) to the tail,
//! and keeps waiting for new lines until it finds a match or its deadline
//! passes. Waiting happens on the buffer's condition variable with a bounded
//! timeout, so a search re-checks on a short interval and never spins.
//!
//! When `first_occurrence_only` is false the scan does not stop at the first
//! match: the last match among the lines present at that check is reported and
//! the mark moves once, to just past that line.

use crate::buffer::TraceBuffer;
use crate::error::SearchError;
use crate::events::{SearchOutcome, TraceLine};
use log::{debug, info};
use regex::Regex;
use std::time::{Duration, Instant};

/// Parameters of a single search
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    /// Regex searched for anywhere in a line
    pub pattern: &'a str,
    /// How long to keep waiting for a match
    pub timeout: Duration,
    /// Scan from the first buffered line instead of the mark
    pub from_start: bool,
    /// Report the first match instead of the last one
    pub first_occurrence_only: bool,
    /// Log the request and response at info level
    pub print_logs: bool,
}

impl<'a> SearchRequest<'a> {
    /// Search from the mark for the first match
    pub fn new(pattern: &'a str, timeout: Duration) -> Self {
        Self {
            pattern,
            timeout,
            from_start: false,
            first_occurrence_only: true,
            print_logs: false,
        }
    }
}

/// Progress of one pass over the buffer
enum Scan {
    Found(TraceLine),
    Pending { len: usize, generation: u64 },
}

/// Blocking pattern search over a [`TraceBuffer`]
#[derive(Debug, Clone)]
pub struct PatternSearchEngine {
    /// Longest wait between two passes over the buffer
    poll_interval: Duration,
}

impl Default for PatternSearchEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl PatternSearchEngine {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Validate and compile a search pattern
    pub fn compile(pattern: &str) -> Result<Regex, SearchError> {
        if pattern.is_empty() {
            return Err(SearchError::InvalidPattern(
                "pattern cannot be empty".to_string(),
            ));
        }
        Regex::new(pattern).map_err(|e| SearchError::InvalidPattern(e.to_string()))
    }

    /// Search `buffer` for `request.pattern`, blocking up to `request.timeout`
    ///
    /// `monitoring_started` tells whether the device ever reached the connected
    /// state. An empty buffer gets one timeout-length grace period to fill up.
    ///
    /// # Errors
    ///
    /// Invalid patterns and zero timeouts are rejected before any waiting.
    pub fn search(
        &self,
        buffer: &TraceBuffer,
        monitoring_started: bool,
        request: &SearchRequest<'_>,
    ) -> Result<SearchOutcome, SearchError> {
        if request.timeout.is_zero() {
            return Err(SearchError::InvalidTimeout);
        }
        let regex = Self::compile(request.pattern)?;

        if request.print_logs {
            info!("[TRACE-PROVIDER] : SEARCH STRING - {}", request.pattern);
            info!(
                "monitoring started: {}, buffer size: {}, mark: {}",
                monitoring_started,
                buffer.len(),
                buffer.mark()
            );
        }

        if !monitoring_started {
            return Ok(SearchOutcome::NotRunning(
                "connection with the device has not been established yet".to_string(),
            ));
        }

        if buffer.is_empty() {
            info!(
                "Waiting {:?} for trace to buffer since buffer is empty",
                request.timeout
            );
            let deadline = Instant::now() + request.timeout;
            while buffer.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(SearchOutcome::NotRunning(
                        "no trace received; connection lost or trace not restarted after a connection loss"
                            .to_string(),
                    ));
                }
                buffer.wait_for_change(0, remaining);
            }
        }

        let outcome = self.scan_until(buffer, &regex, request);

        if request.print_logs {
            info!(
                "[TRACE-PROVIDER] : SEARCH RESPONSE - {}",
                outcome.line().unwrap_or("<none>")
            );
        }
        Ok(outcome)
    }

    fn scan_until(
        &self,
        buffer: &TraceBuffer,
        regex: &Regex,
        request: &SearchRequest<'_>,
    ) -> SearchOutcome {
        let deadline = Instant::now() + request.timeout;
        // Lines below this index have already been checked, valid while the
        // buffer's clear generation is unchanged
        let mut checked: Option<(usize, u64)> = None;

        loop {
            let scan = buffer.with_lines(|lines, mark, generation| {
                let base = if request.from_start { 0 } else { *mark };
                let start = match checked {
                    Some((upto, gen)) if gen == generation => base.max(upto),
                    _ => base,
                };

                let mut hit = None;
                for (offset, line) in lines.iter().enumerate().skip(start) {
                    if regex.is_match(&line.text) {
                        hit = Some(offset);
                        if request.first_occurrence_only {
                            break;
                        }
                    }
                }

                match hit {
                    Some(index) => {
                        *mark = (*mark).max(index + 1);
                        Scan::Found(lines[index].clone())
                    }
                    None => Scan::Pending {
                        len: lines.len(),
                        generation,
                    },
                }
            });

            match scan {
                Scan::Found(line) => {
                    debug!("Trace search for {:?} matched: {}", request.pattern, line.text);
                    return SearchOutcome::Found(line);
                }
                Scan::Pending { len, generation } => {
                    checked = Some((len, generation));
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!(
                            "Trace search for {:?} timed out after {:?}",
                            request.pattern, request.timeout
                        );
                        return SearchOutcome::TimedOut;
                    }
                    buffer.wait_for_change(len, remaining.min(self.poll_interval));
                }
            }
        }
    }
}
