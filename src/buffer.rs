//! Ordered in-memory store of recent trace lines
//!
//! The buffer is written by a single collector thread and scanned by any
//! number of search callers. Appends wake waiting searchers through a condition
//! variable, so a search never spins while it waits for new lines.

use crate::events::TraceLine;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct BufferState {
    lines: Vec<TraceLine>,
    /// Start point for the next search, never beyond `lines.len()`
    mark: usize,
    /// Whether pushed lines are retained
    buffering: bool,
    /// Bumped whenever the lines are cleared
    generation: u64,
}

/// Concurrency-safe FIFO of trace lines with a search mark
#[derive(Debug, Default)]
pub struct TraceBuffer {
    state: Mutex<BufferState>,
    changed: Condvar,
}

impl TraceBuffer {
    /// Create an empty buffer
    pub fn new(buffering: bool) -> Self {
        Self {
            state: Mutex::new(BufferState {
                buffering,
                ..BufferState::default()
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line if buffering is on
    ///
    /// Returns whether the line was retained. There is no line cap: the buffer
    /// grows until it is cleared or buffering is stopped, and callers bound it
    /// by stopping buffering between test steps.
    pub fn push(&self, line: TraceLine) -> bool {
        let mut state = self.lock();
        if !state.buffering {
            return false;
        }
        state.lines.push(line);
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Drop every line and reset the mark
    pub fn clear(&self) {
        let mut state = self.lock();
        state.lines.clear();
        state.mark = 0;
        state.generation += 1;
        drop(state);
        self.changed.notify_all();
    }

    /// Clear and start retaining lines
    pub fn start_buffering(&self) {
        let mut state = self.lock();
        state.lines.clear();
        state.mark = 0;
        state.generation += 1;
        state.buffering = true;
        drop(state);
        self.changed.notify_all();
    }

    /// Stop retaining lines and clear
    pub fn stop_buffering(&self) {
        let mut state = self.lock();
        state.buffering = false;
        state.lines.clear();
        state.mark = 0;
        state.generation += 1;
        drop(state);
        self.changed.notify_all();
    }

    /// Turn buffering on or off without clearing; returns the previous setting
    pub fn set_buffering(&self, buffering: bool) -> bool {
        std::mem::replace(&mut self.lock().buffering, buffering)
    }

    pub fn is_buffering(&self) -> bool {
        self.lock().buffering
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// Current search mark
    pub fn mark(&self) -> usize {
        self.lock().mark
    }

    /// Move the mark, clamped to the buffer length
    pub fn set_mark(&self, mark: usize) {
        let mut state = self.lock();
        state.mark = mark.min(state.lines.len());
    }

    /// Move the mark to the tail; returns the previous mark
    pub fn mark_to_tail(&self) -> usize {
        let mut state = self.lock();
        let len = state.lines.len();
        std::mem::replace(&mut state.mark, len)
    }

    /// Copy of the buffered lines, oldest first
    pub fn snapshot(&self) -> Vec<TraceLine> {
        self.lock().lines.clone()
    }

    /// Text of the last `n` lines, newest first
    pub fn last_lines(&self, n: usize) -> Vec<String> {
        self.lock()
            .lines
            .iter()
            .rev()
            .take(n)
            .map(|line| line.text.clone())
            .collect()
    }

    /// Run `f` over the lines, the mark and the clear generation under the lock
    ///
    /// `f` may move the mark; it is clamped to the buffer length afterwards.
    pub(crate) fn with_lines<R>(
        &self,
        f: impl FnOnce(&[TraceLine], &mut usize, u64) -> R,
    ) -> R {
        let mut guard = self.lock();
        let state = &mut *guard;
        let result = f(&state.lines, &mut state.mark, state.generation);
        state.mark = state.mark.min(state.lines.len());
        result
    }

    /// Block until the length differs from `seen_len` or `timeout` passes
    ///
    /// Returns the length observed on wake-up.
    pub fn wait_for_change(&self, seen_len: usize, timeout: Duration) -> usize {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| state.lines.len() == seen_len)
            .unwrap_or_else(PoisonError::into_inner);
        guard.lines.len()
    }
}
