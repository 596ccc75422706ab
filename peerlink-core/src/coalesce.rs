//! Latest-value-per-key batch that flushes on a debounce timer or when it grows past a threshold.
//! Used for outbound signal batches and for broadcast and per-peer replication batches.
//!
//! Time is passed in by the owner so the batch itself stays synchronous; owners select on
//! [`sleep_until`] with the current [`Coalescer::deadline`].

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Coalescer<K, V> {
    window: Duration,
    threshold: usize,
    entries: Vec<(K, V)>,
    deadline: Option<Instant>,
}

impl<K: PartialEq, V> Coalescer<K, V> {
    /// Flush `window` after the last push, or immediately once more than `threshold` entries are queued.
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            entries: Vec::new(),
            deadline: None,
        }
    }

    /// Timer-only batch.
    pub fn with_window(window: Duration) -> Self {
        Self::new(window, usize::MAX)
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Queue `value` under `key`, superseding any queued value for the same key, and restart the timer.
    /// Returns the whole batch if it now exceeds the threshold.
    pub fn push(&mut self, key: K, value: V, now: Instant) -> Option<Vec<(K, V)>> {
        self.insert(key, value);
        if self.entries.len() > self.threshold {
            return Some(self.take());
        }
        self.deadline = Some(now + self.window);
        None
    }

    /// Queue and flush everything at once.
    pub fn push_immediate(&mut self, key: K, value: V) -> Vec<(K, V)> {
        self.insert(key, value);
        self.take()
    }

    /// Batch if the timer has fired.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Vec<(K, V)>> {
        match self.deadline {
            Some(d) if d <= now => Some(self.take()),
            _ => None,
        }
    }

    /// Drain the batch and cancel the timer.
    pub fn take(&mut self) -> Vec<(K, V)> {
        self.deadline = None;
        std::mem::take(&mut self.entries)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, key: K, value: V) {
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            self.entries.remove(pos);
        }
        self.entries.push((key, value));
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
