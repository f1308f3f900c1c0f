//! Feeder: pacing queue for interactive, unstructured commands.
//!
//! Ad-hoc lines (jog moves, manual G-code, macros) from any origin are queued
//! here and dispatched strictly one at a time. A line stays "pending" from
//! the moment it is popped until the controller observes the device's
//! acknowledgement and calls [`Feeder::next`] again.

use cnclink_core::{ClientHandle, FeederStatusReport};
use std::collections::VecDeque;

/// A queued ad-hoc line, tagged with its originating client when there is
/// one so the controller can correlate the device echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    /// The client that issued the line, if any
    pub client: Option<ClientHandle>,
    /// The line to send, without terminator
    pub line: String,
}

impl FeedItem {
    /// An item with no originating client (controller-internal traffic)
    pub fn anonymous(line: impl Into<String>) -> Self {
        Self {
            client: None,
            line: line.into(),
        }
    }

    /// An item tagged with its originating client
    pub fn from_client(client: ClientHandle, line: impl Into<String>) -> Self {
        Self {
            client: Some(client),
            line: line.into(),
        }
    }
}

/// Ordered queue with single-line-in-flight dispatch.
#[derive(Debug, Default)]
pub struct Feeder {
    queue: VecDeque<FeedItem>,
    pending: bool,
    last_reported: Option<(usize, bool)>,
}

impl Feeder {
    /// An empty feeder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to the queue
    pub fn feed(&mut self, item: FeedItem) {
        self.queue.push_back(item);
    }

    /// Advance the queue.
    ///
    /// Clears the pending flag if set (the acknowledgement edge), then pops
    /// and returns the next item, marking it pending. Returns `None` when
    /// the queue is empty.
    pub fn next(&mut self) -> Option<FeedItem> {
        self.pending = false;
        let item = self.queue.pop_front()?;
        self.pending = true;
        Some(item)
    }

    /// Whether a line is in flight awaiting acknowledgement
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Drop all queued items; the pending flag is unchanged
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Number of queued items (excluding any in-flight line)
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Current queue snapshot
    pub fn status(&self) -> FeederStatusReport {
        FeederStatusReport {
            queued: self.queue.len(),
            pending: self.pending,
        }
    }

    /// Whether the snapshot differs from the last one observed through this
    /// method. Used by the query timer to publish `feeder:status` at timer
    /// granularity rather than per mutation.
    pub fn status_changed(&mut self) -> bool {
        let current = (self.queue.len(), self.pending);
        let changed = self.last_reported != Some(current);
        self.last_reported = Some(current);
        changed
    }
}
