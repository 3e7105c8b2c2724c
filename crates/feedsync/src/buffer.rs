//! Staged feed buffer: what the reader sees versus what has arrived.
//!
//! Arrivals never touch `visible` directly. They collect in a pending accumulator
//! for one debounce window, then land in `staged` in a single transition. Staged
//! items reach `visible` only through [`FeedBuffer::merge_now`], so the list under a
//! reader never reflows on its own.
//!
//! The buffer is driven by explicit instants; the controller arms a timer at
//! [`FeedBuffer::deadline`] and calls [`FeedBuffer::expire`] when it fires.

use std::collections::HashSet;
use tokio::time::Instant;

use crate::config::BufferConfig;
use crate::cursor::Cursor;
use crate::error::FeedError;
use crate::item::{sort_newest_first, Item};

/// Result of applying one batching window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Items that survived dedup and were added to `staged`.
    pub staged: usize,
    /// Pending items dropped because their id was already known.
    pub duplicates: usize,
    /// Staged items dropped to respect `max_buffer`.
    pub evicted: usize,
}

#[derive(Debug)]
pub struct FeedBuffer {
    config: BufferConfig,
    visible: Vec<Item>,
    staged: Vec<Item>,
    cursor: Cursor,
    pending: Vec<Item>,
    pending_cursor: Option<Cursor>,
    deadline: Option<Instant>,
    live: bool,
    revision: u64,
}

impl FeedBuffer {
    pub fn new(config: BufferConfig, initial: Vec<Item>, cursor: Cursor) -> Self {
        let mut visible = dedup_batch(initial, &HashSet::new()).0;
        sort_newest_first(&mut visible);
        visible.truncate(config.max_visible);
        Self {
            config,
            visible,
            staged: Vec::new(),
            cursor,
            pending: Vec::new(),
            pending_cursor: None,
            deadline: None,
            live: false,
            revision: 0,
        }
    }

    pub fn visible(&self) -> &[Item] {
        &self.visible
    }

    pub fn staged(&self) -> &[Item] {
        &self.staged
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Newest cursor known, including a window that has not been applied yet.
    pub fn latest_cursor(&self) -> Cursor {
        self.pending_cursor.map_or(self.cursor, |p| p.max(self.cursor))
    }

    /// Pagination cursor: `published_at` of the oldest visible item.
    pub fn oldest_visible(&self) -> Option<Cursor> {
        self.visible.last().map(|i| Cursor::new(i.published_at))
    }

    pub fn new_count(&self) -> usize {
        self.staged.len()
    }

    pub fn banner_visible(&self) -> bool {
        self.new_count() >= self.config.threshold
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bumped once per applied transition of `visible`, `staged` or the cursor.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// When the open batching window closes, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Queue a batch and restart the batching window.
    ///
    /// A cursor older than the one already known is rejected with
    /// [`FeedError::CursorRegression`]; the items are still queued.
    pub fn add_items(
        &mut self,
        items: Vec<Item>,
        new_cursor: Cursor,
        now: Instant,
    ) -> Result<(), FeedError> {
        self.pending.extend(items);
        self.deadline = Some(now + self.config.batch_window());
        let mut target = self.latest_cursor();
        target.advance(new_cursor)?;
        self.pending_cursor = Some(target);
        Ok(())
    }

    /// Apply the pending window if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<StageReport> {
        match self.deadline {
            Some(at) if now >= at => Some(self.flush()),
            _ => None,
        }
    }

    /// Apply the pending window now, bypassing the debounce.
    pub fn flush(&mut self) -> StageReport {
        self.deadline = None;
        let pending = std::mem::take(&mut self.pending);
        let pending_cursor = self.pending_cursor.take();
        if pending.is_empty() && pending_cursor.is_none() {
            return StageReport::default();
        }

        let known: HashSet<&str> = self
            .visible
            .iter()
            .chain(self.staged.iter())
            .map(|i| i.id.as_str())
            .collect();
        let (fresh, duplicates) = dedup_batch(pending, &known);

        let mut report = StageReport {
            staged: fresh.len(),
            duplicates,
            evicted: 0,
        };
        if !fresh.is_empty() {
            self.staged.extend(fresh);
            sort_newest_first(&mut self.staged);
            report.evicted = self.staged.len().saturating_sub(self.config.max_buffer);
            self.staged.truncate(self.config.max_buffer);
        }
        // The caller's cursor reflects what the server has already handed out, so it
        // advances even when every item was a duplicate.
        if let Some(next) = pending_cursor {
            if next > self.cursor {
                self.cursor = next;
            }
        }
        self.revision += 1;
        tracing::debug!(
            staged = report.staged,
            duplicates = report.duplicates,
            evicted = report.evicted,
            cursor = %self.cursor,
            "batch applied"
        );
        report
    }

    /// Promote everything staged into the visible list.
    pub fn merge_now(&mut self) -> usize {
        if self.staged.is_empty() {
            return 0;
        }
        let promoted = self.staged.len();
        let mut merged = std::mem::take(&mut self.staged);
        merged.append(&mut self.visible);
        sort_newest_first(&mut merged);
        merged.truncate(self.config.max_visible);
        self.visible = merged;
        self.revision += 1;
        promoted
    }

    /// Add an older page below the visible list. Returns how many items were new.
    pub fn append_to_visible(&mut self, items: Vec<Item>) -> usize {
        let known: HashSet<&str> = self.visible.iter().map(|i| i.id.as_str()).collect();
        let (fresh, _) = dedup_batch(items, &known);
        let added = fresh.len();
        self.visible.extend(fresh);
        sort_newest_first(&mut self.visible);
        self.visible.truncate(self.config.max_visible);
        self.revision += 1;
        added
    }

    /// Drop the open window and stop being live. Visible and staged stay.
    pub fn disconnect(&mut self) {
        self.deadline = None;
        self.pending.clear();
        self.pending_cursor = None;
        self.live = false;
    }
}

/// Keep the first occurrence of every id not already in `known`.
fn dedup_batch(items: Vec<Item>, known: &HashSet<&str>) -> (Vec<Item>, usize) {
    let total = items.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(total);
    let fresh: Vec<Item> = items
        .into_iter()
        .filter(|i| !known.contains(i.id.as_str()) && seen.insert(i.id.clone()))
        .collect();
    let dropped = total - fresh.len();
    (fresh, dropped)
}
