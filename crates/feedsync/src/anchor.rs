//! Scroll anchoring across list mutations.
//!
//! Before staged items are merged above the reader's position, capture the row
//! nearest the top of the viewport; after the next render, restore it so that row
//! stays where it was on screen. The renderer is reached through [`Viewport`], so
//! any embedder (DOM bridge, terminal list) can provide one.

use serde::Serialize;

/// One rendered row: its item id and its top edge in viewport coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRow {
    pub id: String,
    pub top: f64,
}

/// The scroll container as the anchor tracker sees it.
pub trait Viewport {
    /// Top edge of the scroll container, same coordinate space as rows.
    fn container_top(&self) -> f64;
    /// Currently rendered rows (virtualized lists only report what is mounted).
    fn rendered(&self) -> Vec<RenderedRow>;
    /// Adjust the scroll position; positive moves content up.
    fn scroll_by(&mut self, delta: f64);
}

/// Row identity plus its offset from the container top at capture time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anchor {
    pub id: String,
    pub offset: f64,
}

#[derive(Debug, Clone)]
pub struct AnchorTracker {
    reduced_motion: bool,
    noise_px: f64,
}

impl Default for AnchorTracker {
    fn default() -> Self {
        Self {
            reduced_motion: false,
            noise_px: 1.0,
        }
    }
}

impl AnchorTracker {
    pub fn new(reduced_motion: bool) -> Self {
        Self {
            reduced_motion,
            ..Self::default()
        }
    }

    pub fn set_reduced_motion(&mut self, reduced_motion: bool) {
        self.reduced_motion = reduced_motion;
    }

    /// The row whose top is at or below the container top and closest to it.
    pub fn capture(&self, viewport: &dyn Viewport) -> Option<Anchor> {
        let top = viewport.container_top();
        viewport
            .rendered()
            .into_iter()
            .filter(|row| row.top >= top)
            .min_by(|a, b| (a.top - top).total_cmp(&(b.top - top)))
            .map(|row| Anchor {
                offset: row.top - top,
                id: row.id,
            })
    }

    /// Scroll so the anchor row is back at its captured offset. Returns the applied
    /// delta, or `None` when nothing was done.
    pub fn restore(&self, anchor: Option<&Anchor>, viewport: &mut dyn Viewport) -> Option<f64> {
        if self.reduced_motion {
            return None;
        }
        let anchor = anchor?;
        let row = viewport.rendered().into_iter().find(|r| r.id == anchor.id)?;
        let target = viewport.container_top() + anchor.offset;
        let delta = row.top - target;
        if delta.abs() <= self.noise_px {
            return None;
        }
        viewport.scroll_by(delta);
        tracing::trace!(id = %anchor.id, delta, "anchor restored");
        Some(delta)
    }

    /// Compensate a height change of content above the reader (e.g. a row resized).
    pub fn adjust_for_height_delta(&self, delta: f64, viewport: &mut dyn Viewport) -> bool {
        if delta.abs() < self.noise_px {
            return false;
        }
        viewport.scroll_by(delta);
        true
    }
}
