//! Scroll anchoring for a message list that grows at both ends.
//!
//! Pure state: the presentation layer feeds in scroll metrics and heights and
//! applies the offsets it gets back.

pub const DEFAULT_NEAR_BOTTOM_THRESHOLD: u32 = 100;

/// Geometry of the scroll container, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrollMetrics {
    pub scroll_top: u32,
    pub scroll_height: u32,
    pub client_height: u32,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> u32 {
        self.scroll_height
            .saturating_sub(self.scroll_top.saturating_add(self.client_height))
    }
}

/// Offset that keeps the previously first row in place after content of
/// `post_height - pre_height` pixels was inserted above it.
pub fn anchor_offset(pre_height: u32, post_height: u32) -> u32 {
    post_height.saturating_sub(pre_height)
}

#[derive(Debug, Clone)]
pub struct ViewportAnchor {
    threshold: u32,
    near_bottom: bool,
    /// Scroll height recorded by `begin_prepend`.
    pending: Option<u32>,
}

impl Default for ViewportAnchor {
    fn default() -> Self {
        Self::new(DEFAULT_NEAR_BOTTOM_THRESHOLD)
    }
}

impl ViewportAnchor {
    /// A fresh list follows the bottom until the user scrolls away.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            near_bottom: true,
            pending: None,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn on_scroll(&mut self, metrics: ScrollMetrics) -> bool {
        self.near_bottom = metrics.distance_from_bottom() <= self.threshold;
        self.near_bottom
    }

    pub fn is_near_bottom(&self) -> bool {
        self.near_bottom
    }

    pub fn is_prepending(&self) -> bool {
        self.pending.is_some()
    }

    /// Records the geometry before an older page is requested.
    pub fn begin_prepend(&mut self, metrics: ScrollMetrics) {
        self.pending = Some(metrics.scroll_height);
    }

    /// Returns the scroll offset to apply once the older page has rendered
    /// at `scroll_height`, or `None` without a matching `begin_prepend`.
    ///
    /// The offset is `anchor_offset(H1, H2)` whatever the scroll position was
    /// when the page was requested.
    pub fn complete_prepend(&mut self, scroll_height: u32) -> Option<u32> {
        let pre_height = self.pending.take()?;
        Some(anchor_offset(pre_height, scroll_height))
    }

    /// Drops the recorded geometry after a failed or skipped load.
    pub fn cancel_prepend(&mut self) {
        self.pending = None;
    }

    /// Whether to scroll to the bottom after a message was appended.
    pub fn on_append(&self) -> bool {
        self.near_bottom && self.pending.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(scroll_top: u32, scroll_height: u32) -> ScrollMetrics {
        ScrollMetrics {
            scroll_top,
            scroll_height,
            client_height: 600,
        }
    }

    #[test]
    fn offset_is_height_difference() {
        assert_eq!(anchor_offset(1_200, 2_000), 800);
        assert_eq!(anchor_offset(2_000, 2_000), 0);
        assert_eq!(anchor_offset(2_000, 1_500), 0);
    }

    #[test]
    fn prepend_from_top_restores_position() {
        let mut anchor = ViewportAnchor::default();
        anchor.on_scroll(at(0, 1_200));
        anchor.begin_prepend(at(0, 1_200));
        assert!(anchor.is_prepending());
        assert_eq!(anchor.complete_prepend(2_000), Some(800));
        assert!(!anchor.is_prepending());
        assert_eq!(anchor.complete_prepend(2_400), None);
    }

    #[test]
    fn prepend_offset_ignores_scroll_position() {
        let mut anchor = ViewportAnchor::default();
        anchor.begin_prepend(at(40, 1_200));
        assert_eq!(anchor.complete_prepend(1_700), Some(500));

        anchor.begin_prepend(at(350, 1_700));
        assert_eq!(anchor.complete_prepend(1_700), Some(0));
    }

    #[test]
    fn near_bottom_uses_threshold() {
        let mut anchor = ViewportAnchor::new(100);
        assert!(anchor.on_scroll(at(1_400, 2_000)));
        assert!(anchor.on_scroll(at(1_300, 2_000)));
        assert!(!anchor.on_scroll(at(1_299, 2_000)));
        assert!(!anchor.on_append());
    }

    #[test]
    fn append_scrolls_only_near_bottom_and_idle() {
        let mut anchor = ViewportAnchor::default();
        assert!(anchor.on_append());

        anchor.begin_prepend(at(1_400, 2_000));
        assert!(!anchor.on_append());
        anchor.cancel_prepend();
        assert!(anchor.on_append());

        anchor.on_scroll(at(0, 2_000));
        assert!(!anchor.on_append());
    }
}
