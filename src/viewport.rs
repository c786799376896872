use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Visible fraction of one list item, `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Visibility {
    pub index: usize,
    pub fraction: f32,
}

impl Visibility {
    pub fn new(index: usize, fraction: f32) -> Self {
        Self { index, fraction }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportConfig {
    pub visible_threshold: f32,
    pub dwell: Duration,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            visible_threshold: 0.8,
            dwell: Duration::from_millis(300),
        }
    }
}

/// Decides which single item counts as active.
///
/// Each item that crosses the visibility threshold gets a timestamp; it only
/// becomes a candidate once it has stayed above the threshold for the dwell
/// time. Items dropping below the threshold lose their timestamp, so a fast
/// fling never produces a report. Reports are edge-triggered: the same index
/// is never reported twice in a row.
#[derive(Debug, Clone)]
pub struct ViewportTracker {
    config: ViewportConfig,
    crossed_at: BTreeMap<usize, Instant>,
    reported: Option<usize>,
}

impl ViewportTracker {
    pub fn new(config: ViewportConfig) -> Self {
        Self {
            config,
            crossed_at: BTreeMap::new(),
            reported: None,
        }
    }

    pub fn reported(&self) -> Option<usize> {
        self.reported
    }

    /// Feeds a full visibility snapshot; items absent from `visible` are
    /// treated as fully hidden. Returns the newly active index, if any.
    pub fn update(&mut self, visible: &[Visibility], now: Instant) -> Option<usize> {
        let threshold = self.config.visible_threshold;
        self.crossed_at.retain(|index, _| {
            visible
                .iter()
                .any(|v| v.index == *index && v.fraction >= threshold)
        });
        for v in visible {
            if v.fraction >= threshold {
                self.crossed_at.entry(v.index).or_insert(now);
            }
        }
        self.tick(now)
    }

    /// Re-evaluates dwell times without new visibility data.
    pub fn tick(&mut self, now: Instant) -> Option<usize> {
        let dwell = self.config.dwell;
        // BTreeMap iterates in index order, so ties resolve to the lowest index.
        let candidate = self
            .crossed_at
            .iter()
            .find(|(_, since)| now.saturating_duration_since(**since) >= dwell)
            .map(|(index, _)| *index)?;
        if self.reported == Some(candidate) {
            return None;
        }
        self.reported = Some(candidate);
        Some(candidate)
    }

    /// Forgets everything, e.g. after the item list was replaced.
    pub fn reset(&mut self) {
        self.crossed_at.clear();
        self.reported = None;
    }

    /// Aligns the last report with an index the controller set directly.
    pub fn acknowledge(&mut self, index: Option<usize>) {
        self.reported = index;
    }
}
