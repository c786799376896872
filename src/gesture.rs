use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GestureConfig {
    pub double_tap: Duration,
    pub long_press: Duration,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            double_tap: Duration::from_millis(300),
            long_press: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    Tap,
    DoubleTap,
    LongPressStart,
    LongPressEnd,
}

/// Classifies raw press/release input on a feed item.
///
/// A press held past `long_press` is a long press and is never also counted
/// as a tap. A tap released within `double_tap` of the previous tap is a
/// double tap; the first tap of the pair has already been delivered as `Tap`.
/// Long presses are only detected through [`GestureRecognizer::tick`], so the
/// host must tick while a press is down.
#[derive(Debug, Clone)]
pub struct GestureRecognizer {
    config: GestureConfig,
    pressed_at: Option<Instant>,
    long_pressing: bool,
    last_tap: Option<Instant>,
}

impl GestureRecognizer {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            pressed_at: None,
            long_pressing: false,
            last_tap: None,
        }
    }

    pub fn is_long_pressing(&self) -> bool {
        self.long_pressing
    }

    pub fn press(&mut self, now: Instant) {
        self.pressed_at = Some(now);
        self.long_pressing = false;
    }

    pub fn tick(&mut self, now: Instant) -> Option<Gesture> {
        let pressed_at = self.pressed_at?;
        if self.long_pressing || now.saturating_duration_since(pressed_at) < self.config.long_press {
            return None;
        }
        self.long_pressing = true;
        self.last_tap = None;
        Some(Gesture::LongPressStart)
    }

    pub fn release(&mut self, now: Instant) -> Option<Gesture> {
        let pressed_at = self.pressed_at.take()?;
        if std::mem::take(&mut self.long_pressing) {
            return Some(Gesture::LongPressEnd);
        }
        if now.saturating_duration_since(pressed_at) >= self.config.long_press {
            // Held long enough but never ticked: treat as a cancelled press.
            return None;
        }
        match self.last_tap {
            Some(previous) if now.saturating_duration_since(previous) < self.config.double_tap => {
                self.last_tap = None;
                Some(Gesture::DoubleTap)
            }
            _ => {
                self.last_tap = Some(now);
                Some(Gesture::Tap)
            }
        }
    }

    /// Press and release at the same instant.
    pub fn tap(&mut self, now: Instant) -> Option<Gesture> {
        self.press(now);
        self.release(now)
    }
}

impl Default for GestureRecognizer {
    fn default() -> Self {
        Self::new(GestureConfig::default())
    }
}
