use std::collections::{BTreeMap, BTreeSet};

use tally_core::{END_OF_INPUT, WATERMARK_MIN};

use crate::window::{Window, WindowKey};

/// Lifecycle of one (key, window) pair. `Emitted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    /// Accepting events.
    Open,
    /// Watermark passed the window end; value frozen, awaiting emission.
    Closed,
    /// Handed to the sink and released.
    Emitted,
}

/// Event-time timers for open windows, fired by watermark advance.
///
/// Evaluation is batched: one call to [`WindowTrigger::fire`] per watermark
/// update closes every window whose end is at or below the watermark.
#[derive(Debug, Clone)]
pub struct WindowTrigger {
    timers: BTreeMap<i64, BTreeSet<WindowKey>>,
    fired_through: i64,
}

impl Default for WindowTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowTrigger {
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            fired_through: WATERMARK_MIN,
        }
    }

    /// Watermark of the most recent evaluation.
    pub fn fired_through(&self) -> i64 {
        self.fired_through
    }

    /// Whether `window` has already been closed by a past evaluation.
    pub fn is_closed(&self, window: &Window) -> bool {
        window.end <= self.fired_through
    }

    pub fn register(&mut self, key: WindowKey) {
        self.timers.entry(key.window.end).or_default().insert(key);
    }

    pub fn pending(&self) -> usize {
        self.timers.values().map(BTreeSet::len).sum()
    }

    /// Closes all windows with `end <= watermark`, in ascending (end, key) order.
    /// A watermark at or behind the previous evaluation closes nothing.
    pub fn fire(&mut self, watermark: i64) -> Vec<WindowKey> {
        if watermark <= self.fired_through {
            return Vec::new();
        }
        self.fired_through = watermark;
        let still_open = if watermark == END_OF_INPUT {
            BTreeMap::new()
        } else {
            self.timers.split_off(&(watermark + 1))
        };
        let due = std::mem::replace(&mut self.timers, still_open);
        due.into_values().flatten().collect()
    }

    /// Resets to a checkpointed evaluation point, dropping all timers.
    pub fn restore(&mut self, fired_through: i64) {
        self.timers.clear();
        self.fired_through = fired_through;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wk(key: &str, start: i64) -> WindowKey {
        WindowKey::new(key, Window::new(start, start + 2000))
    }

    #[test]
    fn fires_only_windows_at_or_below_watermark() {
        let mut t = WindowTrigger::new();
        t.register(wk("A", 0));
        t.register(wk("A", 2000));
        t.register(wk("B", 0));
        assert!(t.fire(1999).is_empty());
        let fired = t.fire(2000);
        assert_eq!(fired, vec![wk("A", 0), wk("B", 0)]);
        assert!(t.is_closed(&Window::new(0, 2000)));
        assert!(!t.is_closed(&Window::new(2000, 4000)));
        assert_eq!(t.pending(), 1);
    }

    #[test]
    fn a_jump_closes_many_windows_at_once() {
        let mut t = WindowTrigger::new();
        for start in [4000, 0, 2000] {
            t.register(wk("A", start));
        }
        let fired = t.fire(10_000);
        let starts: Vec<i64> = fired.iter().map(|k| k.window.start).collect();
        assert_eq!(starts, vec![0, 2000, 4000]);
    }

    #[test]
    fn regressing_watermark_fires_nothing() {
        let mut t = WindowTrigger::new();
        t.fire(5000);
        t.register(wk("A", 4000));
        assert!(t.fire(4000).is_empty());
        assert_eq!(t.fired_through(), 5000);
    }

    #[test]
    fn end_of_input_flushes_everything() {
        let mut t = WindowTrigger::new();
        t.register(wk("A", i64::MAX - 5000));
        assert_eq!(t.fire(END_OF_INPUT).len(), 1);
        assert_eq!(t.pending(), 0);
    }
}
