use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_core::{AccumulatorSnapshot, Error, Event, Result, WindowResult};

use crate::aggregate::Aggregator;
use crate::trigger::{WindowPhase, WindowTrigger};

/// Half-open event-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Identity of an accumulator: one per (key, window).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub key: String,
    pub window: Window,
}

impl WindowKey {
    pub fn new(key: impl Into<String>, window: Window) -> Self {
        Self {
            key: key.into(),
            window,
        }
    }
}

/// Fixed-size, non-overlapping windows aligned to the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindows {
    size_ms: i64,
}

impl TumblingWindows {
    /// # Panics
    ///
    /// Panics if `size_ms` is not positive; configuration validation rejects
    /// such sizes before a pipeline is built.
    pub fn new(size_ms: i64) -> Self {
        assert!(size_ms > 0, "window size must be positive, got {size_ms}");
        Self { size_ms }
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Window containing `ts`, or `None` when its start would fall below
    /// `i64::MIN`. The last window before `i64::MAX` ends at `i64::MAX`.
    pub fn assign(&self, ts: i64) -> Option<Window> {
        let start = ts.div_euclid(self.size_ms).checked_mul(self.size_ms)?;
        Some(Window::new(start, start.saturating_add(self.size_ms)))
    }
}

struct Accumulator<V> {
    value: V,
    phase: WindowPhase,
}

/// Keyed tumbling-window state: one accumulator per (key, window), closed by
/// watermark advance and released once emitted.
pub struct KeyedWindows<A: Aggregator> {
    assigner: TumblingWindows,
    aggregator: Arc<A>,
    state: HashMap<WindowKey, Accumulator<A::Value>>,
    trigger: WindowTrigger,
    closed: Vec<WindowKey>,
}

impl<A: Aggregator> KeyedWindows<A> {
    pub fn new(assigner: TumblingWindows, aggregator: Arc<A>) -> Self {
        Self {
            assigner,
            aggregator,
            state: HashMap::new(),
            trigger: WindowTrigger::new(),
            closed: Vec::new(),
        }
    }

    pub fn assigner(&self) -> TumblingWindows {
        self.assigner
    }

    /// Watermark the trigger last evaluated at.
    pub fn watermark(&self) -> i64 {
        self.trigger.fired_through()
    }

    /// Number of live (open or closed-but-unemitted) accumulators.
    pub fn live(&self) -> usize {
        self.state.len()
    }

    /// Folds `event` into the accumulator of its window, creating it from the
    /// aggregator's seed on first use.
    ///
    /// Events for a window that already closed are rejected with
    /// [`Error::LateData`], events no window can hold with
    /// [`Error::Unassignable`]; both leave all state untouched.
    pub fn process(&mut self, event: &Event) -> Result<Window> {
        let window = self.assigner.assign(event.timestamp).ok_or_else(|| Error::Unassignable {
            key: event.key.clone(),
            timestamp: event.timestamp,
        })?;
        if self.trigger.is_closed(&window) {
            return Err(Error::LateData {
                key: event.key.clone(),
                window_start: window.start,
                window_end: window.end,
                watermark: self.trigger.fired_through(),
            });
        }
        let key = WindowKey::new(event.key.as_str(), window);
        match self.state.get_mut(&key) {
            Some(acc) => self.aggregator.combine(&mut acc.value, event),
            None => {
                let mut value = self.aggregator.seed();
                self.aggregator.combine(&mut value, event);
                self.trigger.register(key.clone());
                self.state.insert(
                    key,
                    Accumulator {
                        value,
                        phase: WindowPhase::Open,
                    },
                );
            }
        }
        Ok(window)
    }

    /// Transitions every open window with `end <= watermark` to `Closed`.
    /// Returns how many windows closed.
    pub fn advance_watermark(&mut self, watermark: i64) -> usize {
        let due = self.trigger.fire(watermark);
        let n = due.len();
        for key in due {
            if let Some(acc) = self.state.get_mut(&key) {
                acc.phase = WindowPhase::Closed;
                self.closed.push(key);
            }
        }
        n
    }

    /// Finalizes all closed windows and releases their accumulators, in the
    /// order they closed.
    pub fn take_closed(&mut self) -> Vec<WindowResult> {
        let mut out = Vec::with_capacity(self.closed.len());
        for key in self.closed.drain(..) {
            if let Some(acc) = self.state.remove(&key) {
                out.push(WindowResult {
                    value: self.aggregator.finish(&acc.value),
                    key: key.key,
                    window_start: key.window.start,
                    window_end: key.window.end,
                });
            }
        }
        out
    }

    /// `advance_watermark` followed by `take_closed`.
    pub fn on_watermark(&mut self, watermark: i64) -> Vec<WindowResult> {
        self.advance_watermark(watermark);
        self.take_closed()
    }

    /// Phase of a (key, window) pair. Windows the watermark has passed report
    /// `Emitted` once released; windows never seen and still ahead of the
    /// watermark report `None`.
    pub fn phase(&self, key: &str, window: Window) -> Option<WindowPhase> {
        match self.state.get(&WindowKey::new(key, window)) {
            Some(acc) => Some(acc.phase),
            None if self.trigger.is_closed(&window) => Some(WindowPhase::Emitted),
            None => None,
        }
    }

    /// Serializes every open accumulator, ordered by (window, key).
    pub fn snapshot(&self) -> Result<Vec<AccumulatorSnapshot>> {
        let mut keys: Vec<&WindowKey> = self
            .state
            .iter()
            .filter(|(_, acc)| acc.phase == WindowPhase::Open)
            .map(|(k, _)| k)
            .collect();
        keys.sort_by(|a, b| (a.window, &a.key).cmp(&(b.window, &b.key)));
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            out.push(AccumulatorSnapshot {
                key: k.key.clone(),
                window_start: k.window.start,
                window_end: k.window.end,
                value: serde_json::to_value(&self.state[k].value)?,
            });
        }
        Ok(out)
    }

    /// Replaces all state with checkpointed accumulators and trigger position.
    pub fn restore(&mut self, snapshots: &[AccumulatorSnapshot], watermark: i64) -> Result<()> {
        self.state.clear();
        self.closed.clear();
        self.trigger.restore(watermark);
        for snap in snapshots {
            let window = Window::new(snap.window_start, snap.window_end);
            if self.assigner.assign(snap.window_start) != Some(window) || self.trigger.is_closed(&window) {
                return Err(Error::StateCorruption {
                    checkpoint: None,
                    reason: format!(
                        "accumulator for key {:?} window [{}, {}) cannot be open at watermark {watermark}",
                        snap.key, snap.window_start, snap.window_end
                    ),
                });
            }
            let value: A::Value = serde_json::from_value(snap.value.clone()).map_err(|e| Error::StateCorruption {
                checkpoint: None,
                reason: format!("accumulator for key {:?} does not decode: {e}", snap.key),
            })?;
            let key = WindowKey::new(snap.key.as_str(), window);
            if self.state.contains_key(&key) {
                return Err(Error::StateCorruption {
                    checkpoint: None,
                    reason: format!("duplicate accumulator for key {:?}", snap.key),
                });
            }
            self.trigger.register(key.clone());
            self.state.insert(
                key,
                Accumulator {
                    value,
                    phase: WindowPhase::Open,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Count, Sum};
    use serde_json::json;

    fn sum_windows() -> KeyedWindows<Sum> {
        KeyedWindows::new(TumblingWindows::new(2000), Arc::new(Sum::new("value")))
    }

    fn ev(key: &str, ts: i64, value: i64) -> Event {
        Event::new(key, ts, json!({ "value": value }))
    }

    #[test]
    fn assigns_by_floor_division() {
        let w = TumblingWindows::new(2000);
        assert_eq!(w.assign(0), Some(Window::new(0, 2000)));
        assert_eq!(w.assign(1999), Some(Window::new(0, 2000)));
        assert_eq!(w.assign(2000), Some(Window::new(2000, 4000)));
        assert_eq!(w.assign(-1), Some(Window::new(-2000, 0)));
        assert!(w.assign(2200).unwrap().contains(2200));
    }

    #[test]
    fn assignment_at_the_ends_of_time() {
        let w = TumblingWindows::new(2000);
        assert_eq!(w.assign(i64::MIN), None);
        let last = w.assign(i64::MAX).unwrap();
        assert_eq!(last.end, i64::MAX);
        assert_eq!(last.start % 2000, 0);
        assert_eq!(TumblingWindows::new(1).assign(i64::MIN), Some(Window::new(i64::MIN, i64::MIN + 1)));
    }

    #[test]
    fn unassignable_event_leaves_state_untouched() {
        let mut op = sum_windows();
        op.process(&ev("A", 100, 1)).unwrap();
        let err = op.process(&ev("A", i64::MIN, 1)).unwrap_err();
        assert!(matches!(err, Error::Unassignable { timestamp: i64::MIN, .. }));
        assert_eq!(op.live(), 1);
        let out = op.on_watermark(i64::MAX);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!(1));
    }

    #[test]
    fn two_second_window_scenario() {
        let mut op = sum_windows();
        op.process(&ev("A", 100, 1)).unwrap();
        op.process(&ev("A", 900, 1)).unwrap();
        op.process(&ev("A", 2200, 1)).unwrap();
        assert!(op.on_watermark(1999).is_empty());
        let out = op.on_watermark(2199);
        assert_eq!(
            out,
            vec![WindowResult {
                key: "A".into(),
                window_start: 0,
                window_end: 2000,
                value: json!(2),
            }]
        );
        // emitted exactly once
        assert!(op.on_watermark(2199).is_empty());
        assert_eq!(op.phase("A", Window::new(0, 2000)), Some(WindowPhase::Emitted));
        assert_eq!(op.phase("A", Window::new(2000, 4000)), Some(WindowPhase::Open));
        assert_eq!(op.live(), 1);
    }

    #[test]
    fn keys_are_isolated() {
        let mut op = KeyedWindows::new(TumblingWindows::new(1000), Arc::new(Count));
        for (k, ts) in [("a", 1), ("b", 2), ("a", 3), ("a", 1500)] {
            op.process(&Event::new(k, ts, json!({}))).unwrap();
        }
        let out = op.on_watermark(1000);
        let got: Vec<_> = out.iter().map(|r| (r.key.as_str(), r.value.clone())).collect();
        assert_eq!(got, vec![("a", json!(2)), ("b", json!(1))]);
    }

    #[test]
    fn late_event_is_rejected_without_mutation() {
        let mut op = sum_windows();
        op.process(&ev("A", 100, 1)).unwrap();
        op.process(&ev("A", 2100, 5)).unwrap();
        assert_eq!(op.on_watermark(2099).len(), 1);
        let err = op.process(&ev("A", 500, 7)).unwrap_err();
        assert!(matches!(err, Error::LateData { window_end: 2000, .. }));
        let late_new_key = op.process(&ev("B", 1999, 7)).unwrap_err();
        assert!(matches!(late_new_key, Error::LateData { .. }));
        assert_eq!(op.live(), 1);
        let out = op.on_watermark(i64::MAX);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!(5));
    }

    #[test]
    fn closed_windows_wait_for_take() {
        let mut op = sum_windows();
        op.process(&ev("A", 100, 1)).unwrap();
        assert_eq!(op.advance_watermark(2000), 1);
        assert_eq!(op.phase("A", Window::new(0, 2000)), Some(WindowPhase::Closed));
        assert_eq!(op.take_closed().len(), 1);
        assert_eq!(op.phase("A", Window::new(0, 2000)), Some(WindowPhase::Emitted));
    }

    #[test]
    fn fold_matches_window_membership() {
        // in-order events: each window's sum is the sum over its own events
        let mut op = sum_windows();
        let mut expected: std::collections::BTreeMap<i64, i64> = Default::default();
        for i in 0..200i64 {
            let ts = i * 37;
            op.process(&ev("K", ts, i)).unwrap();
            *expected.entry(ts.div_euclid(2000) * 2000).or_default() += i;
        }
        let out = op.on_watermark(i64::MAX);
        let got: std::collections::BTreeMap<i64, i64> = out
            .iter()
            .map(|r| (r.window_start, r.value.as_i64().unwrap()))
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn snapshot_restore_resumes_accumulation() {
        let mut op = sum_windows();
        op.process(&ev("A", 100, 1)).unwrap();
        op.process(&ev("A", 900, 1)).unwrap();
        op.on_watermark(899);
        let snap = op.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].value, json!(2));

        let mut restored = sum_windows();
        restored.restore(&snap, 899).unwrap();
        restored.process(&ev("A", 2200, 1)).unwrap();
        let out = restored.on_watermark(2199);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].window_start, out[0].value.clone()), (0, json!(2)));
        assert_eq!(restored.phase("A", Window::new(2000, 4000)), Some(WindowPhase::Open));
    }

    #[test]
    fn restore_rejects_inconsistent_state() {
        let snap = vec![AccumulatorSnapshot {
            key: "A".into(),
            window_start: 0,
            window_end: 2000,
            value: json!(2),
        }];
        let mut op = sum_windows();
        assert!(matches!(op.restore(&snap, 2500), Err(Error::StateCorruption { .. })));

        let bad_value = vec![AccumulatorSnapshot {
            value: json!({"not": "a number"}),
            ..snap[0].clone()
        }];
        assert!(matches!(op.restore(&bad_value, 0), Err(Error::StateCorruption { .. })));
    }
}
