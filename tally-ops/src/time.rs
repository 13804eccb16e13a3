use tally_core::{Event, PartitionId, Watermark, END_OF_INPUT, WATERMARK_MIN};

/// Policy that defines how to compute watermarks.
/// watermark = max_observed_event_time - allowed_lateness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkPolicy {
    pub allowed_lateness_ms: i64,
}

impl WatermarkPolicy {
    pub fn new(allowed_lateness_ms: i64) -> Self {
        Self {
            allowed_lateness_ms: allowed_lateness_ms.max(0),
        }
    }
}

impl Default for WatermarkPolicy {
    /// The source never delivers an event more than one millisecond out of order.
    fn default() -> Self {
        Self::new(1)
    }
}

/// A watermark as published by one partition. `version` increases with every
/// publication so receivers can discard stale or duplicated messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkUpdate {
    pub partition: PartitionId,
    pub version: u64,
    pub timestamp: i64,
}

/// Per-partition timestamp extraction and periodic watermark generation.
#[derive(Debug, Clone)]
pub struct WatermarkGenerator {
    partition: PartitionId,
    policy: WatermarkPolicy,
    max_observed: Option<i64>,
    last_emitted: i64,
    version: u64,
}

impl WatermarkGenerator {
    pub fn new(partition: PartitionId, policy: WatermarkPolicy) -> Self {
        Self {
            partition,
            policy,
            max_observed: None,
            last_emitted: WATERMARK_MIN,
            version: 0,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Event-time of `event`; also advances the observed maximum.
    pub fn extract_timestamp(&mut self, event: &Event) -> i64 {
        let ts = event.timestamp;
        self.max_observed = match self.max_observed {
            Some(max) if ts > max => Some(ts),
            None => Some(ts),
            Some(max) => Some(max),
        };
        ts
    }

    pub fn current_watermark(&self) -> i64 {
        self.max_observed
            .map(|t| t.saturating_sub(self.policy.allowed_lateness_ms))
            .unwrap_or(WATERMARK_MIN)
    }

    /// Called on the periodic cadence. Returns an update only when the watermark
    /// moved past the last one published; equal watermarks are never re-published.
    pub fn poll_watermark(&mut self) -> Option<WatermarkUpdate> {
        let wm = self.current_watermark();
        if wm <= self.last_emitted {
            return None;
        }
        Some(self.publish(wm))
    }

    /// The end-of-input watermark for a bounded partition.
    pub fn finish(&mut self) -> WatermarkUpdate {
        self.publish(END_OF_INPUT)
    }

    /// Last watermark published downstream.
    pub fn last_emitted(&self) -> Watermark {
        Watermark::new(self.partition, self.last_emitted)
    }

    /// Re-seeds the generator from a checkpointed watermark.
    pub fn restore(&mut self, watermark: i64) {
        self.last_emitted = watermark;
        self.max_observed = if watermark == WATERMARK_MIN {
            None
        } else {
            Some(watermark.saturating_add(self.policy.allowed_lateness_ms))
        };
    }

    fn publish(&mut self, wm: i64) -> WatermarkUpdate {
        self.last_emitted = wm;
        self.version += 1;
        WatermarkUpdate {
            partition: self.partition,
            version: self.version,
            timestamp: wm,
        }
    }
}

/// Versioned register of per-partition watermarks reduced to a global minimum.
///
/// The global watermark is `WATERMARK_MIN` until every partition has published,
/// and never decreases.
#[derive(Debug, Clone)]
pub struct WatermarkRegister {
    slots: Vec<Option<(u64, i64)>>,
    global: i64,
}

impl WatermarkRegister {
    pub fn new(partitions: u32) -> Self {
        Self {
            slots: vec![None; partitions as usize],
            global: WATERMARK_MIN,
        }
    }

    /// Seeds the register from checkpointed watermarks (as version 0).
    pub fn restore<I>(&mut self, watermarks: I)
    where
        I: IntoIterator<Item = Watermark>,
    {
        for wm in watermarks {
            if let Some(slot) = self.slots.get_mut(wm.partition as usize) {
                *slot = Some((0, wm.timestamp));
            }
        }
        self.global = self.global.max(self.compute());
    }

    /// Applies an update; returns the new global watermark if it advanced.
    pub fn update(&mut self, update: WatermarkUpdate) -> Option<i64> {
        let slot = self.slots.get_mut(update.partition as usize)?;
        match *slot {
            Some((version, ts)) if update.version <= version || update.timestamp <= ts => return None,
            _ => *slot = Some((update.version, update.timestamp)),
        }
        let candidate = self.compute();
        if candidate > self.global {
            self.global = candidate;
            Some(candidate)
        } else {
            None
        }
    }

    pub fn global(&self) -> i64 {
        self.global
    }

    pub fn partition(&self, partition: PartitionId) -> i64 {
        self.slots
            .get(partition as usize)
            .copied()
            .flatten()
            .map(|(_, ts)| ts)
            .unwrap_or(WATERMARK_MIN)
    }

    fn compute(&self) -> i64 {
        self.slots
            .iter()
            .map(|s| s.map(|(_, ts)| ts).unwrap_or(WATERMARK_MIN))
            .min()
            .unwrap_or(WATERMARK_MIN)
    }
}
