//! tally-ops: event-time operators built on top of tally-core.
//!
//! Included building blocks:
//! - `WatermarkGenerator`: per-partition timestamp extraction and periodic watermarks
//! - `WatermarkRegister`: versioned min-reduction of partition watermarks
//! - `TumblingWindows`: window assignment by floor division
//! - `Aggregator`: seed/combine contract with `Count`, `Sum`, `Latest`, `DistinctCount`
//! - `WindowTrigger`: watermark-driven Open → Closed → Emitted transitions
//! - `KeyedWindows`: per-(key, window) accumulators tying the above together
//! - `BarrierAligner`: checkpoint barrier alignment across partitions
//!
//! Example
//! ```no_run
//! use std::sync::Arc;
//! use tally_core::Event;
//! use tally_ops::{Count, KeyedWindows, TumblingWindows};
//!
//! let mut windows = KeyedWindows::new(TumblingWindows::new(2_000), Arc::new(Count));
//! windows.process(&Event::new("pc", 100, serde_json::json!({}))).unwrap();
//! for result in windows.on_watermark(2_000) {
//!     println!("{} [{}, {}) = {}", result.key, result.window_start, result.window_end, result.value);
//! }
//! ```

pub mod aggregate;
pub mod barrier;
pub mod time;
pub mod trigger;
pub mod window;

pub use aggregate::{Aggregator, Count, DistinctCount, FnAggregator, Latest, Numeric, Sum};
pub use barrier::{Alignment, BarrierAligner};
pub use time::{WatermarkGenerator, WatermarkPolicy, WatermarkRegister, WatermarkUpdate};
pub use trigger::{WindowPhase, WindowTrigger};
pub use window::{KeyedWindows, TumblingWindows, Window, WindowKey};

pub mod prelude {
    pub use super::{
        Aggregator, Count, DistinctCount, KeyedWindows, Latest, Sum, TumblingWindows, WatermarkGenerator,
        WatermarkPolicy, WatermarkRegister, Window, WindowPhase,
    };
}
