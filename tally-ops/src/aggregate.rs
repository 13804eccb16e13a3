//! Combine functions for window accumulators.
//!
//! An [`Aggregator`] must be associative and commutative with respect to arrival
//! order: the workers guarantee per-key order only, never cross-key order.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tally_core::Event;

pub trait Aggregator: Send + Sync + 'static {
    /// Accumulator value; serialized into checkpoints.
    type Value: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Zero value for a fresh accumulator.
    fn seed(&self) -> Self::Value;

    /// Folds `event` into `acc` in place.
    fn combine(&self, acc: &mut Self::Value, event: &Event);

    /// Output value handed to the sink when the window is emitted.
    fn finish(&self, acc: &Self::Value) -> serde_json::Value {
        serde_json::to_value(acc).unwrap_or(serde_json::Value::Null)
    }
}

/// Number of events per window.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl Aggregator for Count {
    type Value = u64;

    fn seed(&self) -> u64 {
        0
    }

    fn combine(&self, acc: &mut u64, _event: &Event) {
        *acc += 1;
    }
}

/// A number that stays integral until a fractional input is seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

impl Default for Numeric {
    fn default() -> Self {
        Numeric::Int(0)
    }
}

impl Numeric {
    fn from_json(v: &serde_json::Value) -> Numeric {
        match v {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Numeric::Int(i),
                None => Numeric::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => s
                .parse::<i64>()
                .map(Numeric::Int)
                .or_else(|_| s.parse::<f64>().map(Numeric::Float))
                .unwrap_or_default(),
            _ => Numeric::Int(0),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }

    fn add(self, other: Numeric) -> Numeric {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => a
                .checked_add(b)
                .map(Numeric::Int)
                .unwrap_or(Numeric::Float(a as f64 + b as f64)),
            (a, b) => Numeric::Float(a.as_f64() + b.as_f64()),
        }
    }
}

/// Sum of a numeric payload field. Missing or non-numeric values count as zero.
#[derive(Debug, Clone)]
pub struct Sum {
    pub field: String,
}

impl Sum {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Aggregator for Sum {
    type Value = Numeric;

    fn seed(&self) -> Numeric {
        Numeric::default()
    }

    fn combine(&self, acc: &mut Numeric, event: &Event) {
        let x = Numeric::from_json(event.payload.get(&self.field).unwrap_or(&serde_json::Value::Null));
        *acc = acc.add(x);
    }
}

/// Latest value of a payload field by event time.
///
/// Ties on the timestamp are broken by the larger serialized value, so the result
/// does not depend on arrival order.
#[derive(Debug, Clone)]
pub struct Latest {
    pub field: String,
}

impl Latest {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Aggregator for Latest {
    type Value = Option<(i64, serde_json::Value)>;

    fn seed(&self) -> Self::Value {
        None
    }

    fn combine(&self, acc: &mut Self::Value, event: &Event) {
        let candidate = event
            .payload
            .get(&self.field)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let replace = match acc {
            None => true,
            Some((ts, current)) => {
                event.timestamp > *ts
                    || (event.timestamp == *ts && candidate.to_string() > current.to_string())
            }
        };
        if replace {
            *acc = Some((event.timestamp, candidate));
        }
    }

    fn finish(&self, acc: &Self::Value) -> serde_json::Value {
        acc.as_ref()
            .map(|(_, v)| v.clone())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Number of distinct values of a payload field (set union).
#[derive(Debug, Clone)]
pub struct DistinctCount {
    pub field: String,
}

impl DistinctCount {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

fn stringify(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Aggregator for DistinctCount {
    type Value = BTreeSet<String>;

    fn seed(&self) -> Self::Value {
        BTreeSet::new()
    }

    fn combine(&self, acc: &mut Self::Value, event: &Event) {
        acc.insert(stringify(event.payload.get(&self.field).unwrap_or(&serde_json::Value::Null)));
    }

    fn finish(&self, acc: &Self::Value) -> serde_json::Value {
        serde_json::json!(acc.len() as u64)
    }
}

/// Aggregator built from a seed closure and a combine closure.
///
/// Example
/// ```no_run
/// use tally_ops::aggregate::FnAggregator;
/// let max_len = FnAggregator::new(
///     || 0usize,
///     |acc: &mut usize, ev: &tally_core::Event| *acc = (*acc).max(ev.key.len()),
/// );
/// # let _ = max_len;
/// ```
pub struct FnAggregator<V, S, C> {
    seed: S,
    combine: C,
    _value: PhantomData<fn() -> V>,
}

impl<V, S, C> FnAggregator<V, S, C>
where
    S: Fn() -> V,
    C: Fn(&mut V, &Event),
{
    pub fn new(seed: S, combine: C) -> Self {
        Self {
            seed,
            combine,
            _value: PhantomData,
        }
    }
}

impl<V, S, C> Aggregator for FnAggregator<V, S, C>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Fn() -> V + Send + Sync + 'static,
    C: Fn(&mut V, &Event) + Send + Sync + 'static,
{
    type Value = V;

    fn seed(&self) -> V {
        (self.seed)()
    }

    fn combine(&self, acc: &mut V, event: &Event) {
        (self.combine)(acc, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(ts: i64, payload: serde_json::Value) -> Event {
        Event::new("k", ts, payload)
    }

    fn fold<A: Aggregator>(agg: &A, events: &[Event]) -> serde_json::Value {
        let mut acc = agg.seed();
        for e in events {
            agg.combine(&mut acc, e);
        }
        agg.finish(&acc)
    }

    #[test]
    fn count_and_sum() {
        let events = vec![ev(1, json!({"n": 1})), ev(2, json!({"n": 1})), ev(3, json!({"n": "3"}))];
        assert_eq!(fold(&Count, &events), json!(3));
        assert_eq!(fold(&Sum::new("n"), &events), json!(5));
    }

    #[test]
    fn sum_promotes_to_float() {
        let events = vec![ev(1, json!({"n": 1})), ev(2, json!({"n": 0.5})), ev(3, json!({"x": 9}))];
        assert_eq!(fold(&Sum::new("n"), &events), json!(1.5));
    }

    #[test]
    fn numeric_survives_checkpoint_encoding() {
        let int: Numeric = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(int, Numeric::Int(2));
        let float: Numeric = serde_json::from_value(json!(2.5)).unwrap();
        assert_eq!(float, Numeric::Float(2.5));
    }

    #[test]
    fn latest_is_order_independent() {
        let a = ev(10, json!({"v": "x"}));
        let b = ev(20, json!({"v": "y"}));
        let c = ev(20, json!({"v": "z"}));
        let agg = Latest::new("v");
        let forward = fold(&agg, &[a.clone(), b.clone(), c.clone()]);
        let backward = fold(&agg, &[c, b, a]);
        assert_eq!(forward, json!("z"));
        assert_eq!(forward, backward);
    }

    #[test]
    fn distinct_counts_set_union() {
        let events = vec![ev(1, json!({"s": "a"})), ev(2, json!({"s": "a"})), ev(3, json!({"s": "b"}))];
        assert_eq!(fold(&DistinctCount::new("s"), &events), json!(2));
    }

    #[test]
    fn fn_aggregator_uses_closures() {
        let agg = FnAggregator::new(|| 0i64, |acc: &mut i64, e: &Event| *acc += e.timestamp);
        assert_eq!(fold(&agg, &[ev(2, json!(null)), ev(5, json!(null))]), json!(7));
    }
}
