//! Minimal run-time metrics sink.
//!
//! No exporter is bundled; every counter lands in a process-wide total
//! table and, if one was registered, is forwarded to a raw callback.

use dashmap::DashMap;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::{Lazy, OnceCell};
use std::sync::Arc;

pub const MESSAGES_SENT: &str = "amsgq_messages_sent_total";
pub const SEND_AGAIN: &str = "amsgq_send_again_total";
pub const MESSAGES_PROCESSED: &str = "amsgq_messages_processed_total";
pub const REAPS: &str = "amsgq_reaps_total";
pub const RMA_FLUSHES: &str = "amsgq_rma_flushes_total";
pub const OPEN_QUEUES: &str = "amsgq_open_queues";

/// Signature for external collectors: metric name and its current value.
pub type StatsCallback = fn(name: &str, value: u64);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();
static TOTALS: Lazy<DashMap<String, u64>> = Lazy::new(DashMap::new);

/// Register the collector. Only the first registration wins.
pub fn register_stats_callback(cb: StatsCallback) -> bool {
    CALLBACK.set(cb).is_ok()
}

/// Current value of a counter or gauge recorded through this sink.
pub fn total(name: &str) -> u64 {
    TOTALS.get(name).map(|v| *v).unwrap_or(0)
}

fn forward(name: &str, value: u64) {
    if let Some(cb) = CALLBACK.get() {
        cb(name, value);
    }
}

fn update(key: &Key, f: impl FnOnce(u64) -> u64) {
    let name = key.name();
    let value = {
        let mut slot = TOTALS.entry(name.to_owned()).or_insert(0);
        *slot = f(*slot);
        *slot
    };
    forward(name, value);
}

struct TotalsRecorder;

#[derive(Clone)]
struct TotalsCounter {
    key: Key,
}
#[derive(Clone)]
struct TotalsGauge {
    key: Key,
}
#[derive(Clone)]
struct TotalsHistogram {
    key: Key,
}

impl Recorder for TotalsRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(TotalsCounter { key: key.clone() }))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(TotalsGauge { key: key.clone() }))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(TotalsHistogram { key: key.clone() }))
    }
}

impl metrics::CounterFn for TotalsCounter {
    fn increment(&self, value: u64) {
        update(&self.key, |cur| cur.saturating_add(value));
    }
    fn absolute(&self, value: u64) {
        update(&self.key, |cur| cur.max(value));
    }
}

// Gauges are kept as whole numbers; fractional updates are truncated.
impl metrics::GaugeFn for TotalsGauge {
    fn set(&self, value: f64) {
        update(&self.key, |_| value.max(0.0) as u64);
    }
    fn increment(&self, value: f64) {
        update(&self.key, |cur| cur.saturating_add(value.max(0.0) as u64));
    }
    fn decrement(&self, value: f64) {
        update(&self.key, |cur| cur.saturating_sub(value.max(0.0) as u64));
    }
}

impl metrics::HistogramFn for TotalsHistogram {
    fn record(&self, value: f64) {
        forward(self.key.name(), value.max(0.0) as u64);
    }
}

/// Install exactly once; called from [`crate::Amsgq::init_with_config`].
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if metrics::set_global_recorder(TotalsRecorder).is_err() {
            log::debug!("a metrics recorder is already installed; amsgq totals stay empty");
        }
    });
}
