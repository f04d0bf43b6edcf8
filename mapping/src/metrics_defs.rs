//! Metrics definitions for the mapping service.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RESOLUTION_CACHE_HIT: MetricDef = MetricDef {
    name: "resolution_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of resolutions served from the resolution cache",
};

pub const RESOLUTION_CACHE_MISS: MetricDef = MetricDef {
    name: "resolution_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of resolutions that missed the resolution cache",
};

pub const NEGATIVE_CACHE_HIT: MetricDef = MetricDef {
    name: "negative_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of lookups that hit the negative cache",
};

pub const NEGATIVE_CACHE_MISS: MetricDef = MetricDef {
    name: "negative_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of lookups that missed the negative cache",
};

pub const RESOLUTIONS: MetricDef = MetricDef {
    name: "resolver.resolutions",
    metric_type: MetricType::Counter,
    description: "Number of resolutions, tagged by result code",
};

pub const FANOUT_ENTRIES_WRITTEN: MetricDef = MetricDef {
    name: "mapping.fanout.entries_written",
    metric_type: MetricType::Histogram,
    description: "Number of mapping entries written by a single create_mapping call",
};

pub const PROPAGATIONS_APPLIED: MetricDef = MetricDef {
    name: "consistency.propagations.applied",
    metric_type: MetricType::Counter,
    description: "Number of propagation jobs applied, tagged by job kind",
};

pub const PROPAGATIONS_FAILED: MetricDef = MetricDef {
    name: "consistency.propagations.failed",
    metric_type: MetricType::Counter,
    description: "Number of propagation jobs dropped after exhausting retries",
};

pub const PROPAGATION_DURATION: MetricDef = MetricDef {
    name: "consistency.propagation.duration",
    metric_type: MetricType::Histogram,
    description: "Time to apply a propagation job in seconds, retries included",
};

pub const PROPAGATION_QUEUE_DEPTH: MetricDef = MetricDef {
    name: "consistency.queue.depth",
    metric_type: MetricType::Gauge,
    description: "Propagation jobs waiting for the worker",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RESOLUTION_CACHE_HIT,
    RESOLUTION_CACHE_MISS,
    NEGATIVE_CACHE_HIT,
    NEGATIVE_CACHE_MISS,
    RESOLUTIONS,
    FANOUT_ENTRIES_WRITTEN,
    PROPAGATIONS_APPLIED,
    PROPAGATIONS_FAILED,
    PROPAGATION_DURATION,
    PROPAGATION_QUEUE_DEPTH,
];

/// Registers descriptions for every metric above.
pub fn describe_all() {
    shared::metrics_defs::describe(ALL_METRICS);
}
