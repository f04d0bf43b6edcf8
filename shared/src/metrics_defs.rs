//! Common types for metrics definitions.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Registers the descriptions of `defs` with the installed recorder.
/// Call once after the global recorder has been set.
pub fn describe(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        $crate::metrics::counter!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        $crate::metrics::counter!($def.name, $($label => $value),+)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr) => {
        $crate::metrics::gauge!($def.name)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        $crate::metrics::histogram!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        $crate::metrics::histogram!($def.name, $($label => $value),+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const HITS: MetricDef = MetricDef {
        name: "test.hits",
        metric_type: MetricType::Counter,
        description: "Hits",
    };

    #[test]
    fn test_macros_without_recorder() {
        // No recorder installed: the handles are no-ops and must not panic.
        crate::counter!(HITS).increment(1);
        crate::counter!(HITS, "result" => "found").increment(1);
        crate::histogram!(HITS).record(1.0);
        describe(&[HITS]);
        assert_eq!(HITS.metric_type.as_str(), "Counter");
    }
}
