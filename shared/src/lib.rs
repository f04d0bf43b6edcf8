pub mod deadline;
pub mod ids;
pub mod metrics_defs;

// Re-exported so the metric macros resolve without every crate depending on `metrics`.
pub use metrics;
