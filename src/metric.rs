use std::any::Any;
use std::fmt;

/// A single telemetry datum flowing through the pipeline.
///
/// The core treats metrics as opaque carriers: inputs produce them, the agent
/// moves them into per-output buffers, and outputs consume them. Concrete
/// shapes are defined by input plugins; the core only ever clones and moves.
pub trait Metric: fmt::Debug + Send + Sync + 'static {
    /// Returns a deep, independent clone of this metric.
    ///
    /// Fan-out hands clones to all but the last output. Mutating one copy
    /// must never be observable through another.
    fn clone_metric(&self) -> Box<dyn Metric>;

    /// Serializable view of the metric, consumed by serializers.
    fn to_value(&self) -> serde_json::Value;

    /// Downcast support for outputs and tests that know the concrete shape.
    fn as_any(&self) -> &dyn Any;
}
