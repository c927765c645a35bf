pub mod json;

use anyhow::Result;

use crate::metric::Metric;

/// Turns a single metric into bytes.
///
/// Separate metrics are newline-delimited; each serialized buffer carries a
/// trailing newline.
pub trait Serializer: Send {
    fn serialize(&self, metric: &dyn Metric) -> Result<Vec<u8>>;
}

/// Capability for outputs that format metrics through a serializer.
pub trait SerializerOutput {
    fn set_serializer(&mut self, serializer: Box<dyn Serializer>);
}
