use anyhow::Result;

use super::Serializer;
use crate::metric::Metric;

/// Serializes each metric as one JSON object per line, wrapped as
/// `{"metric": ...}`.
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, metric: &dyn Metric) -> Result<Vec<u8>> {
        let obj = serde_json::json!({ "metric": metric.to_value() });

        let mut serialized = serde_json::to_vec(&obj)?;
        serialized.push(b'\n');
        Ok(serialized)
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;

    #[derive(Debug, Clone)]
    struct TestMetric {
        name: &'static str,
        value: f64,
    }

    impl Metric for TestMetric {
        fn clone_metric(&self) -> Box<dyn Metric> {
            Box::new(self.clone())
        }

        fn to_value(&self) -> serde_json::Value {
            serde_json::json!({ "name": self.name, "value": self.value })
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_serialize_wraps_metric_with_newline() {
        let serializer = JsonSerializer::new();
        let metric = TestMetric {
            name: "load",
            value: 1.5,
        };

        let bytes = serializer.serialize(&metric).expect("serialize");
        let line = std::str::from_utf8(&bytes).expect("utf8");

        assert!(line.ends_with('\n'));
        let parsed: serde_json::Value =
            serde_json::from_str(line.trim_end()).expect("valid json");
        assert_eq!(parsed["metric"]["name"], "load");
        assert_eq!(parsed["metric"]["value"], 1.5);
    }
}
