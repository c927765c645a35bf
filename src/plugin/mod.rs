pub mod input;
pub mod output;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::metric::Metric;
use crate::models::{Accumulator, RunningInput, RunningOutput};
use crate::serialize::json::JsonSerializer;
use crate::serialize::SerializerOutput;

/// Polled metric source.
///
/// Optional capabilities (one-time init, push-style service operation) are
/// discovered through the `as_*` queries; the agent acts on a capability only
/// when the query returns it.
#[async_trait]
pub trait Input: Send {
    /// Collects metrics into the accumulator.
    async fn gather(&mut self, acc: &dyn Accumulator) -> Result<()>;

    /// Applies this plugin instance's configuration table.
    fn parse_config(&mut self, cfg: &serde_yaml::Value) -> Result<()>;

    fn as_initializer(&mut self) -> Option<&mut dyn Initializer> {
        None
    }

    fn as_service_input(&mut self) -> Option<&mut dyn ServiceInput> {
        None
    }
}

/// Push-style input that emits metrics asynchronously instead of being
/// polled, e.g. a server accepting streamed telemetry.
#[async_trait]
pub trait ServiceInput: Send {
    /// Starts background production. The accumulator handed over here must
    /// be released again in [`ServiceInput::stop`]; the pipeline only drains
    /// to completion once every producer has let go of it.
    async fn start(&mut self, acc: Arc<dyn Accumulator>) -> Result<()>;

    /// Stops background production and releases the accumulator.
    async fn stop(&mut self);
}

/// Metric destination.
#[async_trait]
pub trait Output: Send {
    /// Establishes the connection to the destination.
    async fn connect(&mut self) -> Result<()>;

    /// Releases the connection.
    async fn close(&mut self) -> Result<()>;

    /// Writes one batch. An error means the whole batch is considered unsent
    /// and will be retried.
    async fn write(&mut self, metrics: &[Box<dyn Metric>]) -> Result<()>;

    /// Applies this plugin instance's configuration table.
    fn parse_config(&mut self, cfg: &serde_yaml::Value) -> Result<()>;

    fn as_initializer(&mut self) -> Option<&mut dyn Initializer> {
        None
    }

    fn as_serializer_output(&mut self) -> Option<&mut dyn SerializerOutput> {
        None
    }
}

/// Optional one-time initialization, invoked before connect/start.
pub trait Initializer {
    fn init(&mut self) -> Result<()>;
}

/// Builds the running inputs and outputs declared by the configuration.
///
/// Each table entry under `inputs.<name>` / `outputs.<name>` becomes one
/// plugin instance. Serializer-aware outputs get a JSON serializer attached.
pub fn load_plugins(cfg: &Config) -> Result<(Vec<Arc<RunningInput>>, Vec<Arc<RunningOutput>>)> {
    let mut inputs = Vec::new();
    for (name, tables) in &cfg.inputs {
        for table in tables {
            let mut input = new_input(name)?;
            input
                .parse_config(table)
                .with_context(|| format!("inputs.{name} config error"))?;
            inputs.push(Arc::new(RunningInput::new(input, name.as_str())));
        }
    }

    let mut outputs = Vec::new();
    for (name, tables) in &cfg.outputs {
        for table in tables {
            let mut output = new_output(name)?;
            output
                .parse_config(table)
                .with_context(|| format!("outputs.{name} config error"))?;

            if let Some(serializer_output) = output.as_serializer_output() {
                serializer_output.set_serializer(Box::new(JsonSerializer::new()));
            }

            outputs.push(Arc::new(RunningOutput::new(
                output,
                name.as_str(),
                cfg.agent.metric_batch_size,
                cfg.agent.metric_buffer_limit,
            )));
        }
    }

    Ok((inputs, outputs))
}

fn new_input(name: &str) -> Result<Box<dyn Input>> {
    match name {
        "cpu" => Ok(Box::new(input::cpu::CpuInput::new())),
        _ => bail!("unknown input plugin {name}"),
    }
}

fn new_output(name: &str) -> Result<Box<dyn Output>> {
    match name {
        "file" => Ok(Box::new(output::file::FileOutput::new())),
        _ => bail!("unknown output plugin {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use std::collections::HashMap;

    #[test]
    fn test_unknown_plugin_names_are_rejected() {
        assert!(new_input("bogus").is_err());
        assert!(new_output("bogus").is_err());
    }

    #[test]
    fn test_load_plugins_builds_declared_instances() {
        let mut inputs = HashMap::new();
        inputs.insert(
            "cpu".to_string(),
            vec![serde_yaml::from_str("percpu: true").expect("yaml")],
        );

        let mut outputs = HashMap::new();
        outputs.insert(
            "file".to_string(),
            vec![serde_yaml::from_str("files: [stdout]").expect("yaml")],
        );

        let cfg = Config {
            agent: AgentConfig::default(),
            inputs,
            outputs,
        };

        let (inputs, outputs) = load_plugins(&cfg).expect("load plugins");
        assert_eq!(inputs.len(), 1);
        assert_eq!(outputs.len(), 1);
        assert_eq!(&*inputs[0].name, "cpu");
        assert_eq!(&*outputs[0].name, "file");
    }
}
