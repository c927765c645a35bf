use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::metric::Metric;
use crate::plugin::Output;
use crate::serialize::{Serializer, SerializerOutput};

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    /// Write targets; the literal "stdout" maps to standard output.
    /// Defaults to stdout when empty.
    #[serde(default)]
    files: Vec<String>,
}

enum Target {
    Stdout,
    File(std::fs::File),
}

impl Target {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Target::Stdout => std::io::stdout().write_all(bytes),
            Target::File(file) => file.write_all(bytes),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Target::Stdout => std::io::stdout().flush(),
            Target::File(file) => file.flush(),
        }
    }
}

/// Writes newline-delimited serialized metrics to one or more targets.
pub struct FileOutput {
    files: Vec<String>,
    targets: Vec<Target>,
    serializer: Option<Box<dyn Serializer>>,
}

impl FileOutput {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            targets: Vec::new(),
            serializer: None,
        }
    }
}

impl Default for FileOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Output for FileOutput {
    async fn connect(&mut self) -> Result<()> {
        if self.files.is_empty() {
            self.files.push("stdout".to_string());
        }

        for file in &self.files {
            let target = if file == "stdout" {
                Target::Stdout
            } else {
                let handle = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(file)
                    .with_context(|| format!("opening output file {file}"))?;
                Target::File(handle)
            };
            self.targets.push(target);
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut err = None;
        for target in &mut self.targets {
            if let Err(e) = target.flush() {
                err = Some(e);
            }
        }
        self.targets.clear();

        match err {
            Some(e) => Err(e).context("flushing output targets"),
            None => Ok(()),
        }
    }

    async fn write(&mut self, metrics: &[Box<dyn Metric>]) -> Result<()> {
        let serializer = self
            .serializer
            .as_ref()
            .context("file output has no serializer")?;

        let mut write_err = None;
        for metric in metrics {
            let bytes = match serializer.serialize(metric.as_ref()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "could not serialize metric");
                    continue;
                }
            };

            for target in &mut self.targets {
                if let Err(e) = target.write_all(&bytes) {
                    write_err = Some(anyhow!("failed to write message: {e}"));
                }
            }
        }

        match write_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn parse_config(&mut self, cfg: &serde_yaml::Value) -> Result<()> {
        let parsed: FileConfig =
            serde_yaml::from_value(cfg.clone()).context("file output config")?;
        self.files = parsed.files;
        Ok(())
    }

    fn as_serializer_output(&mut self) -> Option<&mut dyn SerializerOutput> {
        Some(self)
    }
}

impl SerializerOutput for FileOutput {
    fn set_serializer(&mut self, serializer: Box<dyn Serializer>) {
        self.serializer = Some(serializer);
    }
}
