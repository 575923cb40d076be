//! Run configuration and the identity derived from it.
//!
//! A `RunConfiguration` is built once from the parsed CLI and never mutated;
//! resolution steps (layers, device) hand back a new value.
use crate::cli::{ElicitArgs, EvalArgs, ExtractArgs, ExtractionArgs, TrainArgs, TrainingArgs};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

mod identity;

pub(crate) use identity::canonical_value;
pub use identity::RunIdentity;

/// Pipeline command a configuration was parsed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Extract,
    Train,
    Elicit,
    Eval,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Extract => "extract",
            CommandKind::Train => "train",
            CommandKind::Elicit => "elicit",
            CommandKind::Eval => "eval",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All user-specified options for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub command: CommandKind,
    pub model: Option<String>,
    pub datasets: Vec<String>,
    /// Explicit layer indices; empty means every layer.
    pub layers: Vec<usize>,
    pub layer_stride: usize,
    pub token_loc: Option<String>,
    pub max_examples: Option<usize>,
    pub seed: Option<u64>,
    pub device: Option<String>,
    /// Cached run a `train` invocation reads from.
    pub name: Option<String>,
    pub net: Option<String>,
    pub normalization: Option<String>,
    pub out_dir: Option<PathBuf>,
    /// Trained run an `eval` invocation reads reporters from.
    pub source: Option<String>,
}

impl RunConfiguration {
    fn empty(command: CommandKind) -> Self {
        Self {
            command,
            model: None,
            datasets: Vec::new(),
            layers: Vec::new(),
            layer_stride: 1,
            token_loc: None,
            max_examples: None,
            seed: None,
            device: None,
            name: None,
            net: None,
            normalization: None,
            out_dir: None,
            source: None,
        }
    }

    pub fn from_extract(args: &ExtractArgs) -> Self {
        Self::empty(CommandKind::Extract).with_extraction(&args.extraction)
    }

    pub fn from_train(args: &TrainArgs) -> Self {
        let mut config = Self::empty(CommandKind::Train).with_training(&args.training);
        config.name = Some(args.name.clone());
        config.device = args.device.clone();
        config
    }

    pub fn from_elicit(args: &ElicitArgs) -> Self {
        Self::empty(CommandKind::Elicit)
            .with_extraction(&args.extraction)
            .with_training(&args.training)
    }

    pub fn from_eval(args: &EvalArgs) -> Self {
        let mut config = Self::empty(CommandKind::Eval);
        config.source = Some(args.source.clone());
        config.datasets = args.datasets.clone();
        config.device = args.device.clone();
        config.out_dir = args.out_dir.clone();
        config
    }

    fn with_extraction(mut self, args: &ExtractionArgs) -> Self {
        self.model = Some(args.model.clone());
        self.datasets = args.datasets.clone();
        self.layers = args.layers.clone();
        self.layer_stride = args.layer_stride;
        self.token_loc = Some(args.token_loc.clone());
        self.max_examples = args.max_examples;
        self.seed = Some(args.seed);
        self.device = args.device.clone();
        self
    }

    fn with_training(mut self, args: &TrainingArgs) -> Self {
        self.net = Some(args.net.clone());
        self.normalization = args.normalization.clone();
        self.out_dir = args.out_dir.clone();
        self
    }

    /// Copy of this configuration with an explicit layer list.
    pub fn with_layers(&self, layers: Vec<usize>) -> Self {
        Self {
            layers,
            ..self.clone()
        }
    }

    /// Copy of this configuration bound to a concrete device.
    pub fn with_device(&self, device: String) -> Self {
        Self {
            device: Some(device),
            ..self.clone()
        }
    }

    /// Render each field as a `key: value` line, sorted by key.
    pub fn echo_lines(&self) -> Result<Vec<String>> {
        let value = serde_json::to_value(self).context("serialize run config")?;
        let Some(fields) = value.as_object() else {
            return Ok(Vec::new());
        };
        Ok(fields
            .iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(text) => format!("{key}: {text}"),
                serde_json::Value::Null => format!("{key}: None"),
                other => format!("{key}: {other}"),
            })
            .collect())
    }

    /// Comma-separated layer list for stage commands; empty means all layers.
    pub fn layers_arg(&self) -> String {
        self.layers
            .iter()
            .map(|layer| layer.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn elicit_config() -> RunConfiguration {
        let mut config = RunConfiguration::empty(CommandKind::Elicit);
        config.model = Some("gpt2".to_string());
        config.datasets = vec!["imdb".to_string()];
        config.token_loc = Some("last".to_string());
        config.seed = Some(42);
        config.net = Some("ccs".to_string());
        config
    }
}
