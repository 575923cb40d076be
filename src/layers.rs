//! Layer selection and the model-config lookup it depends on.
//!
//! `--layers` and `--layer-stride` are mutually exclusive. A stride is turned
//! into an explicit index list here, before any stage runs, so the cache
//! identity reflects the layers actually extracted.
use crate::error::ElkError;
use crate::run::RunConfiguration;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Answers "how many layers does this model have".
pub trait ModelConfigProvider {
    fn num_layers(&self, model: &str) -> Result<usize>;
}

/// Resolve the configuration's layer spec into a concrete index list.
///
/// The provider is only consulted when a stride actually needs expanding.
pub fn resolve_layers(
    config: &RunConfiguration,
    provider: &dyn ModelConfigProvider,
) -> Result<RunConfiguration> {
    let stride = config.layer_stride;
    if !config.layers.is_empty() && stride > 1 {
        return Err(ElkError::LayerConflict.into());
    }
    if stride <= 1 {
        return Ok(config.clone());
    }
    let model = config
        .model
        .as_deref()
        .ok_or_else(|| anyhow!("--layer-stride requires a model"))?;
    let total = provider.num_layers(model)?;
    let layers = strided_layers(total, stride);
    tracing::debug!(model, total, stride, count = layers.len(), "resolved layer stride");
    Ok(config.with_layers(layers))
}

/// `0, stride, 2*stride, ...` below `total`.
pub fn strided_layers(total: usize, stride: usize) -> Vec<usize> {
    (0..total).step_by(stride.max(1)).collect()
}

/// Reads layer counts from Hugging Face style `config.json` files, either in a
/// local model directory or in the hub cache.
#[derive(Debug, Clone)]
pub struct HubModelConfig {
    hub_cache: Option<PathBuf>,
}

impl HubModelConfig {
    pub fn new(hub_cache: Option<PathBuf>) -> Self {
        Self { hub_cache }
    }

    /// Locate the hub cache from `HF_HUB_CACHE`, `HF_HOME`, or the home dir.
    pub fn from_env() -> Self {
        let hub_cache = env::var_os("HF_HUB_CACHE")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                env::var_os("HF_HOME")
                    .filter(|value| !value.is_empty())
                    .map(|home| PathBuf::from(home).join("hub"))
            })
            .or_else(|| dirs::home_dir().map(|home| home.join(".cache/huggingface/hub")));
        Self::new(hub_cache)
    }

    fn config_path(&self, model: &str) -> Result<PathBuf> {
        let local = Path::new(model);
        if local.is_dir() {
            let path = local.join("config.json");
            if path.is_file() {
                return Ok(path);
            }
            return Err(anyhow!("model directory {} has no config.json", local.display()));
        }
        let hub_cache = self
            .hub_cache
            .as_ref()
            .ok_or_else(|| anyhow!("cannot locate the Hugging Face hub cache; set HF_HOME"))?;
        let repo = hub_cache.join(format!("models--{}", model.replace('/', "--")));
        let snapshot = pick_snapshot(&repo)
            .with_context(|| format!("find cached config for model {model}"))?;
        Ok(snapshot.join("config.json"))
    }
}

impl ModelConfigProvider for HubModelConfig {
    fn num_layers(&self, model: &str) -> Result<usize> {
        let path = self.config_path(model)?;
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let config: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse model config {}", path.display()))?;
        layer_count(&config).ok_or_else(|| {
            anyhow!(
                "model config {} has no num_layers or num_hidden_layers",
                path.display()
            )
        })
    }
}

fn layer_count(config: &Value) -> Option<usize> {
    ["num_layers", "num_hidden_layers", "n_layer"]
        .iter()
        .find_map(|key| config.get(key).and_then(Value::as_u64))
        .map(|count| count as usize)
}

/// Prefer the snapshot `refs/main` points at; otherwise the first snapshot
/// (by name) that carries a `config.json`.
fn pick_snapshot(repo: &Path) -> Result<PathBuf> {
    let snapshots = repo.join("snapshots");
    if let Ok(main) = fs::read_to_string(repo.join("refs").join("main")) {
        let candidate = snapshots.join(main.trim());
        if candidate.join("config.json").is_file() {
            return Ok(candidate);
        }
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(&snapshots)
        .with_context(|| format!("read {}", snapshots.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join("config.json").is_file())
        .collect();
    entries.sort();
    entries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no snapshot with config.json under {}", snapshots.display()))
}
