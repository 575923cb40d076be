use super::RunConfiguration;
use crate::util::sha256_hex;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fmt;

/// Bumped whenever the canonical field set changes so old caches stop matching.
const CANONICAL_TAG: &str = "elk-run-v1";
const IDENTITY_HEX_LEN: usize = 16;

/// Stable name of a run's cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunIdentity(String);

/// Semantic fields only, in a fixed order. Device, run name, output
/// directory, and the command itself do not change what gets cached.
#[derive(Serialize)]
struct CanonicalRun<'a> {
    model: Option<&'a str>,
    datasets: &'a [String],
    layers: Vec<usize>,
    token_loc: Option<&'a str>,
    max_examples: Option<usize>,
    seed: Option<u64>,
    net: Option<&'a str>,
    normalization: Option<&'a str>,
    source: Option<&'a str>,
}

impl RunIdentity {
    /// Derive the identity of a (layer-resolved) configuration.
    pub fn derive(config: &RunConfiguration) -> Result<Self> {
        let bytes = canonical_bytes(config)?;
        let digest = sha256_hex(&bytes);
        Ok(Self(digest[..IDENTITY_HEX_LEN].to_string()))
    }

    /// Accept a user-supplied run name as an identity.
    pub fn from_name(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
            return Err(anyhow!("invalid run name {name:?}"));
        }
        if trimmed.contains(['/', '\\']) {
            return Err(anyhow!("run name {name:?} must not contain path separators"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical JSON for a configuration, as recorded in run manifests.
pub(crate) fn canonical_value(config: &RunConfiguration) -> Result<serde_json::Value> {
    serde_json::to_value(canonical(config)).context("serialize canonical run config")
}

fn canonical(config: &RunConfiguration) -> CanonicalRun<'_> {
    let mut layers = config.layers.clone();
    layers.sort_unstable();
    layers.dedup();
    CanonicalRun {
        model: config.model.as_deref(),
        datasets: &config.datasets,
        layers,
        token_loc: config.token_loc.as_deref(),
        max_examples: config.max_examples,
        seed: config.seed,
        net: config.net.as_deref(),
        normalization: config.normalization.as_deref(),
        source: config.source.as_deref(),
    }
}

fn canonical_bytes(config: &RunConfiguration) -> Result<Vec<u8>> {
    let mut bytes = CANONICAL_TAG.as_bytes().to_vec();
    bytes.push(b'\n');
    let body = serde_json::to_vec(&canonical(config)).context("serialize canonical run config")?;
    bytes.extend_from_slice(&body);
    Ok(bytes)
}
