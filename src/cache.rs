//! Run cache layout and probing.
//!
//! Each run owns `<cache_root>/<run_id>/`. Stage commands write hidden states
//! there; every rank drops a `.done_<rank>` marker once its own extraction
//! succeeds and root adds `run.json`. Only existence and emptiness are
//! inspected here, never the stage data itself.
use crate::run::{RunConfiguration, RunIdentity};
use crate::util::{display_path, now_epoch_ms};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Current schema version for `run.json`.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "run.json";
const DONE_MARKER_PREFIX: &str = ".done_";

/// Written by root after a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at_epoch_ms: u128,
    pub world_size: usize,
    pub config: serde_json::Value,
}

/// What a trainer would find at a run's cache directory.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheState {
    Missing,
    /// The manifest or the data stream is empty or cut short, or some rank
    /// has not finished extracting.
    Empty,
    Ready(RunManifest),
}

/// Typed paths into the cache root.
#[derive(Debug, Clone)]
pub struct RunCache {
    root: PathBuf,
}

impl RunCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `<root>/<run_id>/` directory path.
    pub fn run_dir(&self, id: &RunIdentity) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Return the `<root>/<run_id>/run.json` path.
    pub fn manifest_path(&self, id: &RunIdentity) -> PathBuf {
        self.run_dir(id).join(MANIFEST_FILE)
    }

    /// Inspect the cache for `id` without reading stage data.
    pub fn probe(&self, id: &RunIdentity) -> Result<CacheState> {
        let dir = self.run_dir(id);
        let path = self.manifest_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CacheState::Missing),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(CacheState::Empty);
        }
        let manifest: RunManifest = match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(err) if err.is_eof() => return Ok(CacheState::Empty),
            Err(err) => {
                return Err(err).with_context(|| format!("parse run manifest {}", path.display()))
            }
        };
        if !has_stage_data(&dir)? {
            return Ok(CacheState::Empty);
        }
        let pending: Vec<usize> = (0..manifest.world_size)
            .filter(|rank| !self.done_marker(id, *rank).is_file())
            .collect();
        if !pending.is_empty() {
            tracing::debug!(run_id = %id, ?pending, "ranks have not finished extracting");
            return Ok(CacheState::Empty);
        }
        Ok(CacheState::Ready(manifest))
    }

    fn done_marker(&self, id: &RunIdentity, rank: usize) -> PathBuf {
        self.run_dir(id).join(format!("{DONE_MARKER_PREFIX}{rank}"))
    }

    /// Note that `rank` finished writing its share of the cache for `id`.
    pub fn mark_extracted(&self, id: &RunIdentity, rank: usize) -> Result<()> {
        let dir = self.run_dir(id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = self.done_marker(id, rank);
        fs::write(&path, b"").with_context(|| format!("write {}", path.display()))
    }

    /// Record a finished extraction for `id`.
    pub fn write_manifest(
        &self,
        id: &RunIdentity,
        config: &RunConfiguration,
        world_size: usize,
    ) -> Result<RunManifest> {
        let manifest = RunManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id: id.to_string(),
            created_at_epoch_ms: now_epoch_ms()?,
            world_size,
            config: crate::run::canonical_value(config)?,
        };
        let dir = self.run_dir(id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let text = serde_json::to_string_pretty(&manifest).context("serialize run manifest")?;
        // Write-then-rename so a concurrent probe never sees half a manifest.
        let path = self.manifest_path(id);
        let tmp = dir.join(format!(".{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, text.as_bytes()).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("publish {}", path.display()))?;
        Ok(manifest)
    }

    /// Every cached run with a readable manifest, oldest first.
    pub fn list_runs(&self) -> Result<Vec<RunManifest>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", self.root.display())),
        };
        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.root.display()))?;
            let path = entry.path().join(MANIFEST_FILE);
            if !path.is_file() {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| {
                    serde_json::from_slice::<RunManifest>(&bytes).map_err(anyhow::Error::from)
                });
            match parsed {
                Ok(manifest) => runs.push(manifest),
                Err(err) => tracing::warn!(
                    path = %display_path(&path, Some(&self.root)),
                    "skipping unreadable run manifest: {err}"
                ),
            }
        }
        runs.sort_by(|a, b| {
            a.created_at_epoch_ms
                .cmp(&b.created_at_epoch_ms)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }
}

/// Any non-empty file besides the manifest counts as stage output.
fn has_stage_data(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let name = entry.file_name();
        if name == MANIFEST_FILE || name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let meta = fs::metadata(&path).with_context(|| format!("inspect {}", path.display()))?;
        if meta.is_file() && meta.len() > 0 {
            return Ok(true);
        }
        if meta.is_dir() && has_stage_data(&path)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::fixtures::elicit_config;

    fn setup() -> (tempfile::TempDir, RunCache, RunIdentity) {
        let dir = tempfile::tempdir().unwrap();
        let cache = RunCache::new(dir.path().join("cache"));
        let id = RunIdentity::derive(&elicit_config()).unwrap();
        (dir, cache, id)
    }

    #[test]
    fn probe_reports_missing_without_directory() {
        let (_dir, cache, id) = setup();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Missing);
        fs::create_dir_all(cache.run_dir(&id)).unwrap();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Missing);
    }

    #[test]
    fn probe_reports_empty_for_manifest_without_data() {
        let (_dir, cache, id) = setup();
        cache.write_manifest(&id, &elicit_config(), 1).unwrap();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Empty);
        fs::write(cache.run_dir(&id).join("layer_0.bin"), b"").unwrap();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Empty);
    }

    #[test]
    fn probe_reports_empty_for_truncated_manifest() {
        let (_dir, cache, id) = setup();
        fs::create_dir_all(cache.run_dir(&id)).unwrap();
        fs::write(cache.run_dir(&id).join("layer_0.bin"), b"data").unwrap();
        fs::write(cache.manifest_path(&id), b"").unwrap();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Empty);
        fs::write(cache.manifest_path(&id), br#"{"schema_version": 1, "run_id": "#).unwrap();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Empty);
    }

    #[test]
    fn probe_rejects_corrupt_manifest() {
        let (_dir, cache, id) = setup();
        fs::create_dir_all(cache.run_dir(&id)).unwrap();
        fs::write(cache.manifest_path(&id), b"not json").unwrap();
        assert!(cache.probe(&id).is_err());
    }

    #[test]
    fn probe_reports_ready_with_nested_data() {
        let (_dir, cache, id) = setup();
        let shard = cache.run_dir(&id).join("imdb").join("rank0");
        fs::create_dir_all(&shard).unwrap();
        fs::write(shard.join("hiddens.bin"), b"data").unwrap();
        cache.mark_extracted(&id, 0).unwrap();
        cache.mark_extracted(&id, 1).unwrap();
        let manifest = cache.write_manifest(&id, &elicit_config(), 2).unwrap();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Ready(manifest.clone()));
        assert_eq!(manifest.config["model"], "gpt2");
        assert_eq!(manifest.world_size, 2);
    }

    #[test]
    fn cache_waits_for_every_rank_to_finish() {
        let (_dir, cache, id) = setup();
        fs::create_dir_all(cache.run_dir(&id)).unwrap();
        fs::write(cache.run_dir(&id).join("hiddens_0.bin"), b"data").unwrap();
        cache.mark_extracted(&id, 0).unwrap();
        cache.write_manifest(&id, &elicit_config(), 3).unwrap();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Empty);
        cache.mark_extracted(&id, 2).unwrap();
        assert_eq!(cache.probe(&id).unwrap(), CacheState::Empty);
        cache.mark_extracted(&id, 1).unwrap();
        assert!(matches!(cache.probe(&id).unwrap(), CacheState::Ready(_)));
    }

    #[test]
    fn list_runs_is_ordered_and_skips_junk() {
        let (_dir, cache, _) = setup();
        assert!(cache.list_runs().unwrap().is_empty());
        let a = RunIdentity::from_name("bbb").unwrap();
        let b = RunIdentity::from_name("aaa").unwrap();
        cache.write_manifest(&a, &elicit_config(), 1).unwrap();
        cache.write_manifest(&b, &elicit_config(), 1).unwrap();
        fs::create_dir_all(cache.root().join("no-manifest")).unwrap();
        let junk = cache.root().join("junk");
        fs::create_dir_all(&junk).unwrap();
        fs::write(junk.join(MANIFEST_FILE), b"{").unwrap();

        let runs = cache.list_runs().unwrap();
        let ids: Vec<&str> = runs.iter().map(|run| run.run_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(runs[0].created_at_epoch_ms <= runs[1].created_at_epoch_ms);
        if runs[0].created_at_epoch_ms == runs[1].created_at_epoch_ms {
            assert_eq!(ids, vec!["aaa", "bbb"]);
        }
    }
}
