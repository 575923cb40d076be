//! Stages backed by user-configured commands.
//!
//! Each stage spawns its command with inherited stdio (so a gated rank's
//! output is discarded along with ours) and describes the run through
//! environment variables:
//!
//! | variable           | meaning                                   |
//! |--------------------|-------------------------------------------|
//! | `ELK_STAGE`        | `extract`, `train`, or `eval`             |
//! | `ELK_RUN_ID`       | run identity                              |
//! | `ELK_CACHE_DIR`    | the run's cache directory                 |
//! | `ELK_RANK`         | this process's rank                       |
//! | `ELK_WORLD_SIZE`   | number of ranks                           |
//! | `ELK_DEVICE`       | resolved device                           |
//! | `ELK_LAYERS`       | comma-separated layers, empty for all     |
//! | `ELK_RUN_CONFIG`   | the full run configuration as JSON        |
//! | `ELK_REPORTER_DIR` | reporter output (train) or input (eval)   |
//! | `ELK_SOURCE_RUN`   | trained run being evaluated (eval)        |
//! | `ELK_OUT_DIR`      | eval output directory, when requested     |
//!
//! A train command that exits with `EX_NOINPUT` (66) found the cache stream
//! truncated while reading it.
use super::{Evaluator, Extractor, Stages, TrainOutcome, TrainedArtifact, Trainer, LOG_TARGET};
use crate::cache::{CacheState, RunCache};
use crate::config::{ResolvedSettings, Stage};
use crate::distributed::DistributedRank;
use crate::run::{RunConfiguration, RunIdentity};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Instant;

/// sysexits `EX_NOINPUT`.
const EXIT_TRUNCATED_INPUT: i32 = 66;

/// Builds the command-backed implementation of every stage.
pub struct CommandStages;

impl CommandStages {
    pub fn build(settings: &ResolvedSettings, rank: DistributedRank) -> Stages {
        let runner = StageRunner {
            settings: settings.clone(),
            cache: RunCache::new(settings.cache_dir.clone()),
            rank,
        };
        Stages {
            extractor: Box::new(CommandExtractor(runner.clone())),
            trainer: Box::new(CommandTrainer(runner.clone())),
            evaluator: Box::new(CommandEvaluator(runner)),
        }
    }
}

#[derive(Clone)]
struct StageRunner {
    settings: ResolvedSettings,
    cache: RunCache,
    rank: DistributedRank,
}

impl StageRunner {
    fn reporter_dir(&self, config: &RunConfiguration, id: &RunIdentity) -> PathBuf {
        config
            .out_dir
            .clone()
            .unwrap_or_else(|| self.settings.reporters_dir.join(id.as_str()))
    }

    fn run(
        &self,
        stage: Stage,
        config: &RunConfiguration,
        id: &RunIdentity,
        extra_env: &[(&str, String)],
    ) -> Result<ExitStatus> {
        let argv = self.settings.stage_command(stage)?;
        let run_config = serde_json::to_string(config).context("serialize run config")?;
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .env("ELK_STAGE", stage.as_str())
            .env("ELK_RUN_ID", id.as_str())
            .env("ELK_CACHE_DIR", self.cache.run_dir(id))
            .env("ELK_RANK", self.rank.rank.to_string())
            .env("ELK_WORLD_SIZE", self.rank.world_size.to_string())
            .env("ELK_DEVICE", config.device.as_deref().unwrap_or("cpu"))
            .env("ELK_LAYERS", config.layers_arg())
            .env("ELK_RUN_CONFIG", run_config);
        for (key, value) in extra_env {
            command.env(key, value);
        }

        tracing::info!(
            target: LOG_TARGET,
            stage = stage.as_str(),
            run_id = %id,
            rank = self.rank.rank,
            program = %argv[0],
            "starting stage command"
        );
        let start = Instant::now();
        let status = command
            .status()
            .with_context(|| format!("spawn {} command: {}", stage.as_str(), argv[0]))?;
        tracing::info!(
            target: LOG_TARGET,
            stage = stage.as_str(),
            run_id = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            status = %status,
            "stage command finished"
        );
        Ok(status)
    }
}

struct CommandExtractor(StageRunner);

impl Extractor for CommandExtractor {
    fn extract(&self, config: &RunConfiguration, id: &RunIdentity) -> Result<()> {
        let runner = &self.0;
        let dir = runner.cache.run_dir(id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let status = runner.run(Stage::Extract, config, id, &[])?;
        if !status.success() {
            return Err(anyhow!("extract command failed with status {status}"));
        }
        runner.cache.mark_extracted(id, runner.rank.rank)?;
        if runner.rank.rank == 0 {
            runner
                .cache
                .write_manifest(id, config, runner.rank.world_size)?;
            tracing::debug!(target: LOG_TARGET, run_id = %id, "wrote run manifest");
        }
        Ok(())
    }
}

struct CommandTrainer(StageRunner);

impl Trainer for CommandTrainer {
    fn train(&self, config: &RunConfiguration, id: &RunIdentity) -> Result<TrainOutcome> {
        let runner = &self.0;
        let cache_dir = runner.cache.run_dir(id);
        match runner.cache.probe(id)? {
            CacheState::Missing => return Ok(TrainOutcome::CacheMissing(cache_dir)),
            CacheState::Empty => return Ok(TrainOutcome::EmptyCache(cache_dir)),
            CacheState::Ready(manifest) => tracing::debug!(
                target: LOG_TARGET,
                run_id = %id,
                extracted_by = manifest.world_size,
                "cache ready"
            ),
        }
        let reporter_dir = runner.reporter_dir(config, id);
        fs::create_dir_all(&reporter_dir)
            .with_context(|| format!("create {}", reporter_dir.display()))?;
        let extra = [(
            "ELK_REPORTER_DIR",
            reporter_dir.to_string_lossy().into_owned(),
        )];
        let status = runner.run(Stage::Train, config, id, &extra)?;
        if status.code() == Some(EXIT_TRUNCATED_INPUT) {
            return Ok(TrainOutcome::EmptyCache(cache_dir));
        }
        if !status.success() {
            return Err(anyhow!("train command failed with status {status}"));
        }
        Ok(TrainOutcome::Trained(TrainedArtifact {
            run_id: id.clone(),
            reporter_dir,
        }))
    }
}

struct CommandEvaluator(StageRunner);

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, config: &RunConfiguration) -> Result<()> {
        let runner = &self.0;
        let source_name = config
            .source
            .as_deref()
            .ok_or_else(|| anyhow!("eval requires a source run"))?;
        let source = RunIdentity::from_name(source_name)?;
        let reporter_dir = runner.settings.reporters_dir.join(source.as_str());
        if !reporter_dir.is_dir() {
            return Err(anyhow!(
                "no trained reporters for run {source} (expected {})",
                reporter_dir.display()
            ));
        }
        let id = RunIdentity::derive(config)?;
        let mut extra = vec![
            ("ELK_SOURCE_RUN", source.to_string()),
            (
                "ELK_REPORTER_DIR",
                reporter_dir.to_string_lossy().into_owned(),
            ),
        ];
        if let Some(out_dir) = &config.out_dir {
            extra.push(("ELK_OUT_DIR", out_dir.to_string_lossy().into_owned()));
        }
        let status = runner.run(Stage::Eval, config, &id, &extra)?;
        if !status.success() {
            return Err(anyhow!("eval command failed with status {status}"));
        }
        Ok(())
    }
}
