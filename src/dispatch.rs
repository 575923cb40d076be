//! Route a parsed command to its action.
//!
//! Heavy collaborators come from a [`Runtime`] and are only built inside the
//! branches that need them; `list` touches nothing but the cache root.
use crate::cache::{RunCache, RunManifest};
use crate::cli::{Command, ListArgs};
use crate::config::ResolvedSettings;
use crate::distributed::{self, resolve_device, DistributedContext, DistributedRank};
use crate::elicit::ElicitCoordinator;
use crate::error::ElkError;
use crate::layers::{resolve_layers, HubModelConfig, ModelConfigProvider};
use crate::logging::LogHandle;
use crate::output_gate::OutputGate;
use crate::run::{CommandKind, RunConfiguration, RunIdentity};
use crate::stages::{CommandStages, Stages};
use anyhow::{Context, Result};
use std::io::Write;

/// Process-level collaborators the dispatcher may need.
pub trait Runtime {
    fn settings(&self) -> &ResolvedSettings;
    /// Join the distributed group, or run alone when not launched as one.
    fn distributed(&self) -> Result<DistributedContext>;
    fn accelerator_present(&self) -> bool;
    fn model_config(&self) -> Box<dyn ModelConfigProvider>;
    fn stages(&self, rank: DistributedRank) -> Stages;
    fn logs(&self) -> Option<&LogHandle>;
}

/// The runtime the `elk` binary uses.
pub struct CliRuntime {
    settings: ResolvedSettings,
    logs: Option<LogHandle>,
}

impl CliRuntime {
    pub fn new(settings: ResolvedSettings, logs: Option<LogHandle>) -> Self {
        Self { settings, logs }
    }
}

impl Runtime for CliRuntime {
    fn settings(&self) -> &ResolvedSettings {
        &self.settings
    }

    fn distributed(&self) -> Result<DistributedContext> {
        DistributedContext::from_env()
    }

    fn accelerator_present(&self) -> bool {
        distributed::accelerator_present()
    }

    fn model_config(&self) -> Box<dyn ModelConfigProvider> {
        Box::new(HubModelConfig::from_env())
    }

    fn stages(&self, rank: DistributedRank) -> Stages {
        CommandStages::build(&self.settings, rank)
    }

    fn logs(&self) -> Option<&LogHandle> {
        self.logs.as_ref()
    }
}

pub fn dispatch(command: &Command, runtime: &dyn Runtime, out: &mut dyn Write) -> Result<()> {
    let config = match command {
        Command::List(args) => return list_runs(args, runtime.settings(), out),
        Command::External(argv) => {
            let name = argv.first().cloned().unwrap_or_default();
            return Err(ElkError::UnknownCommand(name).into());
        }
        Command::Extract(args) => RunConfiguration::from_extract(args),
        Command::Train(args) => RunConfiguration::from_train(args),
        Command::Elicit(args) => RunConfiguration::from_elicit(args),
        Command::Eval(args) => RunConfiguration::from_eval(args),
    };

    let config = if config.model.is_some() {
        let provider = runtime.model_config();
        resolve_layers(&config, provider.as_ref())?
    } else {
        config
    };
    let ctx = runtime.distributed()?;
    let device = resolve_device(config.device.as_deref(), ctx.current_rank(), || {
        runtime.accelerator_present()
    });
    let config = config.with_device(device);

    let gate = OutputGate::enter(&ctx, runtime.logs())?;
    tracing::debug!(
        command = %config.command,
        rank = ctx.current_rank(),
        world_size = ctx.world_size(),
        group = ctx.rank().group_initialized,
        suppressed = gate.is_suppressing(),
        "output gate entered"
    );
    for line in config.echo_lines()? {
        writeln!(out, "{line}").context("write config echo")?;
    }

    let stages = runtime.stages(ctx.rank());
    let result = run_action(&config, &ctx, &stages, out);
    out.flush().context("flush stdout")?;
    drop(gate);
    result
}

fn run_action(
    config: &RunConfiguration,
    ctx: &DistributedContext,
    stages: &Stages,
    out: &mut dyn Write,
) -> Result<()> {
    match config.command {
        CommandKind::Extract => {
            let id = RunIdentity::derive(config)?;
            stages.extractor.extract(config, &id)?;
            writeln!(out, "run: {id}").context("write run id")?;
        }
        CommandKind::Train => {
            let name = config.name.as_deref().unwrap_or_default();
            let id = RunIdentity::from_name(name)?;
            let artifact = stages.trainer.train(config, &id)?.into_artifact(&id)?;
            writeln!(out, "reporters: {}", artifact.reporter_dir.display())
                .context("write reporter dir")?;
        }
        CommandKind::Elicit => {
            let coordinator =
                ElicitCoordinator::new(ctx, stages.extractor.as_ref(), stages.trainer.as_ref());
            let artifact = coordinator.run(config)?;
            writeln!(out, "run: {}", artifact.run_id).context("write run id")?;
            writeln!(out, "reporters: {}", artifact.reporter_dir.display())
                .context("write reporter dir")?;
        }
        CommandKind::Eval => stages.evaluator.evaluate(config)?,
    }
    Ok(())
}

fn list_runs(args: &ListArgs, settings: &ResolvedSettings, out: &mut dyn Write) -> Result<()> {
    let cache = RunCache::new(settings.cache_dir.clone());
    let runs = cache.list_runs()?;
    if args.json {
        let text = serde_json::to_string_pretty(&runs).context("serialize run list")?;
        writeln!(out, "{text}").context("write run list")?;
        return Ok(());
    }
    if runs.is_empty() {
        writeln!(out, "no cached runs in {}", cache.root().display()).context("write run list")?;
        return Ok(());
    }
    writeln!(out, "{:<16}  {:<13}  {:<24}  DATASETS", "RUN", "CREATED_MS", "MODEL")
        .context("write run list")?;
    for run in &runs {
        writeln!(out, "{}", list_row(run)).context("write run list")?;
    }
    Ok(())
}

fn list_row(run: &RunManifest) -> String {
    let model = run.config["model"].as_str().unwrap_or("-");
    let datasets = run.config["datasets"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    format!(
        "{:<16}  {:<13}  {:<24}  {}",
        run.run_id, run.created_at_epoch_ms, model, datasets
    )
}
