//! `elicit`: train, extracting first when the cache is not there yet.
use crate::distributed::DistributedContext;
use crate::run::{RunConfiguration, RunIdentity};
use crate::stages::{Extractor, TrainOutcome, TrainedArtifact, Trainer};
use anyhow::Result;

pub struct ElicitCoordinator<'a> {
    ctx: &'a DistributedContext,
    extractor: &'a dyn Extractor,
    trainer: &'a dyn Trainer,
}

impl<'a> ElicitCoordinator<'a> {
    pub fn new(
        ctx: &'a DistributedContext,
        extractor: &'a dyn Extractor,
        trainer: &'a dyn Trainer,
    ) -> Self {
        Self {
            ctx,
            extractor,
            trainer,
        }
    }

    /// Train on the cache for `config`, running extraction at most once.
    ///
    /// Every rank must reach the same fallback decision: the barrier after
    /// extraction is collective, so a rank that skips it leaves the others
    /// waiting. The cache stays unready until every rank has extracted.
    pub fn run(&self, config: &RunConfiguration) -> Result<TrainedArtifact> {
        let id = RunIdentity::derive(config)?;
        let first = self.trainer.train(config, &id)?;
        let reason = match first {
            TrainOutcome::Trained(artifact) => return Ok(artifact),
            TrainOutcome::CacheMissing(_) => "missing",
            TrainOutcome::EmptyCache(_) => "empty",
        };
        tracing::info!(
            run_id = %id,
            rank = self.ctx.current_rank(),
            world_size = self.ctx.world_size(),
            cache = reason,
            "cache unusable; extracting hidden states"
        );
        self.extractor.extract(config, &id)?;
        self.ctx.barrier()?;
        self.trainer.train(config, &id)?.into_artifact(&id)
    }
}
