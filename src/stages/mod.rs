//! Pipeline stages as seen by the orchestrator.
//!
//! Extraction, training, and evaluation are implemented elsewhere; this module
//! only defines the seams and the command-backed implementations the binary
//! ships with.
use crate::error::ElkError;
use crate::run::{RunConfiguration, RunIdentity};
use anyhow::Result;
use std::path::PathBuf;

mod command;

pub use command::CommandStages;

/// Log target for stage execution; quieted on non-root ranks.
pub const LOG_TARGET: &str = "elk::stage";

/// Location of a trained set of reporters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainedArtifact {
    pub run_id: RunIdentity,
    pub reporter_dir: PathBuf,
}

/// Result of one training attempt. Failures other than a missing or empty
/// cache are the `Err` arm of the surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainOutcome {
    Trained(TrainedArtifact),
    /// No cache exists at the given directory.
    CacheMissing(PathBuf),
    /// The cache exists but its stream is empty or truncated.
    EmptyCache(PathBuf),
}

impl TrainOutcome {
    /// Treat the missing-input signals as fatal.
    pub fn into_artifact(self, id: &RunIdentity) -> Result<TrainedArtifact> {
        match self {
            TrainOutcome::Trained(artifact) => Ok(artifact),
            TrainOutcome::CacheMissing(path) => Err(ElkError::MissingCache {
                run_id: id.to_string(),
                path,
            }
            .into()),
            TrainOutcome::EmptyCache(path) => Err(ElkError::EmptyCache {
                run_id: id.to_string(),
                path,
            }
            .into()),
        }
    }
}

pub trait Extractor {
    /// Build (or rebuild) the cache addressed by `id`.
    fn extract(&self, config: &RunConfiguration, id: &RunIdentity) -> Result<()>;
}

pub trait Trainer {
    fn train(&self, config: &RunConfiguration, id: &RunIdentity) -> Result<TrainOutcome>;
}

pub trait Evaluator {
    fn evaluate(&self, config: &RunConfiguration) -> Result<()>;
}

/// The three stage implementations a heavy command may need.
pub struct Stages {
    pub extractor: Box<dyn Extractor>,
    pub trainer: Box<dyn Trainer>,
    pub evaluator: Box<dyn Evaluator>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_signals_become_typed_errors() {
        let id = RunIdentity::from_name("abc").unwrap();
        let err = TrainOutcome::CacheMissing(PathBuf::from("/c/abc"))
            .into_artifact(&id)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ElkError>(),
            Some(ElkError::MissingCache { .. })
        ));
        let err = TrainOutcome::EmptyCache(PathBuf::from("/c/abc"))
            .into_artifact(&id)
            .unwrap_err();
        assert!(err.to_string().contains("empty or truncated"));
        let artifact = TrainedArtifact {
            run_id: id.clone(),
            reporter_dir: PathBuf::from("/r/abc"),
        };
        assert_eq!(
            TrainOutcome::Trained(artifact.clone()).into_artifact(&id).unwrap(),
            artifact
        );
    }
}
