//! Typed failures the orchestrator branches on.
//!
//! Everything else travels as an opaque `anyhow::Error`; these variants exist
//! so callers (and tests) can tell the recognized conditions apart with
//! `downcast_ref` instead of matching on message text.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElkError {
    #[error("cannot use both --layers and --layer-stride; please use only one")]
    LayerConflict,

    #[error("distributed init failed: {0}")]
    DistributedInit(String),

    #[error("no cached hidden states for run {run_id} (expected {})", path.display())]
    MissingCache { run_id: String, path: PathBuf },

    #[error("cached hidden states for run {run_id} are empty or truncated ({})", path.display())]
    EmptyCache { run_id: String, path: PathBuf },

    #[error("unknown command {0}")]
    UnknownCommand(String),
}
