//! CLI argument parsing for the elk pipeline.
//!
//! The CLI only wires flags into a `RunConfiguration`; command routing lives in
//! the dispatcher so the same core can be driven without clap.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "elk",
    version,
    about = "Extract hidden states, train reporters, and evaluate them",
    after_help = "Commands:\n  extract <model> <dataset>...   Extract hidden states into the run cache\n  train <run> ...                Train reporters on a cached run\n  elicit <model> <dataset>...    Train, extracting first if the cache is missing\n  eval <source> <dataset>...     Evaluate reporters from a trained run\n  list                           List cached runs\n\nDistributed runs:\n  Launch one process per device with LOCAL_RANK, WORLD_SIZE, MASTER_ADDR and\n  MASTER_PORT set (e.g. by torchrun); only rank 0 prints to stdout.",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Settings file (defaults to $ELK_CONFIG, then <config dir>/elk/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root directory for cached runs (overrides $ELK_DIR and settings)
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Command line for the extraction stage
    #[arg(long, global = true, value_name = "CMD")]
    pub extract_cmd: Option<String>,

    /// Command line for the training stage
    #[arg(long, global = true, value_name = "CMD")]
    pub train_cmd: Option<String>,

    /// Command line for the evaluation stage
    #[arg(long, global = true, value_name = "CMD")]
    pub eval_cmd: Option<String>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

/// Pipeline commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract hidden states from a model
    Extract(ExtractArgs),
    /// Train a set of reporters on hidden states from `elk extract`
    Train(TrainArgs),
    /// Extract and train reporters, extracting only when the cache is missing
    Elicit(ElicitArgs),
    /// Evaluate a set of reporters generated by `elk train`
    Eval(EvalArgs),
    /// List all cached runs
    List(ListArgs),
    #[command(external_subcommand)]
    External(Vec<String>),
}

/// Options that shape hidden-state extraction.
#[derive(Args, Debug, Clone)]
pub struct ExtractionArgs {
    /// Model identifier (hub id or local directory)
    #[arg(value_name = "MODEL")]
    pub model: String,

    /// Datasets to extract hidden states for
    #[arg(value_name = "DATASET", required = true, num_args = 1..)]
    pub datasets: Vec<String>,

    /// Explicit layer indices to extract
    #[arg(long, value_name = "N", num_args = 1, value_delimiter = ',')]
    pub layers: Vec<usize>,

    /// Extract every Nth layer starting at 0
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub layer_stride: usize,

    /// Token position to read hidden states from
    #[arg(long, default_value = "last", value_parser = ["first", "last", "mean"])]
    pub token_loc: String,

    /// Maximum number of examples per dataset
    #[arg(long, value_name = "N")]
    pub max_examples: Option<usize>,

    /// Random seed for prompt sampling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Device to run on (defaults to cuda:<rank> when available, else cpu)
    #[arg(long)]
    pub device: Option<String>,
}

/// Options that shape reporter training.
#[derive(Args, Debug, Clone)]
pub struct TrainingArgs {
    /// Reporter method
    #[arg(long, default_value = "ccs", value_parser = ["ccs", "eigen"])]
    pub net: String,

    /// Hidden-state normalization applied before training
    #[arg(long, value_parser = ["none", "meanonly", "full"])]
    pub normalization: Option<String>,

    /// Directory for trained reporters (defaults to <reporters dir>/<run>)
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub extraction: ExtractionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Name of the cached extraction run to train on
    #[arg(value_name = "RUN")]
    pub name: String,

    #[command(flatten)]
    pub training: TrainingArgs,

    /// Device to run on (defaults to cuda:<rank> when available, else cpu)
    #[arg(long)]
    pub device: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ElicitArgs {
    #[command(flatten)]
    pub extraction: ExtractionArgs,

    #[command(flatten)]
    pub training: TrainingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct EvalArgs {
    /// Trained run whose reporters are evaluated
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Datasets to evaluate on
    #[arg(value_name = "DATASET", required = true, num_args = 1..)]
    pub datasets: Vec<String>,

    /// Device to run on (defaults to cuda:<rank> when available, else cpu)
    #[arg(long)]
    pub device: Option<String>,

    /// Directory for evaluation results
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Emit run manifests as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elicit_accepts_extraction_and_training_flags() {
        let args = RootArgs::try_parse_from([
            "elk",
            "elicit",
            "gpt2",
            "imdb",
            "amazon_polarity",
            "--layer-stride",
            "3",
            "--net",
            "eigen",
        ])
        .unwrap();
        let Command::Elicit(elicit) = args.command else {
            panic!("expected elicit");
        };
        assert_eq!(elicit.extraction.model, "gpt2");
        assert_eq!(elicit.extraction.datasets, vec!["imdb", "amazon_polarity"]);
        assert_eq!(elicit.extraction.layer_stride, 3);
        assert_eq!(elicit.training.net, "eigen");
    }

    #[test]
    fn layers_accept_comma_separated_values() {
        let args =
            RootArgs::try_parse_from(["elk", "extract", "gpt2", "imdb", "--layers", "1,4,7"])
                .unwrap();
        let Command::Extract(extract) = args.command else {
            panic!("expected extract");
        };
        assert_eq!(extract.extraction.layers, vec![1, 4, 7]);
    }

    #[test]
    fn layers_leave_following_datasets_positional() {
        let args =
            RootArgs::try_parse_from(["elk", "elicit", "gpt2", "--layers", "1,3", "imdb"])
                .unwrap();
        let Command::Elicit(elicit) = args.command else {
            panic!("expected elicit");
        };
        assert_eq!(elicit.extraction.layers, vec![1, 3]);
        assert_eq!(elicit.extraction.datasets, vec!["imdb"]);

        let repeated = RootArgs::try_parse_from([
            "elk", "extract", "gpt2", "--layers", "2", "--layers", "5", "imdb",
        ])
        .unwrap();
        let Command::Extract(extract) = repeated.command else {
            panic!("expected extract");
        };
        assert_eq!(extract.extraction.layers, vec![2, 5]);
        assert_eq!(extract.extraction.datasets, vec!["imdb"]);
    }

    #[test]
    fn unknown_subcommand_is_captured_for_dispatch() {
        let args = RootArgs::try_parse_from(["elk", "bogus", "x"]).unwrap();
        match args.command {
            Command::External(argv) => assert_eq!(argv, vec!["bogus", "x"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let args = RootArgs::try_parse_from(["elk", "list", "--cache-dir", "/tmp/elk", "--json"])
            .unwrap();
        assert_eq!(args.global.cache_dir, Some(PathBuf::from("/tmp/elk")));
        assert!(matches!(args.command, Command::List(ListArgs { json: true })));
    }
}
