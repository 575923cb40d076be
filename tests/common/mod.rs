//! Shared test infrastructure for integration tests.
//!
//! Each fixture owns a temp directory holding a settings file, a local model
//! directory, and shell-script stage commands that append what they did to a
//! log file.
#![allow(dead_code)]

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const EXTRACT_SCRIPT: &str = r#"echo "extract rank=$ELK_RANK layers=$ELK_LAYERS" >> "$ELK_TEST_LOG"
if [ "$ELK_RANK" = 0 ]; then sleep "${ELK_TEST_EXTRACT_DELAY:-0}"; fi
if [ "$ELK_TEST_EXTRACT_MODE" = empty ]; then exit 0; fi
echo hidden > "$ELK_CACHE_DIR/hiddens_$ELK_RANK.bin"
"#;

const TRAIN_SCRIPT: &str = r#"echo "train rank=$ELK_RANK run=$ELK_RUN_ID" >> "$ELK_TEST_LOG"
echo "training on $ELK_DEVICE"
touch "$ELK_REPORTER_DIR/reporter_$ELK_RANK.pt"
"#;

const EVAL_SCRIPT: &str = r#"echo "eval rank=$ELK_RANK source=$ELK_SOURCE_RUN" >> "$ELK_TEST_LOG"
"#;

/// Caller environment that would otherwise leak into the spawned `elk`.
const AMBIENT_VARS: [&str; 11] = [
    "LOCAL_RANK",
    "WORLD_SIZE",
    "MASTER_ADDR",
    "MASTER_PORT",
    "ELK_DIR",
    "ELK_LOG",
    "ELK_EXTRACT_COMMAND",
    "ELK_TRAIN_COMMAND",
    "ELK_EVAL_COMMAND",
    "HF_HOME",
    "HF_HUB_CACHE",
];

pub struct ElkFixture {
    dir: TempDir,
}

impl ElkFixture {
    pub fn create() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path();
        let model = root.join("tiny-model");
        fs::create_dir_all(&model).expect("create model dir");
        fs::write(model.join("config.json"), r#"{"num_hidden_layers": 6}"#)
            .expect("write model config");
        for (name, body) in [
            ("extract.sh", EXTRACT_SCRIPT),
            ("train.sh", TRAIN_SCRIPT),
            ("eval.sh", EVAL_SCRIPT),
        ] {
            fs::write(root.join(name), body).expect("write stage script");
        }
        let settings = serde_json::json!({
            "schema_version": 1,
            "cache_dir": root.join("cache"),
            "extract_command": format!("sh {}", root.join("extract.sh").display()),
            "train_command": format!("sh {}", root.join("train.sh").display()),
            "eval_command": format!("sh {}", root.join("eval.sh").display()),
        });
        fs::write(
            root.join("settings.json"),
            serde_json::to_string_pretty(&settings).expect("serialize settings"),
        )
        .expect("write settings");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn model(&self) -> String {
        self.root().join("tiny-model").display().to_string()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root().join("cache")
    }

    /// `elk` with the fixture's settings and no launcher variables.
    pub fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_elk"));
        for var in AMBIENT_VARS {
            command.env_remove(var);
        }
        command
            .env("ELK_CONFIG", self.root().join("settings.json"))
            .env("ELK_GPU_FAKE", "none")
            .env("ELK_TEST_LOG", self.log_path());
        command
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command().args(args).output().expect("run elk")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root().join("stages.log")
    }

    /// Stage log lines, in the order the scripts wrote them.
    pub fn stage_log(&self) -> Vec<String> {
        fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.stage_log()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// A localhost port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}
