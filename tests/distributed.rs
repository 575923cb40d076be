//! Two ranks of `elk elicit` sharing one cache over a localhost group.

mod common;

use common::{free_port, stderr, stdout, ElkFixture};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Output, Stdio};

#[test]
fn two_rank_elicit_gates_output_and_extracts_on_every_rank() {
    let fixture = ElkFixture::create();
    let model = fixture.model();
    let port = free_port().to_string();

    let children: Vec<_> = (0..2)
        .map(|rank| {
            fixture
                .command()
                .env("LOCAL_RANK", rank.to_string())
                .env("WORLD_SIZE", "2")
                .env("MASTER_ADDR", "127.0.0.1")
                .env("MASTER_PORT", &port)
                .env("ELK_DIST_INIT_TIMEOUT_SECS", "30")
                // Root's extraction finishes well after every rank checked the cache.
                .env("ELK_TEST_EXTRACT_DELAY", "1")
                .args(["elicit", &model, "imdb"])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .expect("spawn rank")
        })
        .collect();
    let outputs: Vec<_> = children
        .into_iter()
        .map(|child| child.wait_with_output().expect("wait for rank"))
        .collect();

    for output in &outputs {
        assert!(output.status.success(), "stderr: {}", stderr(output));
    }
    let root = stdout(&outputs[0]);
    assert!(root.contains("model: "), "root stdout: {root}");
    assert!(root.contains("training on cpu"));
    assert!(stdout(&outputs[1]).is_empty());
    assert!(stderr(&outputs[0]).contains("starting stage command"));
    assert!(!stderr(&outputs[1]).contains("starting stage command"));

    assert_eq!(fixture.count("extract rank=0"), 1);
    assert_eq!(fixture.count("extract rank=1"), 1);
    assert_eq!(fixture.count("train"), 2);
    let log = fixture.stage_log();
    let last_extract = log
        .iter()
        .rposition(|line| line.starts_with("extract"))
        .expect("extract logged");
    let first_train = log
        .iter()
        .position(|line| line.starts_with("train"))
        .expect("train logged");
    assert!(last_extract < first_train, "log: {log:?}");
}

/// Spawn every rank, wait for all of them, and return their outputs by rank.
fn run_ranks(commands: Vec<Command>) -> Vec<Output> {
    let children: Vec<_> = commands
        .into_iter()
        .map(|mut command| {
            command
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .expect("spawn rank")
        })
        .collect();
    children
        .into_iter()
        .map(|child| child.wait_with_output().expect("wait for rank"))
        .collect()
}

/// An `nvidia-smi` that takes `seconds` to report no devices.
fn slow_nvidia_smi_path(dir: &Path, seconds: u32) -> String {
    let bin = dir.join("slow-bin");
    fs::create_dir_all(&bin).expect("create bin dir");
    let smi = bin.join("nvidia-smi");
    fs::write(&smi, format!("#!/bin/sh\nsleep {seconds}\nexit 1\n")).expect("write nvidia-smi");
    fs::set_permissions(&smi, fs::Permissions::from_mode(0o755)).expect("chmod nvidia-smi");
    let path = std::env::var("PATH").unwrap_or_default();
    format!("{}:{path}", bin.display())
}

#[test]
fn late_rank_extracts_its_own_shard_before_training() {
    let fixture = ElkFixture::create();
    let model = fixture.model();
    let port = free_port().to_string();
    let launch = |rank: usize| {
        let mut command = fixture.command();
        command
            .env("LOCAL_RANK", rank.to_string())
            .env("WORLD_SIZE", "2")
            .env("MASTER_ADDR", "127.0.0.1")
            .env("MASTER_PORT", &port)
            .env("ELK_DIST_INIT_TIMEOUT_SECS", "30")
            .args(["elicit", &model, "imdb"]);
        command
    };
    // Rank 1 resolves its device slowly, so it first looks at the cache
    // after root has finished extracting and published the manifest.
    let mut late = launch(1);
    late.env_remove("ELK_GPU_FAKE")
        .env("PATH", slow_nvidia_smi_path(fixture.root(), 3));
    let outputs = run_ranks(vec![launch(0), late]);

    for output in &outputs {
        assert!(output.status.success(), "stderr: {}", stderr(output));
    }
    assert_eq!(fixture.count("extract rank=0"), 1);
    assert_eq!(fixture.count("extract rank=1"), 1);
    assert_eq!(fixture.count("train"), 2);
    let run_id = stdout(&outputs[0])
        .lines()
        .find_map(|line| line.strip_prefix("run: "))
        .map(str::to_string)
        .expect("run id printed");
    let run_dir = fixture.cache_dir().join(run_id);
    assert!(run_dir.join("hiddens_0.bin").is_file());
    assert!(run_dir.join("hiddens_1.bin").is_file());
}

#[test]
fn malformed_launch_environment_fails_fast() {
    let fixture = ElkFixture::create();
    let output = fixture
        .command()
        .env("LOCAL_RANK", "3")
        .env("WORLD_SIZE", "2")
        .args(["elicit", &fixture.model(), "imdb"])
        .output()
        .expect("run elk");
    assert!(!output.status.success());
    assert!(stderr(&output).contains("distributed init failed"));
    assert!(fixture.stage_log().is_empty());
}
