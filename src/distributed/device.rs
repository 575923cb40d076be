//! Accelerator detection and per-rank device binding.
use std::process::{Command, Stdio};

const GPU_FAKE_ENV: &str = "ELK_GPU_FAKE";

/// Whether an accelerator is usable by this process.
///
/// `ELK_GPU_FAKE=cuda|none` forces the answer for deterministic tests;
/// otherwise `nvidia-smi` must be on `PATH` and list devices successfully.
pub fn accelerator_present() -> bool {
    if let Some(forced) = fake_accelerator(std::env::var(GPU_FAKE_ENV).ok().as_deref()) {
        tracing::debug!(forced, "accelerator probe overridden by {GPU_FAKE_ENV}");
        return forced;
    }
    let Ok(smi) = which::which("nvidia-smi") else {
        return false;
    };
    Command::new(smi)
        .arg("-L")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Pick the device for `rank`. An explicit device always wins; the probe only
/// runs when none was configured.
pub fn resolve_device(
    configured: Option<&str>,
    rank: usize,
    accelerator: impl FnOnce() -> bool,
) -> String {
    if let Some(device) = configured.map(str::trim).filter(|device| !device.is_empty()) {
        return device.to_string();
    }
    if accelerator() {
        format!("cuda:{rank}")
    } else {
        "cpu".to_string()
    }
}

fn fake_accelerator(value: Option<&str>) -> Option<bool> {
    let normalized = value?.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "cuda" | "gpu" | "1" | "true" => Some(true),
        "none" | "cpu" | "0" | "false" => Some(false),
        _ => None,
    }
}
