//! User settings for locating caches and stage commands.
//!
//! Settings live in a small JSON file; every value can be overridden from the
//! command line, and stage commands can also come from the environment.
use crate::cli::GlobalArgs;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Current schema version for the settings file.
pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

const CONFIG_ENV: &str = "ELK_CONFIG";
const CACHE_DIR_ENV: &str = "ELK_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporters_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_command: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: SETTINGS_SCHEMA_VERSION,
            cache_dir: None,
            reporters_dir: None,
            extract_command: None,
            train_command: None,
            eval_command: None,
        }
    }
}

/// Pipeline stage backed by an external command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Train,
    Eval,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Train => "train",
            Stage::Eval => "eval",
        }
    }

    fn env_var(self) -> &'static str {
        match self {
            Stage::Extract => "ELK_EXTRACT_COMMAND",
            Stage::Train => "ELK_TRAIN_COMMAND",
            Stage::Eval => "ELK_EVAL_COMMAND",
        }
    }
}

/// Settings merged with CLI overrides; what the rest of the binary reads.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub cache_dir: PathBuf,
    pub reporters_dir: PathBuf,
    settings: Settings,
    overrides: GlobalArgs,
}

impl ResolvedSettings {
    pub fn resolve(args: &GlobalArgs) -> Result<Self> {
        let settings = load_settings(args.config.as_deref())?;
        let cache_dir = match (&args.cache_dir, env::var_os(CACHE_DIR_ENV)) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) if !dir.is_empty() => PathBuf::from(dir),
            _ => match &settings.cache_dir {
                Some(dir) => dir.clone(),
                None => default_data_root(dirs::cache_dir())?,
            },
        };
        let reporters_dir = match &settings.reporters_dir {
            Some(dir) => dir.clone(),
            None => cache_dir.join("reporters"),
        };
        Ok(Self {
            cache_dir,
            reporters_dir,
            settings,
            overrides: args.clone(),
        })
    }

    /// Resolve a stage command line in priority order: CLI flag, settings
    /// file, then environment variable.
    pub fn stage_command(&self, stage: Stage) -> Result<Vec<String>> {
        let flag = match stage {
            Stage::Extract => self.overrides.extract_cmd.as_deref(),
            Stage::Train => self.overrides.train_cmd.as_deref(),
            Stage::Eval => self.overrides.eval_cmd.as_deref(),
        };
        let from_settings = match stage {
            Stage::Extract => self.settings.extract_command.as_deref(),
            Stage::Train => self.settings.train_command.as_deref(),
            Stage::Eval => self.settings.eval_command.as_deref(),
        };
        let from_env = env::var(stage.env_var()).ok();
        let command = flag
            .or(from_settings)
            .or(from_env.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "no {} command configured (use --{}-cmd, the settings file, or {})",
                    stage.as_str(),
                    stage.as_str(),
                    stage.env_var()
                )
            })?;
        let argv = shell_words::split(command)
            .with_context(|| format!("parse {} command: {command}", stage.as_str()))?;
        if argv.is_empty() {
            return Err(anyhow!("{} command is empty", stage.as_str()));
        }
        Ok(argv)
    }
}

/// Load settings from an explicit path, `$ELK_CONFIG`, or the default
/// location. Only a missing *default* file falls back to defaults.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
            Some(path) => (PathBuf::from(path), true),
            None => match dirs::config_dir() {
                Some(dir) => (dir.join("elk").join("config.json"), false),
                None => return Ok(Settings::default()),
            },
        },
    };
    if !path.is_file() {
        if required {
            return Err(anyhow!("settings file not found: {}", path.display()));
        }
        return Ok(Settings::default());
    }
    let bytes = fs::read(&path).with_context(|| format!("read settings {}", path.display()))?;
    let settings: Settings = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse settings JSON {}", path.display()))?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.schema_version != SETTINGS_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported settings schema_version {} (expected {})",
            settings.schema_version,
            SETTINGS_SCHEMA_VERSION
        ));
    }
    Ok(())
}

fn default_data_root(base: Option<PathBuf>) -> Result<PathBuf> {
    let base = base
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow!("cannot determine cache directory; set ELK_DIR"))?;
    Ok(base.join("elk"))
}
