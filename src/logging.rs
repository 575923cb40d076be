//! Process-wide `tracing` setup.
//!
//! The filter sits behind a reload layer so individual targets can be
//! quieted after startup (non-root ranks silence the stage runner).
use anyhow::{anyhow, Context, Result};
use std::env;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

const LOG_ENV: &str = "ELK_LOG";

/// Handle for adjusting log filtering after the subscriber is installed.
pub struct LogHandle {
    base: String,
    handle: reload::Handle<EnvFilter, Registry>,
}

/// Install the stderr subscriber. `ELK_LOG` takes precedence over `verbose`.
pub fn init(verbose: bool) -> Result<LogHandle> {
    let base = env::var(LOG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());
    let filter = EnvFilter::try_new(&base).with_context(|| format!("parse {LOG_ENV}={base}"))?;
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()
        .map_err(|err| anyhow!("install log subscriber: {err}"))?;
    Ok(LogHandle { base, handle })
}

impl LogHandle {
    /// Raise `target` to error-only for the rest of the process.
    pub fn restrict_to_errors(&self, target: &str) -> Result<()> {
        let directives = error_only_directives(&self.base, target);
        let filter = EnvFilter::try_new(&directives)
            .with_context(|| format!("build log filter {directives}"))?;
        self.handle
            .reload(filter)
            .map_err(|err| anyhow!("reload log filter: {err}"))
    }
}

fn error_only_directives(base: &str, target: &str) -> String {
    format!("{base},{target}=error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_directive_is_appended_after_base() {
        let directives = error_only_directives("info,hyper=warn", "elk::stage");
        assert_eq!(directives, "info,hyper=warn,elk::stage=error");
        assert!(EnvFilter::try_new(&directives).is_ok());
    }
}
