use anyhow::Result;
use clap::Parser;
use std::io;

mod cache;
mod cli;
mod config;
mod dispatch;
mod distributed;
mod elicit;
mod error;
mod layers;
mod logging;
mod output_gate;
mod run;
mod stages;
mod util;

use cli::RootArgs;
use config::ResolvedSettings;
use dispatch::{dispatch, CliRuntime};

fn main() -> Result<()> {
    let args = RootArgs::parse();
    let logs = logging::init(args.global.verbose)?;
    let settings = ResolvedSettings::resolve(&args.global)?;
    tracing::debug!(
        cache_dir = %util::display_path(&settings.cache_dir, None),
        "resolved settings"
    );
    let runtime = CliRuntime::new(settings, Some(logs));
    dispatch(&args.command, &runtime, &mut io::stdout())
}
