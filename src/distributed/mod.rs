//! Rank detection and the cross-process barrier.
//!
//! A launcher (torchrun or similar) starts one process per device and sets
//! `LOCAL_RANK`. When the variable is absent the process runs alone as rank 0
//! and every barrier is a no-op.
use crate::error::ElkError;
use anyhow::Result;
use std::env;
use std::time::Duration;

mod device;
mod group;

pub use device::{accelerator_present, resolve_device};
pub use group::TcpGroup;

const RANK_ENV: &str = "LOCAL_RANK";
const WORLD_SIZE_ENV: &str = "WORLD_SIZE";
const MASTER_ADDR_ENV: &str = "MASTER_ADDR";
const MASTER_PORT_ENV: &str = "MASTER_PORT";
const INIT_TIMEOUT_ENV: &str = "ELK_DIST_INIT_TIMEOUT_SECS";

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Collective group shared by every rank of a launch.
pub trait ProcessGroup: Send + Sync {
    /// Block until every rank in the group has called `barrier`.
    fn barrier(&self) -> Result<()>;
}

/// Where this process sits in the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedRank {
    pub rank: usize,
    pub world_size: usize,
    pub group_initialized: bool,
}

/// Rank plus the group used for barriers; built once per process.
pub struct DistributedContext {
    rank: DistributedRank,
    group: Option<Box<dyn ProcessGroup>>,
}

/// Launch parameters read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub init_timeout: Duration,
}

impl DistributedContext {
    /// Single-process context: rank 0 of 1, no group.
    pub fn single() -> Self {
        Self {
            rank: DistributedRank {
                rank: 0,
                world_size: 1,
                group_initialized: false,
            },
            group: None,
        }
    }

    /// Wrap an already initialized group.
    pub fn with_group(rank: usize, world_size: usize, group: Box<dyn ProcessGroup>) -> Self {
        Self {
            rank: DistributedRank {
                rank,
                world_size,
                group_initialized: true,
            },
            group: Some(group),
        }
    }

    /// Detect the launch mode from the process environment and join the
    /// group when one is expected.
    pub fn from_env() -> Result<Self> {
        let Some(launch) = parse_launch_env(|key| env::var(key).ok())? else {
            tracing::debug!("no {RANK_ENV}; running as a single process");
            return Ok(Self::single());
        };
        let addr = format!("{}:{}", launch.master_addr, launch.master_port);
        tracing::info!(
            rank = launch.rank,
            world_size = launch.world_size,
            addr = %addr,
            backend = "tcp",
            "initializing process group"
        );
        let group = TcpGroup::connect(launch.rank, launch.world_size, &addr, launch.init_timeout)
            .map_err(|err| ElkError::DistributedInit(format!("{err:#}")))?;
        Ok(Self::with_group(
            launch.rank,
            launch.world_size,
            Box::new(group),
        ))
    }

    pub fn current_rank(&self) -> usize {
        self.rank.rank
    }

    pub fn world_size(&self) -> usize {
        self.rank.world_size
    }

    pub fn is_root(&self) -> bool {
        self.rank.rank == 0
    }

    pub fn rank(&self) -> DistributedRank {
        self.rank
    }

    /// Wait for every rank; returns immediately without a group.
    pub fn barrier(&self) -> Result<()> {
        match &self.group {
            Some(group) => {
                tracing::debug!(rank = self.rank.rank, "entering barrier");
                group.barrier()?;
                tracing::debug!(rank = self.rank.rank, "left barrier");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Parse launch variables. `Ok(None)` means single-process mode.
pub fn parse_launch_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<LaunchEnv>> {
    let Some(rank_text) = lookup(RANK_ENV) else {
        return Ok(None);
    };
    let rank = parse_var::<usize>(RANK_ENV, &rank_text)?;
    let world_text = lookup(WORLD_SIZE_ENV).ok_or_else(|| {
        ElkError::DistributedInit(format!("{RANK_ENV} is set but {WORLD_SIZE_ENV} is not"))
    })?;
    let world_size = parse_var::<usize>(WORLD_SIZE_ENV, &world_text)?;
    if world_size == 0 {
        return Err(ElkError::DistributedInit(format!("{WORLD_SIZE_ENV} must be at least 1")).into());
    }
    if rank >= world_size {
        return Err(ElkError::DistributedInit(format!(
            "{RANK_ENV}={rank} is out of range for {WORLD_SIZE_ENV}={world_size}"
        ))
        .into());
    }
    let master_addr = lookup(MASTER_ADDR_ENV)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
    let master_port = match lookup(MASTER_PORT_ENV) {
        Some(text) => parse_var::<u16>(MASTER_PORT_ENV, &text)?,
        None => DEFAULT_MASTER_PORT,
    };
    let init_timeout = match lookup(INIT_TIMEOUT_ENV) {
        Some(text) => Duration::from_secs(parse_var::<u64>(INIT_TIMEOUT_ENV, &text)?),
        None => DEFAULT_INIT_TIMEOUT,
    };
    Ok(Some(LaunchEnv {
        rank,
        world_size,
        master_addr,
        master_port,
        init_timeout,
    }))
}

fn parse_var<T: std::str::FromStr>(key: &str, text: &str) -> Result<T> {
    text.trim()
        .parse::<T>()
        .map_err(|_| ElkError::DistributedInit(format!("invalid {key}={text:?}")).into())
}
