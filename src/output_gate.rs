//! Keep non-root ranks quiet.
//!
//! Every rank runs the same code, so without a gate each one would repeat
//! root's output. The stdout redirect is scoped to the gate's lifetime; the
//! log restriction lasts for the rest of the process.
use crate::distributed::DistributedContext;
use crate::logging::LogHandle;
use crate::stages;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Active while a run executes; dropping it restores stdout.
pub struct OutputGate {
    redirect: Option<FdRedirect>,
}

impl OutputGate {
    /// Enter the gate for this rank. Root passes through untouched.
    pub fn enter(ctx: &DistributedContext, logs: Option<&LogHandle>) -> Result<Self> {
        if ctx.is_root() {
            return Ok(Self { redirect: None });
        }
        if let Some(logs) = logs {
            logs.restrict_to_errors(stages::LOG_TARGET)?;
        }
        io::stdout().flush().context("flush stdout")?;
        let redirect = FdRedirect::to_null(io::stdout().as_raw_fd())
            .context("redirect stdout to /dev/null")?;
        tracing::debug!(rank = ctx.current_rank(), "stdout suppressed on non-root rank");
        Ok(Self {
            redirect: Some(redirect),
        })
    }

    pub fn is_suppressing(&self) -> bool {
        self.redirect.is_some()
    }
}

impl Drop for OutputGate {
    fn drop(&mut self) {
        if self.redirect.is_some() {
            let _ = io::stdout().flush();
        }
    }
}

/// Points `target` at `/dev/null` until dropped.
struct FdRedirect {
    target: RawFd,
    saved: OwnedFd,
}

impl FdRedirect {
    fn to_null(target: RawFd) -> io::Result<Self> {
        let null = OpenOptions::new().write(true).open("/dev/null")?;
        // SAFETY: `dup` has no memory-safety preconditions; the result is
        // checked before being wrapped.
        let saved = unsafe { libc::dup(target) };
        if saved < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `saved` is a freshly duplicated descriptor owned by nobody else.
        let saved = unsafe { OwnedFd::from_raw_fd(saved) };
        // SAFETY: both descriptors are open for the duration of the call.
        if unsafe { libc::dup2(null.as_raw_fd(), target) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { target, saved })
    }
}

impl Drop for FdRedirect {
    fn drop(&mut self) {
        // SAFETY: `saved` stays open until this struct is gone.
        unsafe {
            libc::dup2(self.saved.as_raw_fd(), self.target);
        }
    }
}

/// Run `body` with `file`'s descriptor redirected, for tests that cannot
/// touch the real stdout.
#[cfg(test)]
fn with_redirect<T>(file: &std::fs::File, body: impl FnOnce() -> T) -> io::Result<T> {
    let redirect = FdRedirect::to_null(file.as_raw_fd())?;
    let result = body();
    drop(redirect);
    Ok(result)
}
