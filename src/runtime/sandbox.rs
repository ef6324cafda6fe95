// src/runtime/sandbox.rs
//! Sandbox policy for dedicated workers
//!
//! Dedicated workers run under an external sandbox executable unless the
//! sandbox is disabled in configuration. The sandbox starts the runtime as
//! PID 1 of a fresh PID namespace. Two consequences for the supervisor:
//!
//! - The namespaced worker ignores SIGTERM (PID 1 has no default handlers),
//!   so a graceful shutdown is requested over the process channel instead.
//! - SIGKILL must be aimed at the worker's pid as seen from outside the
//!   namespace. The sandbox reports it once on fd 3 as `{"child-pid": N}`.
//!
//! Isolation itself (mounts, seccomp, cgroups) belongs to the sandbox
//! executable.

use crate::utils::config::WorkerConfig;
use crate::utils::errors::{FleetError, Result};
use serde::Deserialize;
use std::os::unix::net::UnixStream as StdUnixStream;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tracing::debug;

/// Upper bound on what the sandbox may write to the info pipe
const MAX_INFO_LEN: u64 = 4096;

/// Whether dedicated workers go through the sandbox
pub fn is_enabled(config: &WorkerConfig) -> bool {
    !config.disable_sandbox
}

#[derive(Debug, Deserialize)]
struct ChildInfo {
    #[serde(rename = "child-pid")]
    child_pid: u32,
}

/// Read the sandbox's one-shot report until the pipe closes
///
/// Returns `None` if the sandbox closed the pipe without writing anything.
pub async fn read_child_pid(pipe: StdUnixStream) -> Result<Option<u32>> {
    pipe.set_nonblocking(true)?;
    let pipe = UnixStream::from_std(pipe)?;

    let mut buf = String::new();
    pipe.take(MAX_INFO_LEN).read_to_string(&mut buf).await?;
    if buf.trim().is_empty() {
        return Ok(None);
    }

    let info: ChildInfo = serde_json::from_str(buf.trim())
        .map_err(|e| FleetError::ProtocolError(format!("bad sandbox info {:?}: {}", buf, e)))?;
    debug!("Sandbox reported child pid {}", info.child_pid);
    Ok(Some(info.child_pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_enabled_by_default() {
        let mut config = WorkerConfig::default();
        assert!(is_enabled(&config));
        config.disable_sandbox = true;
        assert!(!is_enabled(&config));
    }

    #[tokio::test]
    async fn test_read_child_pid() {
        let (ours, mut theirs) = StdUnixStream::pair().unwrap();
        theirs.write_all(b"{\"child-pid\": 4242}").unwrap();
        drop(theirs);

        assert_eq!(read_child_pid(ours).await.unwrap(), Some(4242));
    }

    #[tokio::test]
    async fn test_empty_and_bad_reports() {
        let (ours, theirs) = StdUnixStream::pair().unwrap();
        drop(theirs);
        assert_eq!(read_child_pid(ours).await.unwrap(), None);

        let (ours, mut theirs) = StdUnixStream::pair().unwrap();
        theirs.write_all(b"garbage").unwrap();
        drop(theirs);
        assert!(read_child_pid(ours).await.is_err());
    }
}
