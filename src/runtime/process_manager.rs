// src/runtime/process_manager.rs
//! Process manager for spawning and signalling worker processes
//!
//! Supports three launch modes:
//! - Shared: pool member, `<runtime> <entrypoint> --shared`, stdout discarded
//! - Direct: dedicated worker without the sandbox, stdout/stderr inherited
//! - Sandboxed: dedicated worker wrapped by the sandbox executable
//!
//! Every worker gets the same descriptor layout:
//!
//! ```text
//!   fd 0  /dev/null
//!   fd 1  inherited (shared: /dev/null)
//!   fd 2  inherited
//!   fd 3  info pipe (sandboxed only; reports {"child-pid": N})
//!   fd 4  process channel (newline-delimited JSON, SCM_RIGHTS)
//! ```
//!
//! Workers run in their own process group so a terminal ^C reaches only the
//! supervisor, which then shuts them down in order.

use crate::runtime::sandbox;
use crate::utils::config::WorkerConfig;
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Variable carrying the worker id into the worker's environment
pub const WORKER_ID_ENV: &str = "ENGINE_TENANT_ID";

/// Descriptor the sandbox reports the namespaced child pid on
pub const INFO_FD: RawFd = 3;

/// Descriptor of the process channel
pub const CHANNEL_FD: RawFd = 4;

/// Child-side descriptors are parked at or above this before being moved
/// onto [`INFO_FD`] / [`CHANNEL_FD`]
const PARKED_FD_MIN: RawFd = 10;

/// How a worker is launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Shared,
    Direct,
    Sandboxed,
}

impl LaunchMode {
    /// Mode for a worker given its sharing and the sandbox switch
    pub fn select(shared: bool, config: &WorkerConfig) -> Self {
        if shared {
            LaunchMode::Shared
        } else if sandbox::is_enabled(config) {
            LaunchMode::Sandboxed
        } else {
            LaunchMode::Direct
        }
    }
}

/// Everything needed to spawn one worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Worker id, for logs and the environment
    pub id: String,

    pub mode: LaunchMode,

    /// Executable
    pub program: PathBuf,

    pub args: Vec<String>,

    /// Working directory (must exist)
    pub work_dir: PathBuf,

    /// Complete environment; nothing else is inherited
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Build the command line and environment for a worker
    pub fn for_worker(
        config: &WorkerConfig,
        mode: LaunchMode,
        id: impl Into<String>,
        work_dir: PathBuf,
    ) -> Self {
        let id = id.into();
        let entrypoint = config.entrypoint.to_string_lossy().into_owned();

        let mut args: Vec<String> = Vec::new();
        let program = match mode {
            LaunchMode::Shared | LaunchMode::Direct => config.runtime.clone(),
            LaunchMode::Sandboxed => {
                args.push(config.runtime.to_string_lossy().into_owned());
                config.sandbox.clone()
            }
        };
        args.extend(config.runtime_args.iter().cloned());
        args.push(entrypoint);
        if mode == LaunchMode::Shared {
            args.push("--shared".to_string());
        }
        args.extend(config.worker_args.iter().cloned());

        let env = filter_env(&config.env_allowlist, std::env::vars(), &id);

        Self {
            id,
            mode,
            program,
            args,
            work_dir,
            env,
        }
    }
}

/// Allow-listed variables plus every `LC_*`, plus the worker id
pub fn filter_env(
    allowlist: &[String],
    vars: impl IntoIterator<Item = (String, String)>,
    worker_id: &str,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(name, _)| name.starts_with("LC_") || allowlist.iter().any(|a| a == name))
        .filter(|(name, _)| name != WORKER_ID_ENV)
        .collect();
    env.push((WORKER_ID_ENV.to_string(), worker_id.to_string()));
    env
}

/// A spawned worker as seen by the supervisor
pub struct Launched {
    /// OS pid (outside any sandbox namespace)
    pub pid: u32,

    /// Supervisor end of the process channel
    pub channel: StdUnixStream,

    /// Read end of the info pipe (sandboxed only)
    pub info_pipe: Option<StdUnixStream>,

    pub child: Box<dyn ChildProcess>,
}

/// Handle used to signal and reap a spawned worker
#[async_trait]
pub trait ChildProcess: Send + 'static {
    fn id(&self) -> u32;

    /// Signal the spawned process itself
    fn signal(&mut self, signal: Signal) -> Result<()>;

    /// Signal another process on the worker's behalf (the sandboxed child)
    fn signal_pid(&mut self, pid: u32, signal: Signal) -> Result<()> {
        kill(Pid::from_raw(pid as i32), signal)?;
        Ok(())
    }

    /// Wait for exit and return the exit code (`None` if killed by a signal)
    ///
    /// Must be cancel-safe.
    async fn wait(&mut self) -> Result<Option<i32>>;
}

/// Spawns worker processes
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: LaunchSpec) -> Result<Launched>;
}

/// Launcher backed by real OS processes
#[derive(Debug, Default)]
pub struct ProcessManager;

impl ProcessManager {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for ProcessManager {
    fn launch(&self, spec: LaunchSpec) -> Result<Launched> {
        debug!(
            "Spawning {:?} worker {}: {:?} {:?}",
            spec.mode, spec.id, spec.program, spec.args
        );

        let (channel, child_channel) = StdUnixStream::pair()?;
        let child_channel = park_fd(&child_channel)?;

        let (info_pipe, child_info) = if spec.mode == LaunchMode::Sandboxed {
            let (ours, theirs) = StdUnixStream::pair()?;
            (Some(ours), Some(park_fd(&theirs)?))
        } else {
            (None, None)
        };

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.work_dir)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(if spec.mode == LaunchMode::Shared {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .stderr(Stdio::inherit())
            .process_group(0);

        let channel_raw = child_channel.as_raw_fd();
        let info_raw = child_info.as_ref().map(|fd| fd.as_raw_fd());
        // SAFETY: only async-signal-safe calls (dup2) run between fork and exec
        unsafe {
            command.pre_exec(move || {
                if let Some(fd) = info_raw {
                    if libc::dup2(fd, INFO_FD) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if libc::dup2(channel_raw, CHANNEL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            FleetError::ProcessSpawnFailed(format!(
                "Failed to spawn {:?} for {}: {}",
                spec.program, spec.id, e
            ))
        })?;

        // the child holds its own copies now
        drop(child_channel);
        drop(child_info);

        let pid = child.id().ok_or_else(|| {
            FleetError::ProcessSpawnFailed(format!("Worker {} exited during spawn", spec.id))
        })?;
        info!("Spawned worker {} with PID {}", spec.id, pid);

        Ok(Launched {
            pid,
            channel,
            info_pipe,
            child: Box::new(OsChild { pid, child }),
        })
    }
}

/// Duplicate `fd` to a close-on-exec descriptor above the fixed child slots
fn park_fd(fd: &impl AsRawFd) -> Result<OwnedFd> {
    let parked = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(PARKED_FD_MIN))?;
    // SAFETY: fcntl just returned a fresh descriptor we exclusively own
    Ok(unsafe { OwnedFd::from_raw_fd(parked) })
}

struct OsChild {
    pid: u32,
    child: Child,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn id(&self) -> u32 {
        self.pid
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        kill(Pid::from_raw(self.pid as i32), signal)?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}
