// src/runtime/mod.rs
//! Worker process runtime
//!
//! This module owns everything about a single worker process:
//!
//! - **Process Manager**: spawning with the fd 3 / fd 4 layout, signalling, reaping
//! - **Sandbox**: launch policy for dedicated workers and the child-pid side channel
//! - **Worker Process**: lifecycle of one worker slot (start, ready, kill, restart)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── WorkerProcess ─────────────────────────────┐
//! │                                                                        │
//! │   start() ──▶ Launcher::launch ──▶ ChildProcess ◀── watcher task       │
//! │                     │                                 (wait / signal)  │
//! │                     ▼                                                  │
//! │              ProcessChannel (fd 4) ◀── reader task ──▶ ChannelTransport │
//! │                                                              │         │
//! │                                                           RpcPeer      │
//! │   kill() ──▶ {type:'exit'} or SIGTERM ──▶ watchdog ──▶ SIGKILL         │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod process_manager;
pub mod sandbox;
pub mod worker_process;

#[cfg(test)]
pub mod testing;

pub use process_manager::{ChildProcess, LaunchMode, LaunchSpec, Launched, Launcher, ProcessManager};
pub use worker_process::{
    ListenerId, WorkerContext, WorkerEvent, WorkerId, WorkerProcess, WorkerState,
};
