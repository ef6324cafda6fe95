// src/control/mod.rs
//! Control-plane endpoints
//!
//! - **Control listener**: RPC access to the supervisor's lifecycle surface
//! - **Direct listener**: socket hand-off to the worker hosting a tenant
//!
//! Both accept TCP or Unix-socket connections and speak newline-delimited
//! JSON.

pub mod control_listener;
pub mod direct_listener;
pub mod listener;
pub mod stub;

pub use control_listener::ControlListener;
pub use direct_listener::DirectListener;
pub use listener::{BoundListener, ListenAddress, ListenerHandle};
pub use stub::SupervisorStub;
