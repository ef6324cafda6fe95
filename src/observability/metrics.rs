// src/observability/metrics.rs
//! Metric names and recording helpers

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

pub const WORKERS_SPAWNED: &str = "fleet_workers_spawned_total";
pub const WORKERS_EXITED: &str = "fleet_workers_exited_total";
pub const WORKERS_KILLED: &str = "fleet_workers_killed_total";
pub const KILL_TIMEOUTS: &str = "fleet_kill_timeouts_total";
pub const TENANT_RESTARTS: &str = "fleet_tenant_restarts_total";
pub const POOL_SIZE: &str = "fleet_pool_size";
pub const SESSIONS: &str = "fleet_sessions";

/// Register descriptions with the installed recorder
pub fn describe() {
    describe_counter!(WORKERS_SPAWNED, "Worker processes spawned");
    describe_counter!(WORKERS_EXITED, "Worker processes that exited");
    describe_counter!(WORKERS_KILLED, "Worker kill requests");
    describe_counter!(KILL_TIMEOUTS, "Workers force-killed by the watchdog");
    describe_counter!(TENANT_RESTARTS, "Tenants rescheduled after a worker crash");
    describe_gauge!(POOL_SIZE, "Shared pool size");
    describe_gauge!(SESSIONS, "Tenant sessions currently bound");
}

pub fn worker_spawned(shared: bool) {
    counter!(WORKERS_SPAWNED, "shared" => shared.to_string()).increment(1);
}

pub fn worker_exited(shared: bool) {
    counter!(WORKERS_EXITED, "shared" => shared.to_string()).increment(1);
}

pub fn worker_killed() {
    counter!(WORKERS_KILLED).increment(1);
}

pub fn kill_timeout() {
    counter!(KILL_TIMEOUTS).increment(1);
}

pub fn tenant_restart_scheduled() {
    counter!(TENANT_RESTARTS).increment(1);
}

pub fn pool_size(size: usize) {
    gauge!(POOL_SIZE).set(size as f64);
}

pub fn sessions(count: usize) {
    gauge!(SESSIONS).set(count as f64);
}
