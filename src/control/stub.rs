// src/control/stub.rs
//! Supervisor surface published to control clients
//!
//! Every method takes the tenant id as its first parameter, except
//! `killAllUsers` which takes none.

use crate::fleet::supervisor::FleetSupervisor;
use crate::fleet::tenant::TenantId;
use crate::ipc::rpc::RpcStub;
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct SupervisorStub {
    supervisor: Arc<FleetSupervisor>,
}

impl SupervisorStub {
    pub fn new(supervisor: Arc<FleetSupervisor>) -> Self {
        Self { supervisor }
    }
}

fn tenant_param(method: &str, params: &[Value]) -> Result<TenantId> {
    params.first().and_then(Value::as_i64).ok_or_else(|| {
        FleetError::ProtocolError(format!("{} expects a user id as its first argument", method))
    })
}

#[async_trait]
impl RpcStub for SupervisorStub {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        debug!("Control call {}({:?})", method, params);
        let sv = &self.supervisor;

        if method == "killAllUsers" {
            return Ok(Value::Bool(sv.kill_all_users().await?));
        }

        let tenant = tenant_param(method, &params)?;
        match method {
            "isRunning" => Ok(Value::Bool(sv.is_running(tenant))),
            "getProcessId" => Ok(sv.get_process_id(tenant)),
            "startUser" => sv.start_user(tenant).await.map(|_| Value::Null),
            "killUser" => sv.kill_user(tenant).await.map(|_| Value::Null),
            "restartUser" => sv.restart_user(tenant).await.map(|_| Value::Null),
            "deleteUser" => sv.delete_user(tenant).await.map(|_| Value::Null),
            "clearCache" => sv.clear_cache(tenant).await.map(|_| Value::Null),
            "restartUserWithoutCache" => sv
                .restart_user_without_cache(tenant)
                .await
                .map(|_| Value::Null),
            other => Err(FleetError::RpcError(format!("no such method {}", other))),
        }
    }
}
