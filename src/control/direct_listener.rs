// src/control/direct_listener.rs
//! Direct listener
//!
//! Hands client connections straight to the worker hosting their tenant.
//! After `{control:'init', target, replyId}` the socket itself is passed to
//! the worker over its process channel; the supervisor drops its own copy
//! without shutting the connection down. Clients must wait for the worker
//! before writing anything past the init line; a connection with buffered
//! bytes is rejected since they would never reach the worker.

use crate::control::listener::{serve, BoundListener, ListenerHandle};
use crate::fleet::supervisor::FleetSupervisor;
use crate::ipc::framed::{BoxConnection, JsonFramed};
use crate::ipc::message::{ControlMessage, ErrorReply};
use crate::utils::errors::FleetError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct DirectListener {
    supervisor: Arc<FleetSupervisor>,
}

impl DirectListener {
    pub fn new(supervisor: Arc<FleetSupervisor>) -> Arc<Self> {
        Arc::new(Self { supervisor })
    }

    pub fn start(self: &Arc<Self>, listener: BoundListener) -> ListenerHandle {
        let this = self.clone();
        serve("Direct", listener, move |conn, cancel| {
            this.clone().handle(conn, cancel)
        })
    }

    async fn handle(self: Arc<Self>, conn: BoxConnection, cancel: CancellationToken) {
        let mut framed = JsonFramed::new(conn);
        let init = tokio::select! {
            _ = cancel.cancelled() => return,
            init = framed.read::<ControlMessage>() => init,
        };

        let failure = match init {
            None => return,
            Some(Ok(ControlMessage::Init { .. })) if framed.has_buffered_input() => {
                ErrorReply::from(&FleetError::ProtocolError(
                    "unexpected data after initialization message".into(),
                ))
            }
            Some(Ok(ControlMessage::Init { target, reply_id })) => {
                match self
                    .supervisor
                    .send_socket(target, reply_id, framed.raw_fd())
                    .await
                {
                    Ok(()) => {
                        debug!("Handed direct connection to the worker of user {}", target);
                        // dropping only closes our descriptor; the worker owns the socket now
                        return;
                    }
                    Err(e) => ErrorReply::from(&e),
                }
            }
            Some(Ok(_)) => ErrorReply::new("invalid initialization message"),
            Some(Err(e)) => ErrorReply::from(&e),
        };

        warn!("Rejecting direct connection: {}", failure.error);
        if let Err(e) = framed.write(&failure).await {
            debug!("Failed to report direct connection error: {}", e);
        }
        let _ = framed.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::listener::ListenAddress;
    use crate::fleet::tenant::{tenant, MemoryTenantStore};
    use crate::ipc::message::ChannelMessage;
    use crate::runtime::testing::{wait_until, FakeLauncher};
    use crate::utils::config::FleetConfig;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    async fn harness() -> (
        tempfile::TempDir,
        Arc<FakeLauncher>,
        Arc<FleetSupervisor>,
        ListenerHandle,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FleetConfig::default();
        config.supervisor.pool_size = Some(1);
        config.supervisor.kill_timeout_ms = 500;
        config.supervisor.data_dir = dir.path().join("data");

        let launcher = Arc::new(FakeLauncher::new());
        let mut dedicated = tenant(6);
        dedicated.developer_key = Some("dev-6".into());
        let store = Arc::new(MemoryTenantStore::new(vec![tenant(1), dedicated]));
        let supervisor = FleetSupervisor::new(&config, launcher.clone(), store);
        supervisor.start().await.unwrap();

        let listener = BoundListener::bind(&ListenAddress::Unix(dir.path().join("direct.sock")))
            .await
            .unwrap();
        let handle = DirectListener::new(supervisor.clone()).start(listener);
        (dir, launcher, supervisor, handle)
    }

    async fn connect(dir: &tempfile::TempDir) -> JsonFramed {
        let stream = UnixStream::connect(dir.path().join("direct.sock"))
            .await
            .unwrap();
        JsonFramed::new(Box::new(stream))
    }

    #[tokio::test]
    async fn test_hand_off() {
        let (dir, launcher, supervisor, handle) = harness().await;

        for (target, worker) in [(6, "6"), (1, "0/S0")] {
            let mut conn = connect(&dir).await;
            conn.write(&ControlMessage::Init {
                target,
                reply_id: json!(target * 10),
            })
            .await
            .unwrap();

            let fake = launcher.worker(worker).unwrap();
            let expected = ChannelMessage::Direct {
                target,
                reply_id: json!(target * 10),
            };
            wait_until(|| fake.received().contains(&expected)).await;
        }

        handle.stop().await;
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let (dir, _launcher, supervisor, handle) = harness().await;

        let mut conn = connect(&dir).await;
        conn.write(&ControlMessage::Init {
            target: 77,
            reply_id: json!(1),
        })
        .await
        .unwrap();
        let reply: ErrorReply = conn.read().await.unwrap().unwrap();
        assert_eq!(reply.error, "Invalid user ID 77");
        assert_eq!(reply.code.as_deref(), Some("E_INVALID_USER"));
        assert!(conn.read_value().await.is_none());

        handle.stop().await;
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_bad_initialization() {
        let (dir, _launcher, supervisor, handle) = harness().await;

        let mut conn = connect(&dir).await;
        conn.write(&json!({"control": "ready", "rpcId": 1})).await.unwrap();
        let reply: ErrorReply = conn.read().await.unwrap().unwrap();
        assert_eq!(reply.error, "invalid initialization message");

        let mut garbage = connect(&dir).await;
        garbage.write(&json!({"hello": "world"})).await.unwrap();
        let reply: ErrorReply = garbage.read().await.unwrap().unwrap();
        assert_eq!(reply.code.as_deref(), Some("E_PROTOCOL"));

        handle.stop().await;
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_data_after_init_is_rejected() {
        let (dir, launcher, supervisor, handle) = harness().await;

        let mut stream = UnixStream::connect(dir.path().join("direct.sock"))
            .await
            .unwrap();
        stream
            .write_all(b"{\"control\":\"init\",\"target\":6,\"replyId\":1}\n{\"early\":true}\n")
            .await
            .unwrap();
        let mut conn = JsonFramed::new(Box::new(stream));
        let reply: ErrorReply = conn.read().await.unwrap().unwrap();
        assert_eq!(reply.code.as_deref(), Some("E_PROTOCOL"));
        assert!(reply.error.contains("unexpected data"), "{}", reply.error);

        let fake = launcher.worker("6").unwrap();
        assert!(!fake
            .received()
            .iter()
            .any(|m| matches!(m, ChannelMessage::Direct { .. })));

        handle.stop().await;
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_killed_tenant_is_unknown() {
        let (dir, _launcher, supervisor, handle) = harness().await;
        supervisor.kill_user(6).await.unwrap();

        // killed administratively: the session is gone entirely
        let mut conn = connect(&dir).await;
        conn.write(&ControlMessage::Init {
            target: 6,
            reply_id: json!(1),
        })
        .await
        .unwrap();
        let reply: ErrorReply = conn.read().await.unwrap().unwrap();
        assert_eq!(reply.code.as_deref(), Some("E_INVALID_USER"));

        handle.stop().await;
        supervisor.stop().await;
    }
}
