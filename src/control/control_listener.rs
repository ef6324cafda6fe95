// src/control/control_listener.rs
//! Control listener
//!
//! Publishes the supervisor's lifecycle surface over RPC.
//!
//! ```text
//! client                                  listener
//!   │ {control:'auth', token}   ──▶  (only when a token is configured)
//!   │                           ◀──  {control:'ready', rpcId}
//!   │ {kind:'call', obj: rpcId, method:'startUser', params:[17]} ──▶
//!   │                           ◀──  {kind:'reply', id, result}
//! ```

use crate::control::listener::{serve, BoundListener, ListenerHandle};
use crate::control::stub::SupervisorStub;
use crate::fleet::supervisor::FleetSupervisor;
use crate::ipc::framed::{BoxConnection, JsonFramed};
use crate::ipc::message::{ControlMessage, ErrorReply};
use crate::ipc::rpc::RpcPeer;
use crate::ipc::transport::MessageSink;
use crate::utils::errors::FleetError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ControlListener {
    supervisor: Arc<FleetSupervisor>,

    /// Token clients must present first; `None` disables authentication
    auth_token: Option<String>,

    next_connection: AtomicU64,
}

impl ControlListener {
    pub fn new(supervisor: Arc<FleetSupervisor>, auth_token: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            auth_token,
            next_connection: AtomicU64::new(1),
        })
    }

    /// Start accepting control connections on `listener`
    pub fn start(self: &Arc<Self>, listener: BoundListener) -> ListenerHandle {
        let this = self.clone();
        serve("Control", listener, move |conn, cancel| {
            this.clone().handle(conn, cancel)
        })
    }

    async fn handle(self: Arc<Self>, conn: BoxConnection, cancel: CancellationToken) {
        let name = format!(
            "control#{}",
            self.next_connection.fetch_add(1, Ordering::Relaxed)
        );
        let mut framed = JsonFramed::new(conn);

        if let Some(expected) = &self.auth_token {
            let first = tokio::select! {
                _ = cancel.cancelled() => return,
                first = framed.read::<ControlMessage>() => first,
            };
            let reason = match first {
                None => return,
                Some(Ok(ControlMessage::Auth { token })) if &token == expected => None,
                Some(Ok(ControlMessage::Auth { .. })) => Some("invalid authentication token"),
                Some(Ok(_)) | Some(Err(_)) => Some("expected authentication"),
            };
            if let Some(reason) = reason {
                warn!("Rejecting {}: {}", name, reason);
                let failure = FleetError::AuthenticationFailed(reason.to_string());
                let _ = framed.write(&ErrorReply::from(&failure)).await;
                let _ = framed.close().await;
                return;
            }
        }

        let (sink, stream) = framed.into_transport();
        let sink = Arc::new(sink);
        let rpc = RpcPeer::spawn(name.clone(), sink.clone(), stream);
        let rpc_id = rpc.add_stub(Arc::new(SupervisorStub::new(self.supervisor.clone())));

        let ready = serde_json::to_value(ControlMessage::Ready { rpc_id });
        let sent = match ready {
            Ok(ready) => sink.send_message(ready).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!("Failed to announce control stub on {}: {}", name, e);
            rpc.close();
            return;
        }
        info!("Control connection {} ready", name);

        tokio::select! {
            _ = cancel.cancelled() => debug!("Closing control connection {}", name),
            _ = rpc.closed() => debug!("Control connection {} closed by peer", name),
        }
        rpc.close();
        let _ = sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::listener::ListenAddress;
    use crate::fleet::tenant::{tenant, MemoryTenantStore};
    use crate::runtime::testing::FakeLauncher;
    use crate::utils::config::FleetConfig;
    use serde_json::{json, Value};
    use tokio::net::UnixStream;

    struct Harness {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
        supervisor: Arc<FleetSupervisor>,
        handle: ListenerHandle,
    }

    async fn harness(auth_token: Option<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FleetConfig::default();
        config.supervisor.pool_size = Some(2);
        config.supervisor.kill_timeout_ms = 500;
        config.supervisor.data_dir = dir.path().join("data");

        let mut dedicated = tenant(6);
        dedicated.developer_key = Some("dev-6".into());
        let store = Arc::new(MemoryTenantStore::new(vec![tenant(1), tenant(2), dedicated]));
        let supervisor = FleetSupervisor::new(&config, Arc::new(FakeLauncher::new()), store);
        supervisor.start().await.unwrap();

        let path = dir.path().join("control.sock");
        let listener = BoundListener::bind(&ListenAddress::Unix(path.clone()))
            .await
            .unwrap();
        let handle = ControlListener::new(supervisor.clone(), auth_token.map(String::from))
            .start(listener);
        Harness {
            _dir: dir,
            path,
            supervisor,
            handle,
        }
    }

    async fn read_ready(framed: &mut JsonFramed) -> Option<Value> {
        match framed.read::<ControlMessage>().await? {
            Ok(ControlMessage::Ready { rpc_id }) => Some(rpc_id),
            _ => None,
        }
    }

    async fn connect(path: &std::path::Path) -> JsonFramed {
        JsonFramed::new(Box::new(UnixStream::connect(path).await.unwrap()))
    }

    async fn client(framed: JsonFramed) -> Arc<RpcPeer> {
        let (sink, stream) = framed.into_transport();
        RpcPeer::spawn("test client", Arc::new(sink), stream)
    }

    #[tokio::test]
    async fn test_lifecycle_over_rpc() {
        let h = harness(None).await;
        let mut framed = connect(&h.path).await;
        let stub = read_ready(&mut framed).await.unwrap();
        let rpc = client(framed).await;

        assert_eq!(rpc.call(&stub, "isRunning", vec![json!(1)]).await.unwrap(), json!(true));
        assert_eq!(
            rpc.call(&stub, "getProcessId", vec![json!(6)]).await.unwrap(),
            json!(6)
        );
        assert_eq!(
            rpc.call(&stub, "getProcessId", vec![json!(1)]).await.unwrap(),
            json!("0/S0")
        );

        rpc.call(&stub, "killUser", vec![json!(1)]).await.unwrap();
        assert_eq!(rpc.call(&stub, "isRunning", vec![json!(1)]).await.unwrap(), json!(false));
        rpc.call(&stub, "startUser", vec![json!(1)]).await.unwrap();
        assert!(h.supervisor.is_running(1));

        let err = rpc
            .call(&stub, "startUser", vec![json!(404)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"), "{}", err);

        assert!(matches!(
            rpc.call(&stub, "isRunning", vec![]).await,
            Err(FleetError::RpcError(_))
        ));
        assert!(rpc.call(&stub, "frobnicate", vec![json!(1)]).await.is_err());

        assert_eq!(rpc.call(&stub, "killAllUsers", vec![]).await.unwrap(), json!(true));
        assert_eq!(h.supervisor.session_count(), 0);

        h.handle.stop().await;
        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_authentication() {
        let h = harness(Some("s3cret")).await;

        let mut bad = connect(&h.path).await;
        bad.write(&ControlMessage::Auth {
            token: "guess".into(),
        })
        .await
        .unwrap();
        let reply: ErrorReply = bad.read().await.unwrap().unwrap();
        assert_eq!(
            reply.error,
            "Authentication failed: invalid authentication token"
        );
        assert_eq!(reply.code.as_deref(), Some("E_AUTH"));
        assert!(bad.read_value().await.is_none());

        let mut skipped = connect(&h.path).await;
        skipped
            .write(&json!({"kind": "call", "id": 1, "obj": "1", "method": "killAllUsers"}))
            .await
            .unwrap();
        let reply: ErrorReply = skipped.read().await.unwrap().unwrap();
        assert_eq!(reply.error, "Authentication failed: expected authentication");
        assert_eq!(reply.code.as_deref(), Some("E_AUTH"));

        let mut good = connect(&h.path).await;
        good.write(&ControlMessage::Auth {
            token: "s3cret".into(),
        })
        .await
        .unwrap();
        let stub = read_ready(&mut good).await.unwrap();
        let rpc = client(good).await;
        assert_eq!(rpc.call(&stub, "isRunning", vec![json!(2)]).await.unwrap(), json!(true));

        h.handle.stop().await;
        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let h = harness(None).await;
        let mut first = connect(&h.path).await;
        let mut second = connect(&h.path).await;
        assert!(read_ready(&mut first).await.is_some());
        assert!(read_ready(&mut second).await.is_some());

        h.handle.stop().await;
        assert!(first.read_value().await.is_none());
        assert!(second.read_value().await.is_none());
        h.supervisor.stop().await;
    }
}
