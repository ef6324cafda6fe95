// src/ipc/message.rs
//! Wire messages
//!
//! Two families share the newline-delimited JSON framing:
//!
//! - [`ChannelMessage`]: supervisor ⇄ worker, on the worker's fd 4, tagged by `type`
//! - [`ControlMessage`] / [`ErrorReply`]: external clients ⇄ listeners, tagged by `control`

use crate::fleet::tenant::TenantId;
use crate::utils::errors::FleetError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Process channel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Worker → supervisor: engine factory is published under `id`
    Ready { id: Value },

    /// Either direction: opaque RPC payload
    Rpc { data: Value },

    /// Supervisor → sandboxed worker: shut down gracefully
    Exit,

    /// Supervisor → worker: the attached socket is a direct connection for `target`
    Direct {
        target: TenantId,
        #[serde(rename = "replyId")]
        reply_id: Value,
    },
}

/// Control-plane message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client → control listener: present the shared token
    Auth { token: String },

    /// Control listener → client: supervisor stub is published under `rpcId`
    Ready {
        #[serde(rename = "rpcId")]
        rpc_id: Value,
    },

    /// Client → direct listener: hand this connection to `target`'s worker
    Init {
        target: TenantId,
        #[serde(rename = "replyId")]
        reply_id: Value,
    },
}

/// Failure reply written just before a listener closes a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }
}

impl From<&FleetError> for ErrorReply {
    fn from(e: &FleetError) -> Self {
        Self {
            error: e.to_string(),
            code: Some(e.code().to_string()),
        }
    }
}
