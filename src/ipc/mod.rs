// src/ipc/mod.rs
//! Inter-process communication
//!
//! ```text
//!  control client ──JsonFramed──▶ RpcPeer ──▶ supervisor stub
//!
//!  supervisor ──RpcPeer──▶ ChannelTransport ──▶ ProcessChannel (fd 4) ──▶ worker
//! ```

pub mod channel;
pub mod framed;
pub mod message;
pub mod rpc;
pub mod transport;

pub use channel::{ChannelReader, ProcessChannel};
pub use framed::{BoxConnection, JsonFramed};
pub use message::{ChannelMessage, ControlMessage, ErrorReply};
pub use rpc::{RpcPeer, RpcStub};
pub use transport::{ChannelTransport, MessageSink, MessageStream};
