//! Control connection between the local side and the in-cluster agent
//!
//! A single TCP connection carries every call. Unary requests get one reply
//! with the same id; `Run*` requests get a stream of `Block` replies closed by
//! `End` or `Failed`.

pub mod client;
pub mod codec;
pub mod server;

pub use client::RpcConnection;
pub use codec::{Frame, FrameCodec};
pub use server::serve_connection;
