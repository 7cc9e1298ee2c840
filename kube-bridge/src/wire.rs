//! Wire model shared by the tunnel client and the in-cluster endpoint

use crate::{Error, StreamId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Lifecycle marker carried by every [`StreamBlock`].
///
/// Only the three values below are legal on the wire; anything else is a
/// protocol error and fails deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum StreamFlag {
    Connected = 1,
    Data = 2,
    Closed = 3,
}

impl TryFrom<i32> for StreamFlag {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StreamFlag::Connected),
            2 => Ok(StreamFlag::Data),
            3 => Ok(StreamFlag::Closed),
            other => Err(Error::Protocol(format!("unknown stream flag {}", other))),
        }
    }
}

impl From<StreamFlag> for i32 {
    fn from(flag: StreamFlag) -> Self {
        flag as i32
    }
}

impl std::fmt::Display for StreamFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamFlag::Connected => "Connected",
            StreamFlag::Data => "Data",
            StreamFlag::Closed => "Closed",
        };
        write!(f, "{}({})", name, *self as i32)
    }
}

/// The unit carried over the tunnel for one stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBlock {
    pub stream_id: StreamId,
    pub flag: StreamFlag,
    pub content: Option<Bytes>,
}

impl StreamBlock {
    pub fn connected(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            flag: StreamFlag::Connected,
            content: None,
        }
    }

    pub fn data(stream_id: StreamId, content: Bytes) -> Self {
        Self {
            stream_id,
            flag: StreamFlag::Data,
            content: Some(content),
        }
    }

    pub fn closed(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            flag: StreamFlag::Closed,
            content: None,
        }
    }
}

/// Arguments of `RunReversePortForward`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardStartInfo {
    /// Port the agent listens on inside the pod
    pub port: u16,

    /// Port of the local process the streams end up at
    #[serde(default)]
    pub local_port: Option<u16>,

    /// Path prefixes of HTTP health probes answered by the agent itself
    #[serde(default)]
    pub http_probes: Vec<String>,
}

/// Control channel methods.
///
/// Byte content of the `Send*` requests travels as the frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Reset,
    RunReversePortForward(PortForwardStartInfo),
    SendReversePortForwardData {
        port: u16,
        stream_id: StreamId,
    },
    StopReversePortForward {
        port: u16,
        stream_id: StreamId,
    },
    RunServicePortForward {
        service_dns: String,
        port: u16,
    },
    SendServicePortForwardData {
        service_dns: String,
        port: u16,
        stream_id: StreamId,
    },
    StopServicePortForward {
        service_dns: String,
        port: u16,
        stream_id: StreamId,
    },
}

impl Request {
    /// Methods answered by a stream of `Block` replies instead of a single reply.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Request::RunReversePortForward(_) | Request::RunServicePortForward { .. }
        )
    }
}

/// Replies sent by the agent, correlated to a request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    /// Result of a `Send*` call; `false` means no connector for the target.
    Sent { accepted: bool },
    /// One stream event; Data content travels as the frame payload.
    Block { stream_id: StreamId, flag: StreamFlag },
    /// Terminates the reply stream of a `Run*` request.
    End,
    Failed { message: String },
}

/// Frame header: every request and reply carries the id of the call it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Request { id: u64, request: Request },
    Reply { id: u64, reply: Reply },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_use_fixed_integer_values() {
        assert_eq!(serde_json::to_string(&StreamFlag::Connected).unwrap(), "1");
        assert_eq!(serde_json::to_string(&StreamFlag::Data).unwrap(), "2");
        assert_eq!(serde_json::to_string(&StreamFlag::Closed).unwrap(), "3");
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(serde_json::from_str::<StreamFlag>("0").is_err());
        assert!(serde_json::from_str::<StreamFlag>("4").is_err());
        assert!(matches!(StreamFlag::try_from(7), Err(Error::Protocol(_))));
    }

    #[test]
    fn block_reply_with_bad_flag_fails_to_decode() {
        let raw = r#"{"id":3,"reply":{"reply":"block","stream_id":1,"flag":9}}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn envelope_distinguishes_requests_from_replies() {
        let raw = r#"{"id":7,"request":{"method":"stop_service_port_forward","service_dns":"db","port":5432,"stream_id":2}}"#;
        match serde_json::from_str::<Envelope>(raw).unwrap() {
            Envelope::Request { id, request } => {
                assert_eq!(id, 7);
                assert_eq!(
                    request,
                    Request::StopServicePortForward {
                        service_dns: "db".into(),
                        port: 5432,
                        stream_id: 2
                    }
                );
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn start_info_defaults_optional_fields() {
        let info: PortForwardStartInfo = serde_json::from_str(r#"{"port":80}"#).unwrap();
        assert_eq!(info.local_port, None);
        assert!(info.http_probes.is_empty());
    }
}
