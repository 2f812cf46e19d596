//! Agent introduction
//!
//! The first frame an agent sends on a fresh connection is a `Hello`
//! naming its cluster and identifiers. The hub registers the agent only
//! after the hello parses and the identifiers validate.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{AgentIdentifiers, Frame, FrameCodec, FrameKind, Result, TransportError};

/// Payload of the [`FrameKind::Hello`] frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Cluster the agent runs in
    pub cluster_name: String,
    /// Textual agent identifiers
    #[serde(default)]
    pub identifiers: String,
}

impl Hello {
    /// Create a hello
    pub fn new(cluster_name: impl Into<String>, identifiers: &AgentIdentifiers) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            identifiers: identifiers.to_string(),
        }
    }

    /// Parsed identifiers
    pub fn agent_identifiers(&self) -> Result<AgentIdentifiers> {
        AgentIdentifiers::parse(&self.identifiers)
    }

    fn to_frame(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self)
            .map_err(|e| TransportError::Handshake(format!("encode hello: {}", e)))?;
        Ok(Frame::new(FrameKind::Hello, 0, payload))
    }

    fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.kind != FrameKind::Hello {
            return Err(TransportError::Handshake(format!(
                "expected hello, got {:?}",
                frame.kind
            )));
        }
        let hello: Self = serde_json::from_slice(&frame.payload)
            .map_err(|e| TransportError::Handshake(format!("decode hello: {}", e)))?;
        if hello.cluster_name.is_empty() {
            return Err(TransportError::Handshake("cluster name is empty".to_string()));
        }
        Ok(hello)
    }
}

/// Send `hello` as the first frame
pub async fn send_hello<T>(framed: &mut Framed<T, FrameCodec>, hello: &Hello) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(hello.to_frame()?).await
}

/// Read the peer's hello, failing if it does not arrive within `timeout`
pub async fn read_hello<T>(framed: &mut Framed<T, FrameCodec>, timeout: Duration) -> Result<Hello>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| TransportError::Handshake(format!("no hello within {:?}", timeout)))?
        .ok_or_else(|| TransportError::Handshake("connection closed before hello".to_string()))??;
    Hello::from_frame(&frame)
}
