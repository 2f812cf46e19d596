//! Wire protocol carried over the excalibur tunnel
//!
//! One mTLS connection per agent carries many logical streams. Each stream
//! is opened with a `Dial` naming a `host:port` the agent connects to, then
//! carries raw bytes until either side sends `Close`.
//!
//! - [`frame`]: length-prefixed frame codec
//! - [`handshake`]: the `Hello` an agent sends after connecting
//! - [`identifiers`]: the agent identifiers used to route dials
//! - [`session`]: stream multiplexing and keepalive over a framed connection

#![deny(missing_docs)]

pub mod error;
pub mod frame;
pub mod handshake;
pub mod identifiers;
pub mod session;

pub use error::TransportError;
pub use frame::{Frame, FrameCodec, FrameKind};
pub use handshake::Hello;
pub use identifiers::{AgentIdentifiers, IdentifierType};
pub use session::{spawn_session, DialRequest, Role, Session, SessionConfig, SessionHandle, TunnelStream};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
