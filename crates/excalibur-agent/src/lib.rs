//! Cluster side of the excalibur tunnel
//!
//! The agent obtains a client certificate from the hub, dials the tunnel
//! server and serves the streams it opens by connecting to destinations on
//! the local network.

#![deny(missing_docs)]

pub mod agent;
pub mod clients;
pub mod error;
pub mod options;
pub mod tunnel;

pub use agent::{run_agent, run_agent_with, TunnelAgent};
pub use clients::{AgentCluster, KubeAgentCluster};
pub use error::{AgentError, Result};
pub use options::AgentOptions;
pub use tunnel::TunnelClient;
