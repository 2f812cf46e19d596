//! Hub side of the excalibur tunnel
//!
//! Agents in member clusters dial the [`agent_listener`]; the API server
//! reaches member clusters through the [`master`] listeners, which carry
//! each `CONNECT` over the matching agent's session. The
//! [`reverse_proxy`] fronts the local API server and the norm service.

#![deny(missing_docs)]

pub mod agent_listener;
pub mod error;
pub mod master;
pub mod options;
pub mod registry;
pub mod reverse_proxy;
pub mod server;

pub use error::{Result, ServerError};
pub use options::{ProxyStrategy, ServerOptions};
pub use server::{
    run_server, run_server_with, KubeServerCluster, RunningServer, ServerCluster, TunnelServer,
};
