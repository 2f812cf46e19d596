//! Common plumbing for the excalibur tunnel: constants, errors, telemetry,
//! retry primitives, and Kubernetes client helpers.

#![deny(missing_docs)]

pub mod discovery;
pub mod env;
pub mod error;
pub mod hooks;
pub mod kube_client;
pub mod retry;
pub mod shutdown;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the reverse proxy listens on
pub const REVERSE_PROXY_PORT: u16 = 10261;

/// Port agents dial to establish their tunnel
pub const AGENT_PORT: u16 = 10262;

/// Port for mTLS master (CONNECT) traffic
pub const MASTER_PORT: u16 = 10263;

/// Port for plaintext master traffic on the insecure bind address
pub const MASTER_INSECURE_PORT: u16 = 10264;

/// Service fronting the tunnel server
pub const TUNNEL_SERVER_SERVICE: &str = "x-tunnel-server-svc";

/// Name of the service port agents connect to
pub const TUNNEL_SERVER_PORT_NAME: &str = "tcp";

/// Annotation overriding the externally reachable tunnel server address
pub const EXTERNAL_ADDR_ANNOTATION: &str = "x-tunnel-server-external-addr";

/// Namespace used when `TUNNEL_SERVER_NAMESPACE` is unset
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Organization that scopes a signing request to the tunnel
pub const TUNNEL_CSR_ORG: &str = "excalibur:tunnel";

/// Extra organization carried by the server identity
pub const MASTER_ORG: &str = "system:masters";

/// Common name of the server identity
pub const SERVER_COMMON_NAME: &str = "kube-apiserver-kubelet-client";

/// Cluster CA mounted into every pod
pub const IN_CLUSTER_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Service account token mounted into every pod
pub const IN_CLUSTER_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// CA of the hub cluster, provisioned for the agent
pub const AGENT_CA_FILE: &str = "/var/lib/tunnel-agent/serviceaccount/ca.crt";

/// Bootstrap token for the hub cluster, provisioned for the agent
pub const AGENT_TOKEN_FILE: &str = "/var/lib/tunnel-agent/serviceaccount/token";

/// Default number of approval workers
pub const DEFAULT_APPROVER_THREADINESS: usize = 2;

/// Interval between keepalive pings on a tunnel
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Grace period after a missed keepalive before the tunnel is dropped
pub const KEEPALIVE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Interval at which startup polls for a signed certificate
pub const CERT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
