//! # Websocketer
//!
//! Request/reply messaging over WebSocket-style transports.
//!
//! This crate layers named operations, reply correlation, deadlines and
//! multi-endpoint routing on top of any bidirectional message transport.
//! Two endpoints attached to the two ends of a connection can call each
//! other's registered handlers and await the results as ordinary futures.
//!
//! ## Features
//!
//! - **Request/Reply Correlation**: Every call gets a unique id; replies
//!   resolve the matching pending future, late replies are dropped
//! - **Named Handlers**: Any number of handlers per operation name, run
//!   sequentially, the last return value forming the reply
//! - **Deadlines**: Per-call and endpoint-wide timeouts with a periodic
//!   expiry sweep
//! - **Clustering**: Requests addressed to another endpoint are handed to
//!   a pluggable collaborator and relayed back transparently
//! - **Identity Handshake**: Endpoints announce themselves and learn
//!   their peers, with keepalive pings in between
//! - **Transport Agnostic**: Anything implementing [`Transport`] works;
//!   an in-process [`MemoryTransport`] pair is included
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use websocketer::{Endpoint, EndpointConfig, memory_pair};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (near, far) = memory_pair();
//!
//!     let server = Endpoint::attach(far, EndpointConfig::new().id("server"))?;
//!     server.listen("greet", |payload, _| async move {
//!         let who = payload
//!             .and_then(|p| p.as_str().map(str::to_string))
//!             .unwrap_or_else(|| "stranger".to_string());
//!         Ok(Some(json!(format!("hello, {who}"))))
//!     });
//!
//!     let client = Endpoint::attach(near, EndpointConfig::new().id("client"))?;
//!     let reply = client.call("greet", json!("world")).await?;
//!     println!("{reply:?}");
//!
//!     client.destroy().await;
//!     server.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod pending;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use cluster::{ClusterLink, LocalCluster};
pub use config::{DEFAULT_NAMESPACE, EndpointConfig};
pub use dispatcher::{CallManyOptions, CallOptions, Dispatcher};
pub use endpoint::{Endpoint, Event};
pub use envelope::{Envelope, ErrorInfo, RemoteInfo, RequestId};
pub use error::{WsrError, WsrResult};
pub use pending::CallResult;
pub use transport::{MemoryTransport, Transport, WireMessage, memory_pair};
