//! The cluster collaborator boundary.
//!
//! A request addressed to an endpoint id that is not the local one can be
//! handed to a [`ClusterLink`] collaborator, which owns delivery to wherever
//! that endpoint lives (another process, another machine) and comes back
//! with the reply. The core only ever calls [`ClusterLink::forward`] once
//! per request: the envelope's `forwarded` flag is set before the hand-off
//! so downstream hops never forward again.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatcher::Dispatcher;
use crate::envelope::Envelope;
use crate::error::{WsrError, WsrResult};

/// Collaborator that routes requests between endpoints.
///
/// `forward` must return a well-formed reply: `is_request = false` with the
/// same id and name as the request. A failed `forward` is reflected to the
/// original caller as an internal error; a malformed reply as a no-reply
/// error.
#[async_trait]
pub trait ClusterLink: Send + Sync {
    /// Deliver `envelope` to the endpoint it is addressed to and return
    /// that endpoint's reply.
    async fn forward(&self, envelope: Envelope) -> WsrResult<Envelope>;

    /// Called when an endpoint binds to this collaborator.
    fn register(&self, peer: Arc<Dispatcher>) {
        let _ = peer;
    }

    /// Called when a bound endpoint is destroyed.
    fn unregister(&self, peer_id: &str) {
        let _ = peer_id;
    }
}

/// In-process [`ClusterLink`]: a registry of dispatchers keyed by endpoint
/// id, with `forward` dispatching straight into the addressee.
///
/// Useful for tests and for fanning calls out between endpoints living in
/// one process; multi-process backends implement [`ClusterLink`] over their
/// own transport instead.
#[derive(Default)]
pub struct LocalCluster {
    peers: scc::HashMap<String, Arc<Dispatcher>>,
}

impl LocalCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no endpoints are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[async_trait]
impl ClusterLink for LocalCluster {
    async fn forward(&self, envelope: Envelope) -> WsrResult<Envelope> {
        let Some(to) = envelope.to.clone() else {
            return Err(WsrError::internal("forwarded request has no destination"));
        };
        let Some(peer) = self.peers.read_sync(&to, |_, peer| peer.clone()) else {
            return Err(WsrError::internal(format!(
                "no endpoint '{to}' registered with the cluster"
            )));
        };
        Ok(peer.dispatch_request(envelope).await)
    }

    fn register(&self, peer: Arc<Dispatcher>) {
        let id = peer.id().to_string();
        self.peers.remove_sync(&id);
        let _ = self.peers.insert_sync(id, peer);
    }

    fn unregister(&self, peer_id: &str) {
        self.peers.remove_sync(peer_id);
    }
}
