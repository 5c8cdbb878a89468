//! The dispatcher: request/reply correlation, handler invocation, routing.
//!
//! One dispatcher owns the pending-call table, the handler registry, and
//! the set of learned remote endpoints for one endpoint. Outbound frames go
//! through the endpoint actor's command channel; inbound envelopes arrive
//! via [`Dispatcher::handle_inbound`], each on its own task so distinct
//! requests are served independently.
//!
//! Routing rules for a request envelope:
//!
//! - addressed to a non-local endpoint with a collaborator configured:
//!   marked `forwarded` and handed to the collaborator exactly once,
//! - addressed to the local endpoint (or not addressed at all): dispatched
//!   to the local handlers, producing exactly one reply.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cluster::ClusterLink;
use crate::config::EndpointConfig;
use crate::endpoint::EndpointCommand;
use crate::envelope::{Envelope, ErrorInfo, RemoteInfo, RequestId};
use crate::error::{WsrError, WsrResult};
use crate::pending::{CallResult, PendingStore};
use crate::registry::{HandlerRegistry, handler_fn};

/// Per-call options.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Fire-and-forget: resolve with no payload as soon as the request is
    /// handed off. The peer still runs its handlers; its reply is dropped.
    pub no_reply: bool,
    /// Deadline override for this call.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Make the call fire-and-forget.
    #[must_use]
    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    /// Override the deadline for this call.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for [`Dispatcher::call_many`].
#[derive(Clone, Debug, Default)]
pub struct CallManyOptions {
    /// Keep going when a destination fails; its error takes the failed
    /// call's slot in the results instead of aborting the batch.
    pub continue_on_error: bool,
    /// Fire-and-forget every sub-call.
    pub no_reply: bool,
}

impl CallManyOptions {
    /// Keep going when a destination fails.
    #[must_use]
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Make every sub-call fire-and-forget.
    #[must_use]
    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }
}

/// Correlation and dispatch core for one endpoint.
pub struct Dispatcher {
    id: String,
    config: Arc<EndpointConfig>,
    pending: PendingStore,
    handlers: HandlerRegistry,
    remotes: scc::HashMap<String, RemoteInfo>,
    cluster: Option<Arc<dyn ClusterLink>>,
    outbound: mpsc::Sender<EndpointCommand>,
    destroyed: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(config: Arc<EndpointConfig>, outbound: mpsc::Sender<EndpointCommand>) -> Self {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        Self {
            id,
            pending: PendingStore::new(config.clone()),
            handlers: HandlerRegistry::new(),
            remotes: scc::HashMap::new(),
            cluster: config.cluster.clone(),
            outbound,
            destroyed: AtomicBool::new(false),
            config,
        }
    }

    /// This endpoint's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The namespace this endpoint speaks.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Whether [`Dispatcher::destroy`] has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Number of in-flight outbound calls.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of operation names with at least one handler.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Peers learned through the `_remote_` handshake.
    pub fn remotes(&self) -> Vec<RemoteInfo> {
        let mut remotes = Vec::new();
        self.remotes.retain_sync(|_, info| {
            remotes.push(info.clone());
            true
        });
        remotes
    }

    /// Register a handler for `name`, appended after any existing ones.
    pub fn listen<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Option<Value>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.handlers.add(name, handler_fn(handler));
    }

    /// Drop every handler for `name`.
    pub fn forget(&self, name: &str) -> bool {
        self.handlers.forget(name)
    }

    /// Call `name` on the connected peer and await its reply.
    pub async fn call(
        self: &Arc<Self>,
        name: &str,
        payload: impl Into<Option<Value>>,
    ) -> CallResult {
        self.call_with(name, payload, None, CallOptions::default())
            .await
    }

    /// Call `name` on the endpoint identified by `to`.
    pub async fn call_to(
        self: &Arc<Self>,
        name: &str,
        payload: impl Into<Option<Value>>,
        to: &str,
    ) -> CallResult {
        self.call_with(name, payload, Some(to), CallOptions::default())
            .await
    }

    /// Call with full control over destination and options.
    pub async fn call_with(
        self: &Arc<Self>,
        name: &str,
        payload: impl Into<Option<Value>>,
        to: Option<&str>,
        options: CallOptions,
    ) -> CallResult {
        if self.is_destroyed() {
            return Err(WsrError::no_connection("endpoint destroyed"));
        }

        let envelope = Envelope::request(
            &self.config.namespace,
            name,
            &self.id,
            to.map(str::to_string),
            payload.into(),
        );
        let deadline = options.timeout.unwrap_or(self.config.timeout);

        // A destination plus a collaborator bypasses the transport entirely.
        if let Some(dest) = envelope.to.clone()
            && let Some(cluster) = self.cluster.clone()
        {
            if dest == self.id {
                // loop straight back into local dispatch
                if options.no_reply {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let _ = this.dispatch_request(envelope).await;
                    });
                    return Ok(None);
                }
                let reply = self.dispatch_request(envelope).await;
                return self.digest_reply(reply);
            }

            let request = envelope.into_forwarded();
            if options.no_reply {
                tokio::spawn(async move {
                    if let Err(e) = cluster.forward(request).await {
                        debug!(error = %e, "fire-and-forget forward failed");
                    }
                });
                return Ok(None);
            }
            return match tokio::time::timeout(deadline, cluster.forward(request.clone())).await {
                Ok(Ok(reply)) if reply.answers(&request) => self.digest_reply(reply),
                Ok(Ok(_)) => Err(WsrError::no_reply(&request.name)),
                Ok(Err(e)) => Err(WsrError::internal(format!("cluster forward failed: {e}"))),
                Err(_) => Err(WsrError::timeout(deadline)),
            };
        }

        let id = envelope.id.clone();
        if options.no_reply {
            return self.send_envelope(envelope, None).await.map(|_| None);
        }

        // Register before sending so a fast reply cannot race the table.
        let Some(reply_rx) = self.pending.add(id.clone(), Some(deadline)) else {
            return Err(WsrError::internal("duplicate request id"));
        };

        if let Err(e) = self.send_envelope(envelope, Some(id.clone())).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WsrError::no_connection("endpoint destroyed")),
            Err(_) => {
                self.pending.remove(&id);
                Err(WsrError::timeout(deadline))
            }
        }
    }

    /// Call `name` on several endpoints concurrently.
    ///
    /// Results come back in destination order. With
    /// [`CallManyOptions::continue_on_error`] every slot holds its own
    /// outcome; otherwise the first failure (in destination order) aborts
    /// the batch.
    pub async fn call_many(
        self: &Arc<Self>,
        name: &str,
        payload: impl Into<Option<Value>>,
        destinations: &[&str],
        options: CallManyOptions,
    ) -> WsrResult<Vec<CallResult>> {
        let payload = payload.into();
        let calls = destinations.iter().map(|dest| {
            let sub_options = CallOptions::default().no_reply(options.no_reply);
            self.call_with(name, payload.clone(), Some(dest), sub_options)
        });
        let results = join_all(calls).await;

        if options.continue_on_error {
            return Ok(results);
        }
        results.into_iter().map(|result| result.map(Ok)).collect()
    }

    /// Feed one decoded inbound envelope through the dispatcher.
    ///
    /// Requests produce exactly one reply (sent back on the transport, or
    /// relayed from the collaborator); replies resolve their pending call.
    /// Envelopes from a foreign namespace, and replies nobody is waiting
    /// for, are dropped silently.
    pub async fn handle_inbound(&self, envelope: Envelope) {
        if envelope.namespace != self.config.namespace {
            debug!(
                namespace = %envelope.namespace,
                "dropping envelope from foreign namespace"
            );
            return;
        }
        if self.is_destroyed() {
            return;
        }

        if !envelope.is_request {
            self.resolve_reply(envelope);
            return;
        }

        // A relayed request addressed elsewhere goes to the collaborator,
        // once, bounded by the endpoint's default deadline; its reply is
        // written back to the transport verbatim.
        if let Some(cluster) = self.cluster.clone()
            && !envelope.forwarded
            && let Some(to) = envelope.to.as_deref()
            && to != self.id
        {
            let request = envelope.into_forwarded();
            let deadline = self.config.timeout;
            let reply = match tokio::time::timeout(deadline, cluster.forward(request.clone())).await
            {
                Ok(Ok(reply)) if reply.answers(&request) => reply,
                Ok(Ok(_)) => self.build_error_reply(&request, &WsrError::no_reply(&request.name)),
                Ok(Err(e)) => {
                    warn!(name = %request.name, error = %e, "cluster forward failed");
                    let internal = WsrError::internal(format!("cluster forward failed: {e}"));
                    self.build_error_reply(&request, &internal)
                }
                Err(_) => {
                    warn!(name = %request.name, "cluster forward timed out");
                    let internal = WsrError::internal("cluster forward timed out");
                    self.build_error_reply(&request, &internal)
                }
            };
            if let Err(e) = self.send_envelope(reply, None).await {
                debug!(error = %e, "could not relay forwarded reply");
            }
            return;
        }

        let reply = self.dispatch_request(envelope).await;
        if let Err(e) = self.send_envelope(reply, None).await {
            debug!(error = %e, "could not send reply");
        }
    }

    /// Run the local handlers for `request` and build the reply envelope.
    ///
    /// Handlers run sequentially in registration order; each return value
    /// overwrites the payload accumulator, so the last handler decides the
    /// reply payload. A handler error aborts the run and becomes the
    /// reply's error, passed through the configured error filter.
    pub async fn dispatch_request(&self, request: Envelope) -> Envelope {
        let handlers = self.handlers.handlers_for(&request.name);
        if handlers.is_empty() {
            return self.build_error_reply(&request, &WsrError::no_listener(&request.name));
        }

        let mut payload = None;
        for handler in handlers {
            match handler(request.payload.clone(), request.clone()).await {
                Ok(value) => payload = value,
                Err(error) => {
                    debug!(name = %request.name, error = %error, "handler failed");
                    return self.build_error_reply(&request, &error);
                }
            }
        }
        Envelope::reply(&request, &self.id, payload)
    }

    /// Tear the dispatcher down: leave the collaborator, fail in-flight
    /// calls, drop all handlers and learned remotes. Subsequent calls
    /// reject with `NoConnection`.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        if let Some(cluster) = &self.cluster {
            cluster.unregister(&self.id);
        }
        self.pending.clear_with_error("endpoint destroyed");
        self.handlers.clear();
        self.remotes.clear_sync();
    }

    /// Resolve the pending call a reply envelope belongs to.
    ///
    /// Returns `false` when nobody is waiting (late, duplicate, unknown,
    /// or fire-and-forget), in which case the reply is dropped.
    pub(crate) fn resolve_reply(&self, envelope: Envelope) -> bool {
        let id = envelope.id.clone();
        let result = self.digest_reply(envelope);
        let resolved = self.pending.resolve(&id, result);
        if !resolved {
            debug!(id = %id, "dropping reply with no pending call");
        }
        resolved
    }

    /// Announce this endpoint's identity to the connected peer.
    pub(crate) async fn announce(&self) {
        let envelope = Envelope::request(
            &self.config.namespace,
            crate::envelope::REMOTE_NAME,
            &self.id,
            None,
            Some(serde_json::json!({ "id": self.id })),
        );
        if let Err(e) = self.send_envelope(envelope, None).await {
            debug!(error = %e, "identity announce failed");
        }
    }

    /// Record a peer learned from a `_remote_` announcement.
    ///
    /// Returns `true` when the peer was not known before.
    pub(crate) fn record_remote(&self, info: RemoteInfo) -> bool {
        self.remotes.insert_sync(info.id.clone(), info).is_ok()
    }

    /// Fail one pending call; used by the actor when a send fails.
    pub(crate) fn abort_pending(&self, id: &RequestId, message: &str) {
        self.pending
            .resolve(id, Err(WsrError::no_connection(message)));
    }

    /// Fail every pending call; used by the actor when the transport closes.
    pub(crate) fn shed_pending(&self, message: &str) {
        self.pending.clear_with_error(message);
    }

    /// Notify expired pending calls; driven by the actor's sweep tick.
    pub(crate) fn sweep(&self) {
        self.pending.cleanup_expired_with_notify();
    }

    fn digest_reply(&self, envelope: Envelope) -> CallResult {
        match envelope.error {
            Some(info) => Err(info.into_error(&envelope.name, self.config.debug)),
            None => Ok(envelope.payload),
        }
    }

    fn build_error_reply(&self, request: &Envelope, error: &WsrError) -> Envelope {
        let info = (self.config.error_filter)(ErrorInfo::from_error(error));
        Envelope::error_reply(request, &self.id, info)
    }

    async fn send_envelope(
        &self,
        envelope: Envelope,
        correlates: Option<RequestId>,
    ) -> WsrResult<()> {
        let message = envelope.encode()?;
        self.outbound
            .send(EndpointCommand::Send {
                message,
                correlates,
            })
            .await
            .map_err(|_| WsrError::no_connection("endpoint actor gone"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn test_dispatcher(config: EndpointConfig) -> (Arc<Dispatcher>, mpsc::Receiver<EndpointCommand>) {
        let (outbound, outbound_rx) = mpsc::channel(16);
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(config), outbound));
        (dispatcher, outbound_rx)
    }

    fn sent_envelope(command: EndpointCommand) -> Envelope {
        match command {
            EndpointCommand::Send { message, .. } => Envelope::decode(&message).unwrap(),
            other => panic!("expected a send command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_listener_is_an_error_reply() {
        let (dispatcher, _rx) = test_dispatcher(EndpointConfig::new().id("local"));
        let request = Envelope::request("websocketer", "missing", "peer", None, None);

        let reply = dispatcher.dispatch_request(request.clone()).await;
        assert!(reply.answers(&request));
        assert_eq!(reply.error.unwrap().code, "ERR_WSR_NO_LISTENER");
    }

    #[tokio::test]
    async fn test_dispatch_last_handler_wins() {
        let (dispatcher, _rx) = test_dispatcher(EndpointConfig::new().id("local"));
        dispatcher.listen("op", |_, _| async { Ok(Some(json!(1))) });
        dispatcher.listen("op", |_, _| async { Ok(Some(json!(2))) });

        let request = Envelope::request("websocketer", "op", "peer", None, None);
        let reply = dispatcher.dispatch_request(request).await;
        assert_eq!(reply.payload, Some(json!(2)));
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_silent_last_handler_clears_the_payload() {
        let (dispatcher, _rx) = test_dispatcher(EndpointConfig::new().id("local"));
        dispatcher.listen("op", |_, _| async { Ok(Some(json!("draft"))) });
        dispatcher.listen("op", |_, _| async { Ok(None) });

        let request = Envelope::request("websocketer", "op", "peer", None, None);
        let reply = dispatcher.dispatch_request(request.clone()).await;
        assert!(reply.answers(&request));
        assert!(reply.payload.is_none());
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_handler_error_aborts_the_chain() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (dispatcher, _rx) = test_dispatcher(EndpointConfig::new().id("local"));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        dispatcher.listen("op", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(WsrError::internal("boom")) }
        });
        let counter = ran.clone();
        dispatcher.listen("op", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        });

        let request = Envelope::request("websocketer", "op", "peer", None, None);
        let reply = dispatcher.dispatch_request(request).await;
        assert_eq!(reply.error.unwrap().code, "ERR_WSR_INTERNAL");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_filter_shapes_the_wire_error() {
        let config = EndpointConfig::new().id("local").error_filter(|mut info| {
            info.message = "redacted".to_string();
            info
        });
        let (dispatcher, _rx) = test_dispatcher(config);
        dispatcher.listen("op", |_, _| async { Err(WsrError::internal("secret")) });

        let request = Envelope::request("websocketer", "op", "peer", None, None);
        let reply = dispatcher.dispatch_request(request).await;
        let error = reply.error.unwrap();
        assert_eq!(error.message, "redacted");
        assert_eq!(error.code, "ERR_WSR_INTERNAL");
    }

    #[tokio::test]
    async fn test_handle_inbound_foreign_namespace_is_dropped() {
        let (dispatcher, mut rx) = test_dispatcher(EndpointConfig::new().id("local"));
        dispatcher.listen("op", |_, _| async { Ok(None) });

        let request = Envelope::request("elsewhere", "op", "peer", None, None);
        dispatcher.handle_inbound(request).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_inbound_request_sends_reply() {
        let (dispatcher, mut rx) = test_dispatcher(EndpointConfig::new().id("local"));
        dispatcher.listen("double", |payload, _| async move {
            let n = payload.and_then(|p| p.as_i64()).unwrap_or(0);
            Ok(Some(json!(n * 2)))
        });

        let request = Envelope::request("websocketer", "double", "peer", None, Some(json!(21)));
        dispatcher.handle_inbound(request.clone()).await;

        let reply = sent_envelope(rx.recv().await.unwrap());
        assert!(reply.answers(&request));
        assert_eq!(reply.payload, Some(json!(42)));
        assert_eq!(reply.to.as_deref(), Some("peer"));
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped_silently() {
        let (dispatcher, _rx) = test_dispatcher(EndpointConfig::new().id("local"));
        let stale = Envelope::reply(
            &Envelope::request("websocketer", "op", "local", None, None),
            "peer",
            Some(json!(1)),
        );
        assert!(!dispatcher.resolve_reply(stale));
    }

    #[tokio::test]
    async fn test_destroy_empties_state_and_rejects_calls() {
        let (dispatcher, _rx) = test_dispatcher(EndpointConfig::new().id("local"));
        dispatcher.listen("op", |_, _| async { Ok(None) });
        assert_eq!(dispatcher.handler_count(), 1);

        dispatcher.destroy();
        assert!(dispatcher.is_destroyed());
        assert_eq!(dispatcher.handler_count(), 0);
        assert_eq!(dispatcher.pending_count(), 0);

        let err = dispatcher.call("op", None).await.unwrap_err();
        assert_eq!(err.code(), "ERR_WSR_NO_CONNECTION");
    }

    #[tokio::test]
    async fn test_record_remote_reports_new_peers_once() {
        let (dispatcher, _rx) = test_dispatcher(EndpointConfig::new().id("local"));
        assert!(dispatcher.record_remote(RemoteInfo { id: "peer".into() }));
        assert!(!dispatcher.record_remote(RemoteInfo { id: "peer".into() }));
        assert_eq!(dispatcher.remotes().len(), 1);
    }
}
