//! The endpoint: a dispatcher bound to a transport by a background actor.
//!
//! [`Endpoint::attach`] spawns an actor task that owns the transport and
//! multiplexes four sources of work: outbound commands from endpoint
//! handles, inbound frames from the peer, the keepalive tick, and the
//! pending-call expiry sweep. Inbound envelopes are dispatched on their
//! own tasks so a slow handler never stalls the read loop.
//!
//! Attaching also installs the protocol handlers every endpoint carries:
//!
//! - `_ping_` echoes its payload back (keepalive),
//! - `_remote_` records the announcing peer and answers with this
//!   endpoint's own identity so both sides converge,
//! - `_request_` dispatches an embedded envelope without touching the
//!   transport.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::dispatcher::{CallManyOptions, CallOptions, Dispatcher};
use crate::envelope::{Envelope, PING_NAME, REMOTE_NAME, REQUEST_NAME, RemoteInfo, RequestId};
use crate::error::{WsrError, WsrResult};
use crate::pending::CallResult;
use crate::transport::{Transport, WireMessage};

/// Instruction from an endpoint handle to its actor.
#[derive(Debug)]
pub(crate) enum EndpointCommand {
    /// Write a frame to the transport. When `correlates` is set and the
    /// write fails, that pending call is aborted immediately instead of
    /// waiting out its deadline.
    Send {
        message: WireMessage,
        correlates: Option<RequestId>,
    },
    /// Detach from the transport and stop the actor.
    Close,
}

/// Notable endpoint lifecycle events.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Event {
    /// A peer announced itself through the identity handshake.
    RemoteDiscovered { remote: RemoteInfo },
}

/// A messaging endpoint attached to a transport.
///
/// Cheap to clone; all clones drive the same actor. Dropping every clone
/// does not stop the actor (the connection stays usable by its peer until
/// the transport closes); call [`Endpoint::destroy`] for a deliberate
/// teardown.
#[derive(Clone)]
pub struct Endpoint {
    dispatcher: Arc<Dispatcher>,
    cmd_tx: mpsc::Sender<EndpointCommand>,
    events: broadcast::Sender<Event>,
}

impl Endpoint {
    /// Bind `transport` to a new endpoint and spawn its actor.
    ///
    /// Fails only when `config` is invalid. If the transport is already
    /// open the actor announces this endpoint's identity right away.
    pub fn attach<T: Transport>(transport: T, config: EndpointConfig) -> WsrResult<Endpoint> {
        config.validate().map_err(WsrError::config)?;
        let config = Arc::new(config);

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), cmd_tx.clone()));

        install_protocol_handlers(&dispatcher, &events);
        if let Some(cluster) = &config.cluster {
            cluster.register(dispatcher.clone());
        }

        let actor = EndpointActor {
            transport,
            cmd_rx,
            dispatcher: dispatcher.clone(),
            config,
        };
        tokio::spawn(actor.run());

        Ok(Endpoint {
            dispatcher,
            cmd_tx,
            events,
        })
    }

    /// This endpoint's id.
    pub fn id(&self) -> &str {
        self.dispatcher.id()
    }

    /// Whether the actor is still bound to its transport.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed() && !self.dispatcher.is_destroyed()
    }

    /// Subscribe to endpoint lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Peers learned through the identity handshake.
    pub fn remotes(&self) -> Vec<RemoteInfo> {
        self.dispatcher.remotes()
    }

    /// Number of in-flight outbound calls.
    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Number of operation names with at least one handler.
    pub fn handler_count(&self) -> usize {
        self.dispatcher.handler_count()
    }

    /// Register a handler for `name`, appended after any existing ones.
    pub fn listen<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Option<Value>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.dispatcher.listen(name, handler);
    }

    /// Drop every handler for `name`.
    pub fn forget(&self, name: &str) -> bool {
        self.dispatcher.forget(name)
    }

    /// Call `name` on the connected peer and await its reply.
    pub async fn call(&self, name: &str, payload: impl Into<Option<Value>>) -> CallResult {
        self.dispatcher.call(name, payload).await
    }

    /// Call `name` on the endpoint identified by `to`.
    pub async fn call_to(
        &self,
        name: &str,
        payload: impl Into<Option<Value>>,
        to: &str,
    ) -> CallResult {
        self.dispatcher.call_to(name, payload, to).await
    }

    /// Call with full control over destination and options.
    pub async fn call_with(
        &self,
        name: &str,
        payload: impl Into<Option<Value>>,
        to: Option<&str>,
        options: CallOptions,
    ) -> CallResult {
        self.dispatcher.call_with(name, payload, to, options).await
    }

    /// Call `name` on several endpoints concurrently.
    pub async fn call_many(
        &self,
        name: &str,
        payload: impl Into<Option<Value>>,
        destinations: &[&str],
        options: CallManyOptions,
    ) -> WsrResult<Vec<CallResult>> {
        self.dispatcher
            .call_many(name, payload, destinations, options)
            .await
    }

    /// Tear the endpoint down deliberately.
    ///
    /// Leaves the collaborator, fails every in-flight call, drops all
    /// handlers and stops the actor. Idempotent; subsequent calls on any
    /// clone reject with `NoConnection`.
    pub async fn destroy(&self) {
        self.dispatcher.destroy();
        let _ = self.cmd_tx.send(EndpointCommand::Close).await;
    }
}

/// Handlers for the reserved operation names, installed at attach time.
///
/// They hold the dispatcher weakly; a destroyed endpoint answers nothing.
fn install_protocol_handlers(dispatcher: &Arc<Dispatcher>, events: &broadcast::Sender<Event>) {
    dispatcher.listen(PING_NAME, |payload, _| async move { Ok(payload) });

    let weak = Arc::downgrade(dispatcher);
    let discovered = events.clone();
    dispatcher.listen(REMOTE_NAME, move |payload, _| {
        let weak = weak.clone();
        let discovered = discovered.clone();
        async move {
            let Some(dispatcher) = weak.upgrade() else {
                return Ok(None);
            };
            let Some(remote) = payload.and_then(|p| serde_json::from_value::<RemoteInfo>(p).ok())
            else {
                debug!("ignoring malformed identity announcement");
                return Ok(None);
            };
            if dispatcher.record_remote(remote.clone()) {
                debug!(remote = %remote.id, "peer announced itself");
                let _ = discovered.send(Event::RemoteDiscovered { remote });
                // answer in kind so both sides learn each other
                dispatcher.announce().await;
            }
            Ok(None)
        }
    });

    let weak = Arc::downgrade(dispatcher);
    dispatcher.listen(REQUEST_NAME, move |payload, _| {
        let weak = weak.clone();
        async move {
            let Some(dispatcher) = weak.upgrade() else {
                return Ok(None);
            };
            let Some(embedded) = payload.and_then(|p| serde_json::from_value::<Envelope>(p).ok())
            else {
                return Err(WsrError::internal("malformed embedded envelope"));
            };
            if embedded.namespace != dispatcher.namespace() {
                return Ok(None);
            }
            if embedded.is_request {
                let reply = dispatcher.dispatch_request(embedded).await;
                Ok(Some(serde_json::to_value(reply)?))
            } else {
                dispatcher.resolve_reply(embedded);
                Ok(None)
            }
        }
    });
}

/// Owns the transport; everything else talks to it through channels.
struct EndpointActor<T> {
    transport: T,
    cmd_rx: mpsc::Receiver<EndpointCommand>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<EndpointConfig>,
}

impl<T: Transport> EndpointActor<T> {
    async fn run(self) {
        let Self {
            mut transport,
            mut cmd_rx,
            dispatcher,
            config,
        } = self;

        if transport.is_open() {
            dispatcher.announce().await;
        }

        let mut ping = (!config.ping_interval.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + config.ping_interval,
                config.ping_interval,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + config.sweep_interval,
            config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(EndpointCommand::Send { message, correlates }) => {
                        if let Err(e) = transport.send(message).await {
                            warn!(error = %e, "transport send failed");
                            if let Some(id) = correlates {
                                dispatcher.abort_pending(&id, "transport send failed");
                            }
                        }
                    }
                    Some(EndpointCommand::Close) | None => break,
                },
                inbound = transport.recv() => match inbound {
                    Some(message) => match Envelope::decode(&message) {
                        Ok(envelope) => {
                            let dispatcher = dispatcher.clone();
                            tokio::spawn(async move {
                                dispatcher.handle_inbound(envelope).await;
                            });
                        }
                        Err(e) => debug!(error = %e, "dropping undecodable frame"),
                    },
                    None => {
                        debug!(id = %dispatcher.id(), "transport closed by peer");
                        dispatcher.shed_pending("connection closed");
                        break;
                    }
                },
                _ = tick(ping.as_mut()) => {
                    let dispatcher = dispatcher.clone();
                    let deadline = config.ping_interval;
                    tokio::spawn(async move {
                        let options = CallOptions::default().timeout(deadline);
                        if let Err(e) = dispatcher.call_with(PING_NAME, None, None, options).await {
                            debug!(error = %e, "keepalive ping went unanswered");
                        }
                    });
                }
                _ = sweep.tick() => dispatcher.sweep(),
            }
        }

        debug!(id = %dispatcher.id(), "endpoint actor stopped");
    }
}

/// Tick of an optional interval; never ready when the interval is off.
async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
