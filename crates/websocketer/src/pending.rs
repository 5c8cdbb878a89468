//! Lock-free pending call tracking using `scc::HashMap`.
//!
//! Every outbound call that expects a reply gets one entry here, keyed by
//! its correlation id. An entry leaves the table through exactly one of:
//! reply, timeout, send failure, expiry sweep, or destroy. Removal happens
//! *before* the waiting caller is completed, so a racing reply and timeout
//! can never both fire.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::EndpointConfig;
use crate::envelope::RequestId;
use crate::error::{WsrError, WsrResult};

/// What a finished call resolves to: an optional payload or an error.
pub type CallResult = WsrResult<Option<Value>>;

/// Single-use completion token for one pending call.
///
/// Completing a call consumes the token; a second attempt is a defined
/// error (`TooManyReply`), never a silent no-op.
pub struct Completion {
    tx: Option<oneshot::Sender<CallResult>>,
}

impl Completion {
    /// Create a token and the receiver the caller awaits.
    pub fn new() -> (Self, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Complete the call with `result`.
    ///
    /// A gone-away receiver is not an error; the result is simply dropped.
    pub fn complete(&mut self, result: CallResult) -> WsrResult<()> {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(result);
                Ok(())
            }
            None => Err(WsrError::TooManyReply),
        }
    }

    /// Whether this token has already been used.
    pub fn is_spent(&self) -> bool {
        self.tx.is_none()
    }
}

/// A call awaiting its reply.
struct PendingCall {
    completion: Completion,
    created_at: Instant,
    deadline: Duration,
}

/// Lock-free store for in-flight calls.
pub struct PendingStore {
    calls: scc::HashMap<RequestId, PendingCall>,
    config: Arc<EndpointConfig>,
}

impl PendingStore {
    /// Create a new pending store.
    pub fn new(config: Arc<EndpointConfig>) -> Self {
        Self {
            calls: scc::HashMap::new(),
            config,
        }
    }

    /// Register a call before its request goes out.
    ///
    /// Returns the receiver that will yield the result, or `None` if the id
    /// is already tracked.
    pub fn add(&self, id: RequestId, deadline: Option<Duration>) -> Option<oneshot::Receiver<CallResult>> {
        let (completion, rx) = Completion::new();
        let pending = PendingCall {
            completion,
            created_at: Instant::now(),
            deadline: deadline.unwrap_or(self.config.timeout),
        };

        // Insert returns Err if the key already exists
        if self.calls.insert_sync(id, pending).is_err() {
            return None;
        }

        Some(rx)
    }

    /// Resolve a call: remove its entry, then complete the waiting caller.
    ///
    /// Returns `false` when the id is unknown (late, duplicate, or already
    /// timed out), in which case the result is dropped.
    pub fn resolve(&self, id: &RequestId, result: CallResult) -> bool {
        if let Some((_, mut pending)) = self.calls.remove_sync(id) {
            let _ = pending.completion.complete(result);
            return true;
        }
        false
    }

    /// Remove a call without completing it (the timeout path: the caller
    /// already gave up and owns its own error).
    ///
    /// Returns `true` if the entry was present.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.calls.remove_sync(id).is_some()
    }

    /// Drop entries whose deadline has passed, without notification.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.calls
            .retain_sync(|_, pending| now.duration_since(pending.created_at) < pending.deadline);
    }

    /// Drop entries whose deadline has passed and fail their callers with a
    /// timeout. Covers callers that stopped awaiting (their receiver is
    /// gone, the send is dropped) as well as live ones.
    pub fn cleanup_expired_with_notify(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.calls.retain_sync(|id, pending| {
            if now.duration_since(pending.created_at) >= pending.deadline {
                expired.push((id.clone(), pending.deadline));
            }
            true
        });

        for (id, deadline) in expired {
            if let Some((_, mut pending)) = self.calls.remove_sync(&id) {
                let _ = pending.completion.complete(Err(WsrError::timeout(deadline)));
            }
        }
    }

    /// Get the current number of in-flight calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Fail every in-flight call with `NoConnection` and empty the table.
    ///
    /// Called when the transport closes or the endpoint is destroyed.
    pub fn clear_with_error(&self, message: &str) {
        let mut ids = Vec::new();
        self.calls.retain_sync(|id, _| {
            ids.push(id.clone());
            true
        });

        for id in ids {
            if let Some((_, mut pending)) = self.calls.remove_sync(&id) {
                let _ = pending
                    .completion
                    .complete(Err(WsrError::no_connection(message)));
            }
        }
    }

    /// Empty the table without notification.
    pub fn clear(&self) {
        self.calls.clear_sync();
    }
}
