//! Endpoint configuration.

use std::{fmt, sync::Arc, time::Duration};

use crate::cluster::ClusterLink;
use crate::envelope::ErrorInfo;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "websocketer";

/// Transform applied to an error object before it goes on the wire.
pub type ErrorFilter = dyn Fn(ErrorInfo) -> ErrorInfo + Send + Sync;

/// Configuration for an endpoint.
#[derive(Clone)]
pub struct EndpointConfig {
    // Identity
    /// Endpoint id; generated when `None`.
    pub id: Option<String>,
    /// Namespace tag; only envelopes with a matching tag are processed.
    pub namespace: String,

    // Request handling
    /// Default deadline for calls awaiting a reply.
    pub timeout: Duration,
    /// Append the failing operation name to received error messages.
    pub debug: bool,
    /// Final transform for outgoing error objects (e.g. to scrub internals).
    pub error_filter: Arc<ErrorFilter>,

    // Keepalive
    /// Interval between `_ping_` calls; zero disables the keepalive.
    pub ping_interval: Duration,

    // Cluster
    /// Collaborator receiving requests addressed to non-local endpoints.
    pub cluster: Option<Arc<dyn ClusterLink>>,

    // Housekeeping
    /// Interval for sweeping expired pending calls.
    pub sweep_interval: Duration,
    /// Capacity of the actor command channel.
    pub command_channel_capacity: usize,
    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            id: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            timeout: Duration::from_secs(60),
            debug: false,
            error_filter: Arc::new(|info| info),
            ping_interval: Duration::ZERO,
            cluster: None,
            sweep_interval: Duration::from_secs(5),
            command_channel_capacity: 64,
            event_channel_capacity: 64,
        }
    }
}

impl EndpointConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fixed endpoint id instead of a generated one.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the default call deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable debug error messages.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the error filter.
    #[must_use]
    pub fn error_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(ErrorInfo) -> ErrorInfo + Send + Sync + 'static,
    {
        self.error_filter = Arc::new(filter);
        self
    }

    /// Set the keepalive interval; zero disables the keepalive.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the cluster collaborator.
    #[must_use]
    pub fn cluster(mut self, cluster: Arc<dyn ClusterLink>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Set the pending sweep interval.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the command channel capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.is_empty() {
            return Err("Namespace cannot be empty".to_string());
        }
        if let Some(id) = &self.id
            && id.is_empty()
        {
            return Err("Endpoint id cannot be empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err("Call timeout must be > 0".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("Sweep interval must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err("Event channel capacity must be > 0".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .field("debug", &self.debug)
            .field("ping_interval", &self.ping_interval)
            .field("cluster", &self.cluster.is_some())
            .field("sweep_interval", &self.sweep_interval)
            .field("command_channel_capacity", &self.command_channel_capacity)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .finish_non_exhaustive()
    }
}
