use std::collections::HashSet;
use std::fmt::Display;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    device::DeviceEvent,
    error::Error,
    options::NormalizedPortOptions,
};

/// The real serial connection.
pub mod serial;

/// A loopback mock connection, for tests.
pub mod mock;

/// A no-op connection.
pub mod disabled;

/// Line framing for the sensor's wire format.
pub(crate) mod lines;

/// Identifies one subscription to a connection's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live handle to one sensor endpoint.
///
/// Variants exist for real hardware ([`serial::SerialConnection`]), a test
/// double ([`mock::MockConnection`]) and a disabled no-op
/// ([`disabled::DisabledConnection`]). The manager and fanout are agnostic
/// to which variant is live.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Subscribe to the connection's event stream.
    ///
    /// The stream ends (receivers observe a closed channel) when the
    /// connection is closed.
    fn subscribe(&self) -> (SubscriptionId, broadcast::Receiver<DeviceEvent>);

    /// Retire a subscription. Idempotent; unknown ids are a no-op.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Queue a command line for the device.
    async fn send_command(&self, command: &str) -> Result<(), Error>;

    /// Run the device handshake.
    async fn initialize(&self) -> Result<(), Error>;

    /// Drive the connection's I/O loop.
    ///
    /// Blocks until the loop ends (clean return), an I/O fault occurs, or
    /// `cancel` fires (returns [`Error::Cancelled`]).
    async fn monitor(&self, cancel: CancellationToken) -> Result<(), Error>;

    /// Close the connection and end its event stream.
    async fn close(&self) -> Result<(), Error>;

    /// Variant-specific diagnostics, surfaced by the HTTP status endpoint.
    ///
    /// The default reports nothing.
    fn diagnostics(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Pure constructor of [`Connection`]s: `(path, options)` to a live handle.
///
/// Failures map to [`Error::Open`].
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to the endpoint at `path`.
    async fn open(
        &self,
        path: &str,
        options: &NormalizedPortOptions,
    ) -> Result<Arc<dyn Connection>, Error>;
}

/// The factory used by the shipped binary.
///
/// Picks the connection variant from the path:
///
/// - `mock:<name>` gives a loopback [`mock::MockConnection`]
/// - `disabled` gives a [`disabled::DisabledConnection`]
/// - anything else is treated as a serial port path
#[derive(Debug, Default)]
pub struct DeviceFactory {
    init_commands: Vec<String>,
}

impl DeviceFactory {
    /// A factory with no init commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Command lines sent to a fresh serial connection by its
    /// `initialize` handshake.
    pub fn with_init_commands(mut self, commands: Vec<String>) -> Self {
        self.init_commands = commands;
        self
    }
}

#[async_trait]
impl ConnectionFactory for DeviceFactory {
    async fn open(
        &self,
        path: &str,
        options: &NormalizedPortOptions,
    ) -> Result<Arc<dyn Connection>, Error> {
        if let Some(name) = path.strip_prefix("mock:") {
            debug!(%name, "opening mock connection");
            return Ok(mock::MockConnection::builder(name).build());
        }

        if path == "disabled" {
            debug!("opening disabled connection");
            return Ok(Arc::new(disabled::DisabledConnection::new()));
        }

        let connection = serial::SerialConnectionBuilder::new(path, *options)
            .init_commands(self.init_commands.clone())
            .open()?;

        Ok(Arc::new(connection))
    }
}

/// The event side shared by every connection variant.
///
/// Wraps a broadcast channel whose sender can be dropped exactly once, so
/// that closing a connection is observable downstream as end-of-stream
/// rather than as silence.
pub(crate) struct EventHub {
    sender: Mutex<Option<broadcast::Sender<DeviceEvent>>>,
    subscriptions: Mutex<HashSet<SubscriptionId>>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);

        Self {
            sender: Mutex::new(Some(sender)),
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> (SubscriptionId, broadcast::Receiver<DeviceEvent>) {
        let id = SubscriptionId::new();

        let receiver = match &*self.sender.lock().expect("event hub lock poisoned") {
            Some(sender) => sender.subscribe(),
            None => {
                // Already closed. Hand out a receiver which immediately
                // reports end-of-stream.
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        };

        self.subscriptions
            .lock()
            .expect("subscription set lock poisoned")
            .insert(id);

        (id, receiver)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .expect("subscription set lock poisoned")
            .remove(&id);
    }

    pub(crate) fn publish(&self, event: DeviceEvent) {
        if let Some(sender) = &*self.sender.lock().expect("event hub lock poisoned") {
            match sender.send(event) {
                Ok(listeners) => trace!("event delivered to {listeners} listener(s)"),
                // No live receivers; nothing to deliver to.
                Err(_) => trace!("event had no listeners"),
            }
        }
    }

    /// Drop the sender. Every receiver observes end-of-stream once it has
    /// drained. Idempotent.
    pub(crate) fn close(&self) {
        self.sender.lock().expect("event hub lock poisoned").take();
        self.subscriptions
            .lock()
            .expect("subscription set lock poisoned")
            .clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .expect("event hub lock poisoned")
            .is_none()
    }
}
