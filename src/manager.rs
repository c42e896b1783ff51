//! The connection manager owns the active connection and its configuration
//! snapshot, and is the only component allowed to replace them.
//!
//! Everything else reaches the device through it: API callers delegate
//! commands, a supervising task drives [`ConnectionManager::monitor`], and
//! the background [`crate::fanout`] task bridges whichever connection is
//! active onto the persistent subscriber queues.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    config::DeviceConfig,
    connection::{Connection, ConnectionFactory},
    device::DeviceEvent,
    error::Error,
    fanout::EventFanout,
    options::NormalizedPortOptions,
    store::ConfigStore,
};

/// How often `monitor` polls while no connection is installed.
const UNBOUND_POLL: Duration = Duration::from_millis(250);

/// Backoff after the connection's I/O loop fails.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Pause after a clean I/O loop return, which happens mid-swap.
const SWAP_DELAY: Duration = Duration::from_millis(100);

/// Default capacity of each subscriber's queue.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Identifies one subscriber registered with the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The id handed out when the manager is already closed.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Whether this is the nil (closed-manager) id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable description of the configuration applied to the active
/// connection. Replaced wholesale on reload, never mutated in place.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    /// The configuration's id in the store.
    pub id: i64,

    /// Human-readable configuration name.
    pub name: String,

    /// The opened port path.
    pub port_path: String,

    /// Where the configuration came from.
    pub source: String,

    /// The applied, validated port options.
    pub options: NormalizedPortOptions,

    /// When this configuration was applied.
    pub applied_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    fn new(config: &DeviceConfig, options: NormalizedPortOptions) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            port_path: config.path.clone(),
            source: config.source.clone(),
            options,
            applied_at: Utc::now(),
        }
    }

    /// Whether this snapshot already describes the given endpoint.
    fn matches(&self, path: &str, options: &NormalizedPortOptions) -> bool {
        self.port_path == path && &self.options == options
    }
}

impl Display for ConfigSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} @ {})", self.name, self.port_path, self.options)
    }
}

/// What a successful reload did.
///
/// Failures are the error taxonomy in [`Error`]; this only distinguishes a
/// real swap from the idempotent no-op.
#[derive(Debug, Clone)]
pub enum ReloadOutcome {
    /// The active connection was swapped to the given configuration.
    Reloaded(ConfigSnapshot),

    /// The enabled configuration was already active. No connection churn
    /// happened.
    AlreadyActive(ConfigSnapshot),
}

impl ReloadOutcome {
    /// The resulting snapshot.
    pub fn snapshot(&self) -> &ConfigSnapshot {
        match self {
            ReloadOutcome::Reloaded(snapshot) => snapshot,
            ReloadOutcome::AlreadyActive(snapshot) => snapshot,
        }
    }

    /// The resulting snapshot, by value.
    pub fn into_snapshot(self) -> ConfigSnapshot {
        match self {
            ReloadOutcome::Reloaded(snapshot) => snapshot,
            ReloadOutcome::AlreadyActive(snapshot) => snapshot,
        }
    }
}

impl Display for ReloadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReloadOutcome::Reloaded(snapshot) => {
                write!(f, "Reloaded configuration {}", snapshot.name)
            }
            ReloadOutcome::AlreadyActive(snapshot) => {
                write!(f, "Configuration {} is already active", snapshot.name)
            }
        }
    }
}

/// The state guarded by the pointer lock: the active connection, its
/// snapshot, and the closed flag. Critical sections on this lock stay
/// short and never contain blocking I/O.
pub(crate) struct ManagerState {
    pub(crate) connection: Option<Arc<dyn Connection>>,
    pub(crate) snapshot: Option<ConfigSnapshot>,
    pub(crate) closed: bool,
}

pub(crate) type SharedState = Arc<RwLock<ManagerState>>;

pub(crate) type SubscriberMap = HashMap<SubscriberId, mpsc::Sender<DeviceEvent>>;

pub(crate) type SharedSubscribers = Arc<StdMutex<SubscriberMap>>;

/// Builder for a [`ConnectionManager`].
#[derive(Default)]
pub struct ManagerBuilder {
    factory: Option<Arc<dyn ConnectionFactory>>,
    store: Option<Arc<dyn ConfigStore>>,
    queue_capacity: Option<usize>,
}

impl ManagerBuilder {
    /// Set the connection factory.
    pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the configuration store.
    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Capacity of each subscriber's queue.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Build the manager and spawn its fanout task.
    #[must_use]
    pub fn build(self) -> Arc<ConnectionManager> {
        let state: SharedState = Arc::new(RwLock::new(ManagerState {
            connection: None,
            snapshot: None,
            closed: false,
        }));
        let subscribers: SharedSubscribers = Arc::new(StdMutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        // The fanout task holds read accessors only, never the manager
        // itself.
        let fanout = EventFanout::new(state.clone(), subscribers.clone(), shutdown.clone());
        tokio::spawn(fanout.run().instrument(info_span!("Fanout")));

        Arc::new(ConnectionManager {
            state,
            subscribers,
            shutdown,
            reload_lock: Mutex::new(()),
            factory: self.factory,
            store: self.store,
            queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
        })
    }
}

/// Owns the active [`Connection`] and its [`ConfigSnapshot`], and fans the
/// connection's event stream out to persistent subscribers.
pub struct ConnectionManager {
    /// Pointer lock. Guards only the connection pointer, snapshot and
    /// closed flag.
    state: SharedState,

    subscribers: SharedSubscribers,

    /// Signals the fanout task to terminate, which closes every
    /// subscriber queue.
    shutdown: CancellationToken,

    /// Serializes whole reloads, including the blocking open/close/init
    /// calls, so concurrent reloads are strictly ordered.
    reload_lock: Mutex<()>,

    factory: Option<Arc<dyn ConnectionFactory>>,
    store: Option<Arc<dyn ConfigStore>>,

    queue_capacity: usize,
}

impl ConnectionManager {
    /// Start building a manager.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    /// Register a persistent subscriber queue.
    ///
    /// If the manager is closed this is not an error: the returned queue is
    /// already at end-of-stream and the id is nil.
    pub async fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<DeviceEvent>) {
        // Inserting under the read guard excludes `close`, so a subscriber
        // either observes the closed flag or is registered in time for the
        // fanout's shutdown sweep to close its queue.
        let state = self.state.read().await;

        if state.closed {
            let (sender, receiver) = mpsc::channel(1);
            drop(sender);

            return (SubscriberId::nil(), receiver);
        }

        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = SubscriberId::new();

        self.subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .insert(id, sender);

        debug!(%id, "subscriber registered");

        (id, receiver)
    }

    /// Remove and close a subscriber's queue. Idempotent; unknown ids are
    /// a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let removed = self
            .subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .remove(&id);

        if removed.is_some() {
            debug!(%id, "subscriber removed");
        }
    }

    async fn active_connection(&self) -> Result<Arc<dyn Connection>, Error> {
        let state = self.state.read().await;

        if state.closed {
            return Err(Error::Unavailable("manager is closed".into()));
        }

        state
            .connection
            .clone()
            .ok_or_else(|| Error::Unavailable("no connection installed".into()))
    }

    /// Forward a command to the active connection.
    pub async fn send_command(&self, command: &str) -> Result<(), Error> {
        self.active_connection().await?.send_command(command).await
    }

    /// Run the active connection's handshake.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.active_connection().await?.initialize().await
    }

    /// The currently applied configuration, if any. Absent means no
    /// configuration was ever applied.
    pub async fn snapshot(&self) -> Option<ConfigSnapshot> {
        self.state.read().await.snapshot.clone()
    }

    /// Whether a connection is currently installed.
    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connection.is_some()
    }

    /// Diagnostics from the active connection, if one is installed.
    pub async fn connection_diagnostics(&self) -> serde_json::Value {
        match &self.state.read().await.connection {
            Some(connection) => connection.diagnostics(),
            None => serde_json::Value::Null,
        }
    }

    /// Supervise the active connection's I/O loop.
    ///
    /// Runs until `cancel` fires, then returns [`Error::Cancelled`]. A
    /// faulty connection is retried with a fixed backoff; a clean I/O loop
    /// return means the connection was swapped out and is re-observed
    /// shortly after. Errors are logged here, never propagated.
    pub async fn monitor(&self, cancel: CancellationToken) -> Result<(), Error> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let connection = { self.state.read().await.connection.clone() };

            let Some(connection) = connection else {
                self.pause(&cancel, UNBOUND_POLL).await?;
                continue;
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = connection.monitor(cancel.child_token()) => result,
            };

            match result {
                Ok(()) => {
                    // Clean return: the connection was swapped out under us.
                    debug!("connection i/o loop ended, re-observing");
                    self.pause(&cancel, SWAP_DELAY).await?;
                }
                Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(%e, "connection i/o loop failed, retrying");
                    self.pause(&cancel, RETRY_BACKOFF).await?;
                }
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken, duration: Duration) -> Result<(), Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Re-read persisted configuration and swap the active connection to
    /// match it.
    ///
    /// Reloads are serialized end-to-end. If the selected configuration is
    /// already active this is a no-op: no connection is closed or opened.
    /// On any failure mid-swap the manager is left connectionless, a
    /// degraded but safe state a later reload can heal.
    ///
    /// Cancellation is checked before starting; a swap is never aborted
    /// once begun.
    pub async fn reload_config(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReloadOutcome, Error> {
        let factory = self
            .factory
            .clone()
            .ok_or_else(|| Error::Configuration("connection factory not configured".into()))?;
        let store = self
            .store
            .clone()
            .ok_or_else(|| Error::Configuration("configuration store not configured".into()))?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let _reload = self.reload_lock.lock().await;

        let configurations = store.enabled_configurations().await?;

        let Some(config) = configurations.first() else {
            return Err(Error::NoConfiguration);
        };

        if configurations.len() > 1 {
            // Single-active-configuration design; no tie-break is defined.
            debug!(
                count = configurations.len(),
                "multiple enabled configurations, using the first"
            );
        }

        let options = config.options.normalize()?;

        {
            let state = self.state.read().await;

            if state.closed {
                return Err(Error::Unavailable("manager is closed".into()));
            }

            if let Some(snapshot) = &state.snapshot {
                if snapshot.matches(&config.path, &options) {
                    debug!(%snapshot, "configuration already active");
                    return Ok(ReloadOutcome::AlreadyActive(snapshot.clone()));
                }
            }
        }

        // A port can never be held open twice, even by the same logical
        // device under new settings: detach and close the previous
        // connection before opening the new one. The pointer lock is
        // released before any blocking I/O.
        let previous = { self.state.write().await.connection.take() };

        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                warn!(%e, "closing previous connection failed");
            }
        }

        let connection = match factory.open(&config.path, &options).await {
            Ok(connection) => connection,
            Err(Error::Open(problem)) => return Err(Error::Open(problem)),
            Err(other) => return Err(Error::Open(other.to_string())),
        };

        if let Err(e) = connection.initialize().await {
            if let Err(close_error) = connection.close().await {
                warn!(%close_error, "closing connection after failed handshake");
            }

            return Err(match e {
                Error::Init(problem) => Error::Init(problem),
                other => Error::Init(other.to_string()),
            });
        }

        let snapshot = ConfigSnapshot::new(config, options);

        {
            let mut state = self.state.write().await;
            state.connection = Some(connection);
            state.snapshot = Some(snapshot.clone());
        }

        info!(%snapshot, "configuration applied");

        Ok(ReloadOutcome::Reloaded(snapshot))
    }

    /// Mark the manager closed, close the active connection (best effort)
    /// and signal the fanout task to terminate, which closes all
    /// subscriber queues.
    pub async fn close(&self) -> Result<(), Error> {
        info!("closing connection manager");

        let previous = {
            let mut state = self.state.write().await;
            state.closed = true;
            state.connection.take()
        };

        if let Some(connection) = previous {
            if let Err(e) = connection.close().await {
                warn!(%e, "closing connection during shutdown failed");
            }
        }

        self.shutdown.cancel();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reload_without_factory_is_a_configuration_error() {
        let manager = ConnectionManager::builder().build();

        let err = manager
            .reload_config(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("factory not configured"));
    }

    #[tokio::test]
    async fn send_command_without_connection_is_unavailable() {
        let manager = ConnectionManager::builder().build();

        let err = manager.send_command("R?").await.unwrap_err();

        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn subscribe_after_close_yields_nil_id_and_closed_queue() {
        let manager = ConnectionManager::builder().build();
        manager.close().await.unwrap();

        let (id, mut queue) = manager.subscribe().await;

        assert!(id.is_nil());
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_command_after_close_is_unavailable() {
        let manager = ConnectionManager::builder().build();
        manager.close().await.unwrap();

        let err = manager.send_command("R?").await.unwrap_err();

        assert!(matches!(err, Error::Unavailable(_)));
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn monitor_with_pre_cancelled_token_returns_immediately() {
        let manager = ConnectionManager::builder().build();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager.monitor(cancel).await.unwrap_err();

        assert!(err.is_cancelled());
    }
}
