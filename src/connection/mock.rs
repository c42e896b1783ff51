//! A mock connection, useful to exercise the manager and fanout without
//! actual radar hardware.
//!
//! Commands are looped back: each line queued for the wire is published as
//! both put-on-wire and received-from-wire, emulating a per-line echo.
//! Unsolicited sensor output can be injected with [`MockConnection::inject`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Connection, EventHub, SubscriptionId};
use crate::{
    device::{DeviceEvent, DeviceMessageBytes},
    error::Error,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Builder for a [`MockConnection`].
#[derive(Debug, Default)]
pub struct MockBuilder {
    name: String,
    fail_initialize: bool,
    monitor_error: Option<String>,
}

impl MockBuilder {
    /// Start a new builder.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Make `initialize` fail.
    pub fn fail_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Make `monitor` return the given device error instead of idling.
    pub fn monitor_error(mut self, message: &str) -> Self {
        self.monitor_error = Some(message.to_string());
        self
    }

    /// Build the mock.
    #[must_use]
    pub fn build(self) -> Arc<MockConnection> {
        info!(name = %self.name, "running mock connection");

        Arc::new(MockConnection {
            name: self.name,
            fail_initialize: self.fail_initialize,
            monitor_error: self.monitor_error,
            hub: EventHub::new(EVENT_CHANNEL_CAPACITY),
            closed: CancellationToken::new(),
            close_calls: AtomicUsize::new(0),
            initialize_calls: AtomicUsize::new(0),
            monitor_calls: AtomicUsize::new(0),
        })
    }
}

/// The loopback test double.
pub struct MockConnection {
    name: String,
    fail_initialize: bool,
    monitor_error: Option<String>,

    hub: EventHub,
    closed: CancellationToken,

    close_calls: AtomicUsize,
    initialize_calls: AtomicUsize,
    monitor_calls: AtomicUsize,
}

impl MockConnection {
    /// Start building a mock.
    pub fn builder(name: &str) -> MockBuilder {
        MockBuilder::new(name)
    }

    /// The mock's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish unsolicited sensor output, as if it arrived from the wire.
    pub fn inject(&self, bytes: DeviceMessageBytes) {
        self.hub.publish(DeviceEvent::FromWire(bytes));
    }

    /// How many times `close` has been called.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// How many times `initialize` has been called.
    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// How many times `monitor` has been called.
    pub fn monitor_calls(&self) -> usize {
        self.monitor_calls.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.hub.is_closed() {
            Err(Error::Unavailable(format!(
                "mock connection `{}` is closed",
                self.name
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn subscribe(&self) -> (SubscriptionId, broadcast::Receiver<DeviceEvent>) {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id);
    }

    async fn send_command(&self, command: &str) -> Result<(), Error> {
        self.ensure_open()?;

        // Loopback: every line is echoed back as sensor output.
        for line in command.lines() {
            let line = line.as_bytes().to_vec();

            self.hub.publish(DeviceEvent::ToWire(line.clone()));
            self.hub.publish(DeviceEvent::FromWire(line));
        }

        Ok(())
    }

    async fn initialize(&self) -> Result<(), Error> {
        self.ensure_open()?;
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_initialize {
            return Err(Error::Init(format!(
                "mock connection `{}` was built to fail its handshake",
                self.name
            )));
        }

        Ok(())
    }

    async fn monitor(&self, cancel: CancellationToken) -> Result<(), Error> {
        self.monitor_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = &self.monitor_error {
            return Err(Error::Device(message.clone()));
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.closed.cancelled() => Ok(()),
        }
    }

    fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "variant": "mock",
            "name": self.name,
        })
    }

    async fn close(&self) -> Result<(), Error> {
        debug!(name = %self.name, "closing mock connection");

        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        self.hub.close();

        Ok(())
    }
}
