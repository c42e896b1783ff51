//! The disabled connection variant.
//!
//! Accepts every operation and produces no events. Installed when an
//! operator wants the service up with the sensor deliberately off.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Connection, EventHub, SubscriptionId};
use crate::{device::DeviceEvent, error::Error};

/// A connection to nothing.
pub struct DisabledConnection {
    hub: EventHub,
    closed: CancellationToken,
}

impl DisabledConnection {
    /// Create a disabled connection.
    pub fn new() -> Self {
        Self {
            hub: EventHub::new(1),
            closed: CancellationToken::new(),
        }
    }
}

impl Default for DisabledConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for DisabledConnection {
    fn subscribe(&self) -> (SubscriptionId, broadcast::Receiver<DeviceEvent>) {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id);
    }

    async fn send_command(&self, command: &str) -> Result<(), Error> {
        debug!(%command, "command dropped, connection is disabled");
        Ok(())
    }

    async fn initialize(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn monitor(&self, cancel: CancellationToken) -> Result<(), Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.closed.cancelled() => Ok(()),
        }
    }

    fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({ "variant": "disabled" })
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        self.hub.close();

        Ok(())
    }
}
