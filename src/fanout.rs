//! Bridges the active connection's event stream onto the persistent
//! subscriber queues.
//!
//! Subscriber lifetime is decoupled from connection lifetime: when a reload
//! swaps the connection, the upstream stream ends and this task reattaches
//! to whatever is active next, while every subscriber keeps its queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    connection::{Connection, SubscriptionId},
    device::DeviceEvent,
    manager::{SharedState, SharedSubscribers, SubscriberId},
};

/// How long to wait before looking for a connection again.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Pause between the upstream ending and reattaching, so a swap in
/// progress has a moment to install its connection.
const REATTACH_DELAY: Duration = Duration::from_millis(50);

struct Upstream {
    id: SubscriptionId,
    events: broadcast::Receiver<DeviceEvent>,
    connection: Arc<dyn Connection>,
}

/// The fanout engine. One per manager, run as a single background task.
pub(crate) struct EventFanout {
    /// Read accessor into the manager's state. The fanout never owns the
    /// manager.
    state: SharedState,

    subscribers: SharedSubscribers,

    shutdown: CancellationToken,
}

impl EventFanout {
    pub(crate) fn new(
        state: SharedState,
        subscribers: SharedSubscribers,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            subscribers,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let mut upstream: Option<Upstream> = None;

        loop {
            let Some(attached) = upstream.as_mut() else {
                let connection = {
                    let state = self.state.read().await;

                    if state.closed {
                        break;
                    }

                    state.connection.clone()
                };

                match connection {
                    Some(connection) => {
                        let (id, events) = connection.subscribe();
                        debug!(%id, "attached to connection event stream");

                        upstream = Some(Upstream {
                            id,
                            events,
                            connection,
                        });
                    }
                    None => {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(IDLE_POLL) => {}
                        }
                    }
                }

                continue;
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = attached.events.recv() => match event {
                    Ok(event) => self.fan_out(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "fanout lagged behind connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // The normal path after a reload swapped the
                        // connection out.
                        debug!("connection event stream ended, reattaching");
                        attached.connection.unsubscribe(attached.id);
                        upstream = None;

                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(REATTACH_DELAY) => {}
                        }
                    }
                },
            }
        }

        if let Some(attached) = upstream.take() {
            attached.connection.unsubscribe(attached.id);
        }

        self.close_all_queues();

        debug!("event fanout stopped");
    }

    /// Deliver one event to every registered subscriber without ever
    /// blocking on a slow one. A full queue drops the event for that
    /// subscriber only.
    fn fan_out(&self, event: DeviceEvent) {
        let queues: Vec<(SubscriberId, mpsc::Sender<DeviceEvent>)> = self
            .subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .iter()
            .map(|(id, queue)| (*id, queue.clone()))
            .collect();

        for (id, queue) in queues {
            match queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%id, "subscriber queue full, dropping event");
                }
                // Receiver already gone; unsubscribe cleans the entry up.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn close_all_queues(&self) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("subscriber registry lock poisoned");

        let count = subscribers.len();

        // Dropping the senders is what closes the queues.
        subscribers.clear();

        if count > 0 {
            debug!(count, "closed all subscriber queues");
        }
    }
}
