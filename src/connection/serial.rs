//! The serial connection variant.
//!
//! Unlike an endpoint which owns its I/O task, the I/O loop here runs inside
//! [`Connection::monitor`] so the manager's supervising task decides when the
//! loop runs and observes how it ends.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{lines::LinesCodec, Connection, EventHub, SubscriptionId};
use crate::{
    device::{DeviceEvent, DeviceMessageBytes},
    error::Error,
    options::NormalizedPortOptions,
};

/// How many events a subscriber may fall behind before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Builder for a [`SerialConnection`].
#[derive(Debug)]
pub struct SerialConnectionBuilder {
    path: String,
    options: NormalizedPortOptions,
    init_commands: Vec<String>,
    codec: LinesCodec,
}

impl SerialConnectionBuilder {
    /// Start a new builder.
    /// The path should likely be along the lines of `/dev/ttyUSB0` on unix,
    /// and `COMx` on Windows.
    pub fn new(path: &str, options: NormalizedPortOptions) -> Self {
        Self {
            path: path.to_string(),
            options,
            init_commands: vec![],
            codec: LinesCodec::default(),
        }
    }

    /// Command lines `initialize` queues for the device.
    pub fn init_commands(mut self, commands: Vec<String>) -> Self {
        self.init_commands = commands;
        self
    }

    /// Open the port.
    ///
    /// The port is opened here so a bad path or a busy port fails the open,
    /// not the first `monitor` call.
    pub fn open(self) -> Result<SerialConnection, Error> {
        info!(path = %self.path, options = %self.options, "opening serial port");

        let stream = open_stream(&self.path, &self.options)?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        Ok(SerialConnection {
            path: self.path,
            codec: self.codec,
            options: self.options,
            init_commands: self.init_commands,
            hub: EventHub::new(EVENT_CHANNEL_CAPACITY),
            outgoing_tx,
            outgoing_rx: Mutex::new(outgoing_rx),
            stream: StdMutex::new(Some(stream)),
            closed: CancellationToken::new(),
        })
    }
}

fn open_stream(path: &str, options: &NormalizedPortOptions) -> Result<SerialStream, Error> {
    tokio_serial::new(path, options.baud_rate)
        .data_bits(options.data_bits)
        .stop_bits(options.stop_bits)
        .parity(options.parity)
        .open_native_async()
        .map_err(|e| Error::Open(format!("could not open port at {path}: {e}")))
}

/// A live serial port.
///
/// Commands queue on an unbounded channel and are drained onto the wire by
/// `monitor`; frames read from the wire are published to subscribers.
pub struct SerialConnection {
    path: String,
    options: NormalizedPortOptions,
    codec: LinesCodec,
    init_commands: Vec<String>,

    hub: EventHub,

    outgoing_tx: mpsc::UnboundedSender<DeviceMessageBytes>,
    outgoing_rx: Mutex<mpsc::UnboundedReceiver<DeviceMessageBytes>>,

    // The stream opened by the builder, taken by the first `monitor` call.
    // Later calls re-open the port.
    stream: StdMutex<Option<SerialStream>>,

    closed: CancellationToken,
}

impl SerialConnection {
    fn queue_line(&self, line: &str) -> Result<(), Error> {
        if self.hub.is_closed() {
            return Err(Error::Unavailable(format!(
                "connection to {} is closed",
                self.path
            )));
        }

        self.outgoing_tx
            .send(line.as_bytes().to_vec())
            .map_err(|e| Error::Device(format!("command queue gone: {e}")))
    }

    fn take_or_reopen_stream(&self) -> Result<SerialStream, Error> {
        let held = self
            .stream
            .lock()
            .expect("serial stream lock poisoned")
            .take();

        match held {
            Some(stream) => Ok(stream),
            None => {
                debug!(path = %self.path, "re-opening serial port");
                open_stream(&self.path, &self.options)
            }
        }
    }
}

#[async_trait]
impl Connection for SerialConnection {
    fn subscribe(&self) -> (SubscriptionId, broadcast::Receiver<DeviceEvent>) {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id);
    }

    async fn send_command(&self, command: &str) -> Result<(), Error> {
        trace!(%command, "queueing command");
        self.queue_line(command)
    }

    async fn initialize(&self) -> Result<(), Error> {
        for command in &self.init_commands {
            debug!(%command, "queueing init command");
            self.queue_line(command)?;
        }

        Ok(())
    }

    async fn monitor(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut outgoing = self
            .outgoing_rx
            .try_lock()
            .map_err(|_| Error::Device("monitor is already running".into()))?;

        if self.closed.is_cancelled() {
            return Ok(());
        }

        let stream = self.take_or_reopen_stream()?;

        // Sink: send things (to serial port), stream: receive things
        // (from serial port).
        let (mut sink, mut frames) = self.codec.clone().framed(stream).split();

        info!(path = %self.path, "monitoring serial port");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.closed.cancelled() => return Ok(()),
                message = outgoing.recv() => match message {
                    Some(bytes) => match sink.send(bytes.clone()).await {
                        Ok(()) => self.hub.publish(DeviceEvent::ToWire(bytes)),
                        Err(e) => {
                            return Err(Error::Device(format!(
                                "write to {} failed: {e}",
                                self.path
                            )))
                        }
                    },
                    // All senders gone; nothing left to drive.
                    None => return Ok(()),
                },
                frame = frames.next() => match frame {
                    Some(Ok(bytes)) => {
                        trace!("frame from port: `{:?}`", &bytes[..bytes.len().min(32)]);
                        self.hub.publish(DeviceEvent::FromWire(bytes));
                    }
                    Some(Err(e)) => {
                        return Err(Error::Device(format!(
                            "read from {} failed: {e}",
                            self.path
                        )))
                    }
                    None => {
                        return Err(Error::Device(format!("serial stream {} ended", self.path)))
                    }
                },
            }
        }
    }

    fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "variant": "serial",
            "path": self.path,
            "options": self.options.to_string(),
        })
    }

    async fn close(&self) -> Result<(), Error> {
        debug!(path = %self.path, "closing serial connection");

        // Ends a running monitor cleanly; an unused stream is dropped here,
        // releasing the port either way.
        self.closed.cancel();
        self.stream
            .lock()
            .expect("serial stream lock poisoned")
            .take();
        self.hub.close();

        Ok(())
    }
}
