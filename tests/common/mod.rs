#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use radar_helm::{
    config::DeviceConfig,
    connection::{mock::MockConnection, Connection, ConnectionFactory},
    device::DeviceEvent,
    error::Error,
    manager::{ConnectionManager, ManagerBuilder},
    options::{NormalizedPortOptions, PortOptions},
    store::ConfigStore,
};

/// A device configuration with a typical sensor line setup.
pub fn device_config(id: i64, name: &str, path: &str) -> DeviceConfig {
    DeviceConfig {
        id,
        name: name.into(),
        path: path.into(),
        source: "test".into(),
        enabled: true,
        options: PortOptions {
            baud_rate: 19200,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".into(),
        },
    }
}

/// What the scripted factory should do on its next open call.
pub enum OpenOutcome {
    Connection(Arc<MockConnection>),
    Failure(String),
}

/// A factory whose open calls are scripted in advance.
///
/// With an empty script every open produces a fresh mock.
#[derive(Default)]
pub struct ScriptedFactory {
    script: Mutex<VecDeque<OpenOutcome>>,
    opened_paths: Mutex<Vec<String>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_connection(&self, connection: Arc<MockConnection>) {
        self.script
            .lock()
            .unwrap()
            .push_back(OpenOutcome::Connection(connection));
    }

    pub fn push_failure(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(OpenOutcome::Failure(message.into()));
    }

    pub fn open_count(&self) -> usize {
        self.opened_paths.lock().unwrap().len()
    }

    pub fn opened_paths(&self) -> Vec<String> {
        self.opened_paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn open(
        &self,
        path: &str,
        _options: &NormalizedPortOptions,
    ) -> Result<Arc<dyn Connection>, Error> {
        self.opened_paths.lock().unwrap().push(path.to_string());

        match self.script.lock().unwrap().pop_front() {
            Some(OpenOutcome::Connection(connection)) => Ok(connection),
            Some(OpenOutcome::Failure(message)) => Err(Error::Open(message)),
            None => Ok(MockConnection::builder(path).build()),
        }
    }
}

/// A store handing out a fixed configuration list, or a forced failure.
pub struct StaticStore {
    configurations: Mutex<Result<Vec<DeviceConfig>, String>>,
}

impl StaticStore {
    pub fn new(configurations: Vec<DeviceConfig>) -> Arc<Self> {
        Arc::new(Self {
            configurations: Mutex::new(Ok(configurations)),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            configurations: Mutex::new(Err(message.into())),
        })
    }

    pub fn set(&self, configurations: Vec<DeviceConfig>) {
        *self.configurations.lock().unwrap() = Ok(configurations);
    }
}

#[async_trait]
impl ConfigStore for StaticStore {
    async fn enabled_configurations(&self) -> Result<Vec<DeviceConfig>, Error> {
        self.configurations
            .lock()
            .unwrap()
            .clone()
            .map_err(Error::Store)
    }
}

/// A manager wired to the given doubles.
pub fn manager_with(
    factory: &Arc<ScriptedFactory>,
    store: &Arc<StaticStore>,
) -> ManagerBuilder {
    let factory: Arc<dyn ConnectionFactory> = factory.clone();
    let store: Arc<dyn ConfigStore> = store.clone();

    ConnectionManager::builder().factory(factory).store(store)
}

/// Inject probe output until the fanout delivers something, proving the
/// bridge from this mock to the given queue is up.
pub async fn wait_until_bridged(
    mock: &MockConnection,
    queue: &mut mpsc::Receiver<DeviceEvent>,
) {
    for _ in 0..200 {
        mock.inject(b"probe".to_vec());

        match tokio::time::timeout(Duration::from_millis(20), queue.recv()).await {
            Ok(Some(_)) => return,
            _ => continue,
        }
    }

    panic!("fanout never bridged the connection to the subscriber");
}

/// Receive until the given payload arrives, skipping earlier probe traffic.
pub async fn recv_until(queue: &mut mpsc::Receiver<DeviceEvent>, payload: &[u8]) {
    for _ in 0..200 {
        match tokio::time::timeout(Duration::from_secs(1), queue.recv()).await {
            Ok(Some(DeviceEvent::FromWire(bytes))) if bytes == payload => return,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("queue closed while waiting for {payload:?}"),
            Err(_) => panic!("timed out waiting for {payload:?}"),
        }
    }

    panic!("never received {payload:?}");
}

/// Drain everything currently sitting in the queue.
pub async fn drain(queue: &mut mpsc::Receiver<DeviceEvent>) {
    while tokio::time::timeout(Duration::from_millis(50), queue.recv())
        .await
        .ok()
        .flatten()
        .is_some()
    {}
}
