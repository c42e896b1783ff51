use color_eyre::Result;
use radar_helm::{
    connection::mock::MockConnection,
    error::Error,
    manager::ReloadOutcome,
    options::PortOptions,
};
use tokio_util::sync::CancellationToken;

mod common;

use common::{device_config, manager_with, ScriptedFactory, StaticStore};

#[tokio::test]
async fn reload_applies_the_enabled_configuration() -> Result<()> {
    let factory = ScriptedFactory::new();
    let store = StaticStore::new(vec![device_config(1, "lane radar", "/dev/ttyUSB0")]);
    let manager = manager_with(&factory, &store).build();

    let outcome = manager.reload_config(&CancellationToken::new()).await?;

    assert!(matches!(outcome, ReloadOutcome::Reloaded(_)));
    assert!(outcome.to_string().contains("Reloaded"));
    assert!(outcome.to_string().contains("lane radar"));
    assert_eq!(outcome.snapshot().port_path, "/dev/ttyUSB0");
    assert!(manager.is_connected().await);

    Ok(())
}

#[tokio::test]
async fn second_identical_reload_is_already_active_with_zero_churn() -> Result<()> {
    let factory = ScriptedFactory::new();
    let mock = MockConnection::builder("stable").build();
    factory.push_connection(mock.clone());

    let store = StaticStore::new(vec![device_config(1, "lane radar", "/dev/ttyUSB0")]);
    let manager = manager_with(&factory, &store).build();

    let first = manager.reload_config(&CancellationToken::new()).await?;
    assert!(matches!(first, ReloadOutcome::Reloaded(_)));

    let second = manager.reload_config(&CancellationToken::new()).await?;

    assert!(matches!(second, ReloadOutcome::AlreadyActive(_)));
    assert!(second.to_string().contains("already active"));

    // No churn: the connection was neither closed nor reopened.
    assert_eq!(factory.open_count(), 1);
    assert_eq!(mock.close_calls(), 0);
    assert!(manager.is_connected().await);

    Ok(())
}

#[tokio::test]
async fn changed_options_swap_the_connection() -> Result<()> {
    let factory = ScriptedFactory::new();
    let first_mock = MockConnection::builder("first").build();
    factory.push_connection(first_mock.clone());

    let store = StaticStore::new(vec![device_config(1, "lane radar", "/dev/ttyUSB0")]);
    let manager = manager_with(&factory, &store).build();

    manager.reload_config(&CancellationToken::new()).await?;

    // Same path, new baud rate. The port still must be closed before it is
    // reopened.
    let mut changed = device_config(1, "lane radar", "/dev/ttyUSB0");
    changed.options = PortOptions {
        baud_rate: 9600,
        ..changed.options
    };
    store.set(vec![changed]);

    let outcome = manager.reload_config(&CancellationToken::new()).await?;

    assert!(matches!(outcome, ReloadOutcome::Reloaded(_)));
    assert_eq!(first_mock.close_calls(), 1);
    assert_eq!(factory.open_count(), 2);

    Ok(())
}

#[tokio::test]
async fn factory_failure_leaves_the_manager_connectionless() -> Result<()> {
    let factory = ScriptedFactory::new();
    let first_mock = MockConnection::builder("first").build();
    factory.push_connection(first_mock.clone());
    factory.push_failure("port went away");

    let store = StaticStore::new(vec![device_config(1, "lane radar", "/dev/ttyUSB0")]);
    let manager = manager_with(&factory, &store).build();

    manager.reload_config(&CancellationToken::new()).await?;

    store.set(vec![device_config(2, "replacement", "/dev/ttyUSB1")]);

    let err = manager
        .reload_config(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Open(_)));

    // Degraded but safe: the previous connection is closed exactly once
    // and nothing is installed.
    assert_eq!(first_mock.close_calls(), 1);
    assert!(!manager.is_connected().await);

    // A later reload heals the manager.
    let outcome = manager.reload_config(&CancellationToken::new()).await?;
    assert!(matches!(outcome, ReloadOutcome::Reloaded(_)));
    assert!(manager.is_connected().await);

    Ok(())
}

#[tokio::test]
async fn handshake_failure_closes_the_fresh_connection() -> Result<()> {
    let factory = ScriptedFactory::new();
    let bad = MockConnection::builder("bad-handshake")
        .fail_initialize()
        .build();
    factory.push_connection(bad.clone());

    let store = StaticStore::new(vec![device_config(1, "lane radar", "/dev/ttyUSB0")]);
    let manager = manager_with(&factory, &store).build();

    let err = manager
        .reload_config(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Init(_)));
    assert_eq!(bad.initialize_calls(), 1);
    assert_eq!(bad.close_calls(), 1);
    assert!(!manager.is_connected().await);

    Ok(())
}

#[tokio::test]
async fn store_failure_is_a_store_error() {
    let factory = ScriptedFactory::new();
    let store = StaticStore::failing("database is down");
    let manager = manager_with(&factory, &store).build();

    let err = manager
        .reload_config(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Store(_)));
    assert!(err.to_string().contains("database is down"));
    assert_eq!(factory.open_count(), 0);
}

#[tokio::test]
async fn zero_enabled_configurations_is_its_own_error() {
    let factory = ScriptedFactory::new();
    let store = StaticStore::new(vec![]);
    let manager = manager_with(&factory, &store).build();

    let err = manager
        .reload_config(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoConfiguration));
}

#[tokio::test]
async fn invalid_persisted_options_abort_before_any_churn() {
    let factory = ScriptedFactory::new();

    let mut config = device_config(1, "lane radar", "/dev/ttyUSB0");
    config.options.parity = "mark".into();
    let store = StaticStore::new(vec![config]);

    let manager = manager_with(&factory, &store).build();

    let err = manager
        .reload_config(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(factory.open_count(), 0);
}

#[tokio::test]
async fn missing_store_is_a_configuration_error() {
    let factory: std::sync::Arc<dyn radar_helm::connection::ConnectionFactory> =
        ScriptedFactory::new();
    let manager = radar_helm::manager::ConnectionManager::builder()
        .factory(factory)
        .build();

    let err = manager
        .reload_config(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("store not configured"));
}

#[tokio::test]
async fn pre_cancelled_reload_returns_the_cancellation_error() {
    let factory = ScriptedFactory::new();
    let store = StaticStore::new(vec![device_config(1, "lane radar", "/dev/ttyUSB0")]);
    let manager = manager_with(&factory, &store).build();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = manager.reload_config(&cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(factory.open_count(), 0);
}

#[tokio::test]
async fn first_of_multiple_enabled_configurations_wins() -> Result<()> {
    let factory = ScriptedFactory::new();
    let store = StaticStore::new(vec![
        device_config(1, "first", "/dev/ttyUSB0"),
        device_config(2, "second", "/dev/ttyUSB1"),
    ]);
    let manager = manager_with(&factory, &store).build();

    let outcome = manager.reload_config(&CancellationToken::new()).await?;

    assert_eq!(outcome.snapshot().port_path, "/dev/ttyUSB0");
    assert_eq!(factory.opened_paths(), vec!["/dev/ttyUSB0".to_string()]);

    Ok(())
}
