//! Adapter factory lifecycle tests

mod common;

use common::{eventually, http_connection, FakeConnector};
use mcp_hub::config::{FactoryConfig, ServerConnectionConfig, StdioConfig, StreamConfig};
use mcp_hub::core::{AdapterFactory, AdapterRequest, FactoryEvent};
use mcp_hub::transport::{AdapterStatus, HealthStatus, Protocol, ProtocolAdapter};
use mcp_hub::HubError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn factory_with(connector: Arc<FakeConnector>, config: FactoryConfig) -> Arc<AdapterFactory> {
    Arc::new(AdapterFactory::with_connector(config, connector))
}

fn factory(connector: Arc<FakeConnector>) -> Arc<AdapterFactory> {
    factory_with(connector, FactoryConfig::default())
}

#[tokio::test]
async fn test_create_adapter_registers_connected_instance() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());
    let mut events = factory.subscribe();

    let instance = factory
        .create_adapter("alpha", &http_connection("alpha"))
        .await
        .unwrap();

    assert_eq!(instance.server_id, "alpha");
    assert_eq!(instance.protocol, Protocol::Http);
    assert_eq!(instance.status, AdapterStatus::Connected);
    assert_eq!(factory.list_adapters().len(), 1);
    assert_eq!(factory.get_adapter(&instance.id).unwrap().id, instance.id);

    match events.recv().await.unwrap() {
        FactoryEvent::AdapterCreated { server_id, protocol, .. } => {
            assert_eq!(server_id, "alpha");
            assert_eq!(protocol, Protocol::Http);
        }
        other => panic!("unexpected first event: {:?}", other),
    }
}

#[tokio::test]
async fn test_stdio_block_takes_precedence() {
    let connector = FakeConnector::new();
    let factory = factory(connector);

    let connection = ServerConnectionConfig {
        stdio: Some(StdioConfig {
            command: "my-server".to_string(),
            ..Default::default()
        }),
        stream: Some(StreamConfig {
            url: "http://localhost:9000/events".to_string(),
            ..Default::default()
        }),
        http: http_connection("x").http,
    };
    let instance = factory.create_adapter("multi", &connection).await.unwrap();
    assert_eq!(instance.protocol, Protocol::Stdio);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_before_connecting() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());

    let err = factory
        .create_adapter("empty", &ServerConnectionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Configuration(_)));

    let err = factory
        .create_adapter(
            "blank",
            &ServerConnectionConfig::stdio(StdioConfig {
                command: "  ".to_string(),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Configuration(_)));
    assert_eq!(connector.created_count(), 0);
    assert!(factory.list_adapters().is_empty());
}

#[tokio::test]
async fn test_capacity_limit() {
    let connector = FakeConnector::new();
    let factory = factory_with(
        connector,
        FactoryConfig {
            max_concurrent_adapters: 2,
            ..Default::default()
        },
    );

    factory.create_adapter("a", &http_connection("a")).await.unwrap();
    factory.create_adapter("b", &http_connection("b")).await.unwrap();
    let err = factory
        .create_adapter("c", &http_connection("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Capacity(_)));
    assert_eq!(factory.list_adapters().len(), 2);
}

#[tokio::test]
async fn test_duplicate_live_adapter_is_refused() {
    let connector = FakeConnector::new();
    let factory = factory(connector);

    factory.create_adapter("a", &http_connection("a")).await.unwrap();
    let err = factory
        .create_adapter("a", &http_connection("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::InvalidRequest(_)));
    assert_eq!(factory.get_adapters_by_server("a").len(), 1);
}

#[tokio::test]
async fn test_dead_adapter_is_replaced() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());

    let first = factory.create_adapter("a", &http_connection("a")).await.unwrap();
    connector.latest("a").unwrap().set_status(AdapterStatus::Error);

    let second = factory.create_adapter("a", &http_connection("a")).await.unwrap();
    assert_ne!(first.id, second.id);
    assert!(factory.get_adapter(&first.id).is_none());
    assert_eq!(factory.get_adapters_by_server("a").len(), 1);
    assert_eq!(connector.created_count(), 2);
}

#[tokio::test]
async fn test_startup_failure_removes_adapter() {
    let connector = FakeConnector::new();
    connector.fail_start("broken");
    let factory = factory(connector.clone());

    let err = factory
        .create_adapter("broken", &http_connection("broken"))
        .await
        .unwrap_err();
    assert!(matches!(&err, HubError::Connection(m) if m.contains("server broken")));
    assert!(factory.list_adapters().is_empty());
    assert_eq!(connector.latest("broken").unwrap().stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_startup_timeout() {
    let connector = FakeConnector::new();
    connector.set_start_delay(Duration::from_secs(5));
    let factory = factory_with(
        connector,
        FactoryConfig {
            startup_timeout_secs: 1,
            ..Default::default()
        },
    );

    tokio::time::pause();
    let err = factory
        .create_adapter("slow", &http_connection("slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::RequestTimeout(_)));
    assert!(factory.list_adapters().is_empty());
}

#[tokio::test]
async fn test_requests_update_metadata() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());
    let instance = factory.create_adapter("a", &http_connection("a")).await.unwrap();

    factory
        .send_request(&instance.id, AdapterRequest::new("tools/list", None))
        .await
        .unwrap();
    let response = factory
        .send_request(&instance.id, AdapterRequest::new("bogus", None))
        .await
        .unwrap();
    assert!(response.is_error());

    connector.latest("a").unwrap().fail_calls.store(true, Ordering::SeqCst);
    let err = factory
        .send_request(&instance.id, AdapterRequest::new("tools/list", None))
        .await
        .unwrap_err();
    assert!(matches!(&err, HubError::Connection(m) if m.contains(&instance.id)));

    let snapshot = factory.get_adapter(&instance.id).unwrap();
    assert_eq!(snapshot.metadata.request_count, 3);
    assert_eq!(snapshot.metadata.error_count, 2);
    assert!(snapshot.metadata.last_error.is_some());
    assert!(snapshot.last_used_at >= instance.last_used_at);
}

#[tokio::test]
async fn test_unknown_adapter_is_not_found() {
    let factory = factory(FakeConnector::new());
    let err = factory
        .send_request("missing", AdapterRequest::new("ping", None))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NotFound(_)));
    assert!(matches!(
        factory.remove_adapter("missing").await,
        Err(HubError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_adapters_by_server() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());
    factory.create_adapter("a", &http_connection("a")).await.unwrap();
    factory.create_adapter("b", &http_connection("b")).await.unwrap();

    assert_eq!(factory.remove_adapters_by_server("a").await, 1);
    assert_eq!(factory.remove_adapters_by_server("a").await, 0);
    assert_eq!(factory.list_adapters().len(), 1);
    assert_eq!(connector.latest("a").unwrap().stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_restart_adapter_counts_restarts() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());
    let instance = factory.create_adapter("a", &http_connection("a")).await.unwrap();

    let restarted = factory.restart_adapter(&instance.id).await.unwrap();
    assert_eq!(restarted.id, instance.id);
    assert_eq!(restarted.status, AdapterStatus::Connected);
    assert_eq!(restarted.metadata.restart_count, 1);

    let adapter = connector.latest("a").unwrap();
    assert_eq!(adapter.starts.load(Ordering::SeqCst), 2);
    assert_eq!(adapter.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_restarts_serialize() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());
    let instance = factory.create_adapter("a", &http_connection("a")).await.unwrap();

    let (first, second) = tokio::join!(
        factory.restart_adapter(&instance.id),
        factory.restart_adapter(&instance.id)
    );
    assert!(first.is_ok() && second.is_ok());
    assert_eq!(
        factory.get_adapter(&instance.id).unwrap().metadata.restart_count,
        2
    );
}

#[tokio::test]
async fn test_health_check_restarts_unhealthy_adapter() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());
    let mut events = factory.subscribe();
    let instance = factory.create_adapter("a", &http_connection("a")).await.unwrap();

    let adapter = connector.latest("a").unwrap();
    adapter.healthy.store(false, Ordering::SeqCst);
    factory.check_health().await;

    let snapshot = factory.get_adapter(&instance.id).unwrap();
    assert_eq!(snapshot.metadata.restart_count, 1);
    assert_eq!(adapter.starts.load(Ordering::SeqCst), 2);

    let mut saw_failure = false;
    let mut saw_restart = false;
    while let Ok(event) = events.try_recv() {
        match event {
            FactoryEvent::HealthCheckFailed { server_id, .. } => {
                assert_eq!(server_id, "a");
                saw_failure = true;
            }
            FactoryEvent::AdapterRestarted { .. } => saw_restart = true,
            _ => {}
        }
    }
    assert!(saw_failure && saw_restart);
}

#[tokio::test]
async fn test_health_check_without_auto_restart() {
    let connector = FakeConnector::new();
    let factory = factory_with(
        connector.clone(),
        FactoryConfig {
            auto_restart: false,
            ..Default::default()
        },
    );
    let instance = factory.create_adapter("a", &http_connection("a")).await.unwrap();
    connector.latest("a").unwrap().healthy.store(false, Ordering::SeqCst);

    factory.check_health().await;

    assert_eq!(factory.get_adapter(&instance.id).unwrap().metadata.restart_count, 0);
    assert_eq!(factory.get_health(&instance.id).await.unwrap().status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_health_monitor_runs_periodically() {
    let connector = FakeConnector::new();
    let factory = factory_with(
        connector.clone(),
        FactoryConfig {
            health_check_interval_secs: 1,
            ..Default::default()
        },
    );
    let instance = factory.create_adapter("a", &http_connection("a")).await.unwrap();
    connector.latest("a").unwrap().healthy.store(false, Ordering::SeqCst);
    factory.start_health_monitor();

    let restarted = eventually(Duration::from_secs(3), || {
        factory
            .get_adapter(&instance.id)
            .map(|i| i.metadata.restart_count > 0)
            .unwrap_or(false)
    })
    .await;
    assert!(restarted);
    factory.graceful_shutdown().await;
}

#[tokio::test]
async fn test_statistics() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());
    let a = factory.create_adapter("a", &http_connection("a")).await.unwrap();
    factory
        .create_adapter(
            "b",
            &ServerConnectionConfig::stdio(StdioConfig {
                command: "server-b".to_string(),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    factory
        .send_request(&a.id, AdapterRequest::new("tools/list", None))
        .await
        .unwrap();

    let stats = factory.get_adapter_statistics();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_protocol.get(&Protocol::Http), Some(&1));
    assert_eq!(stats.by_protocol.get(&Protocol::Stdio), Some(&1));
    assert_eq!(stats.by_status.get(&AdapterStatus::Connected), Some(&2));
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_errors, 0);
}

#[tokio::test]
async fn test_server_health_without_adapter_is_unknown() {
    let factory = factory(FakeConnector::new());
    let health = factory.get_server_health("nobody").await;
    assert_eq!(health.status, HealthStatus::Unknown);
}

#[tokio::test]
async fn test_graceful_shutdown_stops_everything() {
    let connector = FakeConnector::new();
    let factory = factory(connector.clone());
    factory.start_health_monitor();
    factory.create_adapter("a", &http_connection("a")).await.unwrap();
    factory.create_adapter("b", &http_connection("b")).await.unwrap();
    let mut events = factory.subscribe();

    factory.graceful_shutdown().await;

    assert!(factory.is_shutting_down());
    assert!(factory.list_adapters().is_empty());
    for server in ["a", "b"] {
        assert_eq!(connector.latest(server).unwrap().stops.load(Ordering::SeqCst), 1);
    }

    let mut removed = 0;
    let mut shutdown = false;
    while let Ok(event) = events.try_recv() {
        match event {
            FactoryEvent::AdapterRemoved { .. } => removed += 1,
            FactoryEvent::Shutdown => shutdown = true,
            _ => {}
        }
    }
    assert_eq!(removed, 2);
    assert!(shutdown);

    let err = factory
        .create_adapter("c", &http_connection("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::ShuttingDown));

    // second call is a no-op
    factory.graceful_shutdown().await;
}

#[tokio::test]
async fn test_adapter_starting_during_shutdown_is_stopped() {
    let connector = FakeConnector::new();
    connector.set_start_delay(Duration::from_millis(150));
    let factory = factory(connector.clone());

    let create = {
        let factory = factory.clone();
        tokio::spawn(async move { factory.create_adapter("a", &http_connection("a")).await })
    };
    assert!(
        eventually(Duration::from_secs(2), || connector
            .latest("a")
            .is_some_and(|a| a.starts.load(Ordering::SeqCst) == 1))
        .await
    );

    factory.graceful_shutdown().await;
    let err = create.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::ShuttingDown));

    assert!(factory.list_adapters().is_empty());
    assert_eq!(connector.latest("a").unwrap().status(), AdapterStatus::Disconnected);
}

#[tokio::test]
async fn test_restart_racing_shutdown_leaves_adapter_stopped() {
    let connector = FakeConnector::new();
    connector.set_start_delay(Duration::from_millis(150));
    let factory = factory(connector.clone());
    let instance = factory.create_adapter("a", &http_connection("a")).await.unwrap();
    let adapter = connector.latest("a").unwrap();

    let restart = {
        let factory = factory.clone();
        tokio::spawn(async move { factory.restart_adapter(&instance.id).await })
    };
    assert!(eventually(Duration::from_secs(2), || adapter.starts.load(Ordering::SeqCst) == 2).await);

    factory.graceful_shutdown().await;
    let err = restart.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::ShuttingDown));
    assert!(factory.list_adapters().is_empty());
    assert_eq!(adapter.status(), AdapterStatus::Disconnected);
}
