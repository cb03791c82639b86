//! One-call process initialisation.
//!
//! Installs process globals, so this file holds a single test.

use mesh::{MeshConfig, MeshError};
use mesh_telemetry::report::MemoryTransport;
use std::sync::Arc;

#[tokio::test]
async fn test_init_wires_logging_to_reporter() {
    let transport = Arc::new(MemoryTransport::new());
    let config = MeshConfig::default().with_reporting_transport(transport.clone());

    let obs = mesh::init("checkout", config).await.unwrap();
    assert_eq!(obs.service_name(), "checkout");
    assert!(obs.reporter().is_some());
    assert!(mesh::log::handler().is_some());

    tracing::info!("not escalated");
    tracing::warn!(order_id = "o-1", "inventory low");

    // The global subscriber is already taken.
    let err = mesh::init("checkout", MeshConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Log(_)));

    obs.flush().await.unwrap();

    let events = transport.events();
    assert!(events.iter().all(|e| e.message != "not escalated"));
    let low: Vec<_> = events.iter().filter(|e| e.message == "inventory low").collect();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].extra["order_id"], "o-1");
}

#[tokio::test]
async fn test_init_rejects_empty_service_name() {
    let err = mesh::init("", MeshConfig::default()).await.unwrap_err();
    assert!(matches!(err, MeshError::Telemetry(_)));
}
