//! Vast.ai adapter against a mock HTTP server

use aimad::config::VastConfig;
use aimad::provider::{AdapterError, BootParams, GpuProvider, ObservedState};
use aimad::types::ResourceProfile;
use std::collections::HashMap;

fn config(base: &str) -> VastConfig {
    VastConfig {
        api_key: "vast-key".to_string(),
        api_base: base.to_string(),
        ..VastConfig::default()
    }
}

fn profile() -> ResourceProfile {
    ResourceProfile {
        gpu_model: "RTX 4090".to_string(),
        gpu_count: 1,
        memory_mb: 16_384,
        disk_gb: None,
    }
}

fn boot() -> BootParams {
    BootParams {
        image: "aima/inference-worker:latest".to_string(),
        bootstrap_token: "tok-1".to_string(),
        env: HashMap::new(),
    }
}

const BUNDLES: &str = r#"{
    "offers": [
        {"id": 101, "gpu_name": "RTX 4090", "num_gpus": 1, "cpu_cores": 16,
         "cpu_ram": 65536, "disk_space": 200.0, "dph_total": 0.42,
         "geolocation": "Sweden", "rentable": true},
        {"id": 102, "gpu_name": "RTX 4090", "num_gpus": 1, "cpu_cores": 8,
         "cpu_ram": 32768, "disk_space": 100.0, "dph_total": 0.35,
         "geolocation": "Poland", "rentable": true},
        {"id": 103, "gpu_name": "RTX 4090", "num_gpus": 1, "cpu_cores": 8,
         "cpu_ram": 32768, "disk_space": 100.0, "dph_total": 0.20,
         "geolocation": "Norway", "rentable": false}
    ]
}"#;

#[tokio::test]
async fn offers_are_parsed_and_unrentable_asks_dropped() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/bundles")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(BUNDLES)
        .create_async()
        .await;

    let provider = aimad::providers::vast::VastProvider::new(&config(&server.url())).unwrap();
    let offers = provider.list_offers(&profile()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(offers.len(), 2);
    assert!(offers.iter().all(|o| o.gpu_model == "RTX 4090"));
    let cheapest = offers.iter().map(|o| o.hourly_rate_cents).min().unwrap();
    assert_eq!(cheapest, 35);
}

#[tokio::test]
async fn create_accepts_the_cheapest_matching_ask() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/bundles")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(BUNDLES)
        .create_async()
        .await;
    let accept = server
        .mock("PUT", "/asks/102/")
        .with_status(200)
        .with_body(r#"{"new_contract": 555123}"#)
        .create_async()
        .await;

    let provider = aimad::providers::vast::VastProvider::new(&config(&server.url())).unwrap();
    let offers = provider.list_offers(&profile()).await.unwrap();
    let cheapest = offers
        .iter()
        .min_by_key(|o| o.hourly_rate_cents)
        .unwrap()
        .clone();

    let id = provider.create_instance(&cheapest, &boot()).await.unwrap();
    accept.assert_async().await;
    assert_eq!(id, "555123");
}

#[tokio::test]
async fn observe_maps_states_and_address() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/instances/555123")
        .with_status(200)
        .with_body(
            r#"{"instances": {"id": 555123, "actual_status": "running",
                "public_ipaddr": "93.184.216.34",
                "ports": {"9400/tcp": [{"HostIp": "93.184.216.34", "HostPort": "41234"}]},
                "start_date": 1755000000.0}}"#,
        )
        .create_async()
        .await;

    let provider = aimad::providers::vast::VastProvider::new(&config(&server.url())).unwrap();
    let observation = provider.observe_instance("555123").await.unwrap();
    assert_eq!(observation.state, ObservedState::Running);
    assert_eq!(
        observation.external_address.as_deref(),
        Some("93.184.216.34:41234")
    );
    assert!(observation.started_at.is_some());
}

#[tokio::test]
async fn observe_of_missing_instance_reads_stopped() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/instances/404404")
        .with_status(404)
        .create_async()
        .await;

    let provider = aimad::providers::vast::VastProvider::new(&config(&server.url())).unwrap();
    let observation = provider.observe_instance("404404").await.unwrap();
    assert_eq!(observation.state, ObservedState::Stopped);
}

#[tokio::test]
async fn server_errors_are_retryable_auth_errors_fatal() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/bundles")
        .match_query(mockito::Matcher::Any)
        .with_status(502)
        .create_async()
        .await;

    let provider = aimad::providers::vast::VastProvider::new(&config(&server.url())).unwrap();
    match provider.list_offers(&profile()).await {
        Err(AdapterError::Retryable(_)) => {}
        other => panic!("expected retryable, got {other:?}"),
    }

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/bundles")
        .match_query(mockito::Matcher::Any)
        .with_status(401)
        .create_async()
        .await;
    let provider = aimad::providers::vast::VastProvider::new(&config(&server.url())).unwrap();
    match provider.list_offers(&profile()).await {
        Err(AdapterError::Fatal(_)) => {}
        other => panic!("expected fatal, got {other:?}"),
    }
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("DELETE", "/instances/555123/")
        .with_status(404)
        .create_async()
        .await;

    let provider = aimad::providers::vast::VastProvider::new(&config(&server.url())).unwrap();
    assert!(provider.terminate_instance("555123").await.is_ok());
}
