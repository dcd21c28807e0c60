//! Integration tests for the crates.io version resolver
//!
//! A local wiremock server stands in for the registry API.

use rax_core::errors::ToolError;
use rax_core::registry::{CratesIoResolver, VersionResolver};
use rax_core::retry::RetryPolicy;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: false,
    }
}

fn crate_body(stable: Option<&str>, newest: &str) -> serde_json::Value {
    json!({
        "crate": {
            "name": "cargo-shear",
            "max_stable_version": stable,
            "newest_version": newest,
            "max_version": newest,
        },
        "versions": []
    })
}

#[tokio::test]
async fn test_resolves_max_stable_version() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/crates/cargo-shear"))
        .and(header_exists("user-agent"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(crate_body(Some("1.1.0"), "1.2.0-rc.1")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let resolver = CratesIoResolver::with_base_url(server.uri()).unwrap();
    let version = resolver.latest_version("cargo-shear").await.unwrap();
    assert_eq!(version, "1.1.0");
}

#[tokio::test]
async fn test_falls_back_to_newest_version() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/crates/cargo-shear"))
        .respond_with(ResponseTemplate::new(200).set_body_json(crate_body(None, "0.1.0-alpha.2")))
        .mount(&server)
        .await;

    let resolver = CratesIoResolver::with_base_url(server.uri()).unwrap();
    assert_eq!(
        resolver.latest_version("cargo-shear").await.unwrap(),
        "0.1.0-alpha.2"
    );
}

#[tokio::test]
async fn test_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/crates/cargo-shear"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/crates/cargo-shear"))
        .respond_with(ResponseTemplate::new(200).set_body_json(crate_body(Some("1.1.0"), "1.1.0")))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = CratesIoResolver::with_base_url(server.uri())
        .unwrap()
        .with_retry(fast_retries());
    assert_eq!(resolver.latest_version("cargo-shear").await.unwrap(), "1.1.0");
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/crates/cargo-nothing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = CratesIoResolver::with_base_url(server.uri())
        .unwrap()
        .with_retry(fast_retries());
    let err = resolver.latest_version("cargo-nothing").await.unwrap_err();
    match err {
        ToolError::VersionResolution { name, message } => {
            assert_eq!(name, "cargo-nothing");
            assert!(message.contains("404"), "message: {}", message);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/crates/cargo-shear"))
        .respond_with(ResponseTemplate::new(429))
        .expect(4)
        .mount(&server)
        .await;

    let resolver = CratesIoResolver::with_base_url(server.uri())
        .unwrap()
        .with_retry(fast_retries());
    assert!(resolver.latest_version("cargo-shear").await.is_err());
}
