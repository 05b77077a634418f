//! Integration tests for the Provisioning Client against a mocked panel
//! API (wiremock).
//!
//! Run with: cargo test --test provision_client_test

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sshgate::provision::{ProvisioningClient, ProvisioningRequest, ProvisioningResult, RetryPolicy};

const ENDPOINT: &str = "/test_ssh_public";

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        add_jitter: false,
    }
}

fn client_for(server: &MockServer, max_retries: u32, timeout: Duration) -> ProvisioningClient {
    ProvisioningClient::with_policy(&format!("{}{}", server.uri(), ENDPOINT), timeout, fast_policy(max_retries))
        .unwrap()
}

#[tokio::test]
async fn success_parses_account_details_and_sends_expected_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .and(body_partial_json(json!({
            "store_owner_id": 1,
            "user_id": 7,
            "username": "tg7",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Usuario": "trial-7",
            "Senha": "s3cret",
            "Expiracao": "3h",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, 2, Duration::from_secs(2));
    let request = ProvisioningRequest::new(7, "tg7".to_string());

    match client.provision(&request).await {
        ProvisioningResult::Success { details } => {
            assert_eq!(details.username.as_deref(), Some("trial-7"));
            assert_eq!(details.password.as_deref(), Some("s3cret"));
            assert_eq!(details.expires.as_deref(), Some("3h"));
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn client_error_is_terminal_and_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(403).set_body_string("user already has an account"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, 3, Duration::from_secs(2));
    let result = client.provision(&ProvisioningRequest::new(1, "tg1".to_string())).await;

    match result {
        ProvisioningResult::RemoteError { code, message } => {
            assert_eq!(code, 403);
            assert!(message.contains("already has an account"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn server_error_is_retried_until_budget_is_spent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(503))
        .expect(3) // 1 attempt + 2 retries
        .mount(&server)
        .await;

    let client = client_for(&server, 2, Duration::from_secs(2));
    let result = client.provision(&ProvisioningRequest::new(1, "tg1".to_string())).await;

    assert!(matches!(result, ProvisioningResult::Transient { .. }));
}

#[tokio::test]
async fn retry_after_hint_is_surfaced_when_retries_are_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "7"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, 0, Duration::from_secs(2));
    let result = client.provision(&ProvisioningRequest::new(1, "tg1".to_string())).await;

    assert_eq!(
        result,
        ProvisioningResult::Transient {
            retry_after: Some(Duration::from_secs(7))
        }
    );
}

#[tokio::test]
#[serial]
async fn oversized_retry_after_hint_is_capped_at_max_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "5"))
        .expect(2) // 1 attempt + 1 retry, without honoring the 5s hint
        .mount(&server)
        .await;

    // max_delay in fast_policy is 50ms; the 5s hint must not override it.
    let client = client_for(&server, 1, Duration::from_secs(2));
    let started = Instant::now();
    let result = client.provision(&ProvisioningRequest::new(1, "tg1".to_string())).await;

    assert_eq!(
        result,
        ProvisioningResult::Transient {
            retry_after: Some(Duration::from_secs(5))
        }
    );
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
#[serial]
async fn timeout_is_terminal_and_reported_promptly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"Usuario": "late"}))
                .set_delay(Duration::from_secs(10)),
        )
        .expect(1) // no silent retry after a timeout
        .mount(&server)
        .await;

    let client = client_for(&server, 3, Duration::from_millis(300));
    let started = Instant::now();
    let result = client.provision(&ProvisioningRequest::new(1, "tg1".to_string())).await;

    assert_eq!(result, ProvisioningResult::Timeout);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn unusable_success_body_is_a_remote_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, 2, Duration::from_secs(2));
    let result = client.provision(&ProvisioningRequest::new(1, "tg1".to_string())).await;

    assert!(matches!(result, ProvisioningResult::RemoteError { code: 200, .. }));
}
