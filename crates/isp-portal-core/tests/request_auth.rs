mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{token_for, Harness};
use isp_portal_core::api::{ApiError, IDENTITY_PATH, INVOICES_PATH, LOGIN_PATH, USAGE_PATH};
use isp_portal_core::auth::{AuthError, Confirmation, Credential, Identity, TokenValidator, TOKEN_KEY};
use isp_portal_core::storage::StorageBackend;

async fn signed_in(harness: &Harness, username: &str) -> String {
    let token = token_for(username, 3600);
    harness
        .store
        .save(Credential::new(token.clone(), Identity::new(username)))
        .await;
    token
}

fn count_failures(harness: &Harness) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    harness.store.events().subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[tokio::test]
async fn login_response_saves_credential() {
    let server = MockServer::start().await;
    let token = token_for("u1", 3600);
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .and(body_json(json!({"username": "u1", "password": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "token": token,
            "user": {"username": "u1", "firstname": "Sami", "email": "u1@example.com"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    let (token_back, identity) = harness
        .api
        .login("u1", "secret")
        .await
        .unwrap()
        .into_parts("u1")
        .unwrap();
    assert_eq!(token_back, token);
    assert_eq!(identity.first_name.as_deref(), Some("Sami"));
}

#[tokio::test]
async fn refused_login_surfaces_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "success": false,
            "message": "Invalid credentials"
        })))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    let response = harness.api.login("u1", "wrong").await.unwrap();
    assert_eq!(
        response.into_parts("u1").unwrap_err(),
        AuthError::LoginFailed("Invalid credentials".to_string())
    );
}

#[tokio::test]
async fn requests_without_credential_never_reach_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    let result = harness.api.fetch_identity().await;
    assert!(matches!(result, Err(ApiError::NotAuthenticated)));
}

#[tokio::test]
async fn bearer_token_is_attached_and_envelope_unwrapped() {
    let server = MockServer::start().await;
    let harness = Harness::new(&server);
    let token = signed_in(&harness, "u1").await;

    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"username": "u1", "lastname": "Haddad"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let identity = harness.api.fetch_identity().await.unwrap();
    assert_eq!(identity.username, "u1");
    assert_eq!(identity.last_name.as_deref(), Some("Haddad"));
}

#[tokio::test]
async fn unauthorized_response_clears_before_returning() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(USAGE_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    signed_in(&harness, "u1").await;
    let failures = count_failures(&harness);

    let result = harness.api.fetch_usage().await;
    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert!(harness.store.current().await.is_none());
    assert!(harness.primary.get(TOKEN_KEY).await.unwrap().is_none());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_unauthorized_calls_clear_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(50)))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    signed_in(&harness, "u1").await;
    let failures = count_failures(&harness);

    let (a, b, c) = tokio::join!(
        harness.api.fetch_identity(),
        harness.api.fetch_usage(),
        harness.api.fetch_invoices()
    );
    assert!(a.is_err() && b.is_err() && c.is_err());
    assert!(harness.store.current().await.is_none());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_token_body_is_treated_as_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INVOICES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "error": "Token expired"
        })))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    signed_in(&harness, "u1").await;
    let failures = count_failures(&harness);

    let result = harness.api.fetch_invoices().await;
    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert!(harness.store.current().await.is_none());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_token_body_spares_credential_saved_in_flight() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INVOICES_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": false, "error": "Invalid token"}))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    signed_in(&harness, "u1").await;
    let failures = count_failures(&harness);

    let relogin = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        signed_in(&harness, "u2").await
    };
    let (result, fresh_token) = tokio::join!(harness.api.fetch_invoices(), relogin);

    assert!(matches!(result, Err(ApiError::Unauthorized)));
    let current = harness.store.current().await.unwrap();
    assert_eq!(current.username(), "u2");
    assert_eq!(current.token(), fresh_token);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rate_limited_request_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(USAGE_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(USAGE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "username": "u1",
            "service": "Home 20M",
            "package_gb": 100.0,
            "used_gb": 25.5,
            "remaining_gb": 74.5,
            "expiration": "2099-01-01"
        })))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    signed_in(&harness, "u1").await;

    let usage = harness.api.fetch_usage().await.unwrap();
    assert_eq!(usage.remaining_gb, 74.5);
    assert!(harness.store.is_authenticated().await);
}

#[tokio::test]
async fn server_error_keeps_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    signed_in(&harness, "u1").await;

    let result = harness.api.fetch_identity().await;
    assert!(matches!(result, Err(ApiError::ServerError(_))));
    assert!(harness.store.is_authenticated().await);
}

#[tokio::test]
async fn dashboard_tolerates_partial_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"username": "u1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(USAGE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(INVOICES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": [
                {"id": 1, "date": "2026-01-01", "price": "20", "paymode": 2, "service": "Home 20M"},
                {"id": 2, "date": "2026-02-01", "price": "20", "paymode": 0, "service": "Home 20M"}
            ]
        })))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    signed_in(&harness, "u1").await;

    let dashboard = harness.api.dashboard().await.unwrap();
    assert_eq!(dashboard.identity.unwrap().username, "u1");
    assert!(dashboard.usage.is_none());
    assert_eq!(dashboard.warnings.len(), 1);
    assert_eq!(dashboard.invoices.len(), 2);
    assert_eq!(dashboard.unpaid_invoices.len(), 1);
    assert_eq!(dashboard.unpaid_invoices[0].id, 2);
}

#[tokio::test]
async fn dashboard_fails_on_any_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INVOICES_PATH))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"username": "u1"})))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    signed_in(&harness, "u1").await;

    let result = harness.api.dashboard().await;
    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert!(!harness.store.is_authenticated().await);
}

#[tokio::test]
async fn confirmation_timeout_keeps_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"username": "u1"}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let harness = Harness::with_timeout(&server, Duration::from_millis(200));
    let token = signed_in(&harness, "u1").await;

    let confirmation = harness.validator.confirm_with_server(&token).await;
    assert!(matches!(confirmation, Confirmation::Indeterminate(_)));
    assert_eq!(harness.store.current().await.unwrap().token(), token);
}

#[tokio::test]
async fn confirmation_rejection_clears_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    let token = signed_in(&harness, "u1").await;

    let confirmation = harness.validator.confirm_with_server(&token).await;
    assert_eq!(confirmation, Confirmation::Rejected { status: 401 });
    assert!(harness.store.load().await.is_none());
}

#[tokio::test]
async fn confirmation_success_returns_server_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(IDENTITY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"username": "u1", "email": "u1@example.com"}
        })))
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    let token = signed_in(&harness, "u1").await;
    assert!(TokenValidator::is_structurally_valid(&token));

    match harness.validator.confirm_with_server(&token).await {
        Confirmation::Confirmed(identity) => {
            assert_eq!(identity.email.as_deref(), Some("u1@example.com"))
        }
        other => panic!("expected confirmation, got {:?}", other),
    }
}
