//! Activation against a mocked identity provider over HTTP.

use activation_server::audit::{AuditEventType, AuditLog, MemoryAuditSink};
use activation_server::registry::hash_secret;
use activation_server::{
    ActivationError, ActivationRequest, ActivationService, ActivationSettings, PersistentRegistry,
    Registration, RegistrationStatus, RegistrationStore,
};
use identity_client::IdentityClient;
use rate_limiter::{Clock, ManualClock, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SERVICE_KEY: &str = "service-key";

struct Setup {
    service: ActivationService,
    store: Arc<PersistentRegistry>,
    audit: MemoryAuditSink,
    clock: ManualClock,
}

fn setup(server: &MockServer) -> Setup {
    let client = Arc::new(
        IdentityClient::new(server.uri(), SERVICE_KEY, Duration::from_secs(5)).unwrap(),
    );
    let clock = ManualClock::default();
    let store = Arc::new(PersistentRegistry::in_memory());
    let audit = MemoryAuditSink::new();

    let service = ActivationService::new(
        store.clone(),
        Arc::new(RateLimiter::new(Arc::new(clock.clone()))),
        client.clone(),
        client,
        AuditLog::new(Arc::new(audit.clone())),
        ActivationSettings::default(),
    );

    Setup {
        service,
        store,
        audit,
        clock,
    }
}

async fn seed(setup: &Setup, email: &str, token: &str) -> String {
    let registration = Registration::new_pending(email).unwrap();
    let id = registration.id.clone();
    setup.store.insert(registration).await.unwrap();
    setup.store.approve(&id).await.unwrap();
    setup
        .store
        .attach_token(
            &id,
            &hash_secret(token),
            setup.clock.now() + chrono::Duration::hours(24),
        )
        .await
        .unwrap();
    id
}

fn request(token: &str) -> ActivationRequest {
    ActivationRequest {
        token: token.to_string(),
        client_ip: "198.51.100.20".parse().unwrap(),
        user_agent: None,
    }
}

async fn mount_profile_and_link(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(path("/rest/profiles/user-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "user_id": "user-1",
            "email": "ada@example.com",
            "onboarding_completed": false
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/profiles/user-1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/admin/generate_link"))
        .and(body_partial_json(serde_json::json!({
            "type": "magiclink",
            "email": "ada@example.com",
            "redirect_to": "/onboarding"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "action_link": "https://id.example.com/verify?token=one-time"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_activation_provisions_through_identity_provider() {
    let server = MockServer::start().await;
    let setup = setup(&server);
    let id = seed(&setup, "ada@example.com", "emailed-token").await;

    Mock::given(method("PUT"))
        .and(path(format!("/admin/users/{}", id)))
        .and(header("Authorization", "Bearer service-key"))
        .and(body_partial_json(serde_json::json!({
            "email": "ada@example.com",
            "email_confirmed": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "user-1",
            "email": "ada@example.com"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_profile_and_link(&server).await;

    let outcome = setup.service.activate(request("emailed-token")).await.unwrap();

    assert_eq!(
        outcome.credential.as_deref(),
        Some("https://id.example.com/verify?token=one-time")
    );
    assert_eq!(outcome.redirect, "/onboarding");

    let registration = setup.store.get(&id).await.unwrap().unwrap();
    assert_eq!(registration.status, RegistrationStatus::Activated);
    assert_eq!(registration.account_id.as_deref(), Some("user-1"));
    assert!(registration.activation_token_hash.is_none());

    // A repeat reports success again without creating anything new.
    let again = setup.service.activate(request("emailed-token")).await.unwrap();
    assert!(again.credential.is_none());
    assert_eq!(again.redirect, "/onboarding");
}

#[tokio::test]
async fn test_provider_outage_restores_token_for_retry() {
    let server = MockServer::start().await;
    let setup = setup(&server);
    let id = seed(&setup, "ada@example.com", "emailed-token").await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/admin/users/.+$"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let err = setup
        .service
        .activate(request("emailed-token"))
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Provisioning(_)));

    let registration = setup.store.get(&id).await.unwrap().unwrap();
    assert_eq!(registration.status, RegistrationStatus::Approved);
    assert_eq!(
        registration.activation_token_hash.as_deref(),
        Some(hash_secret("emailed-token").as_str())
    );
    assert_eq!(setup.audit.count(AuditEventType::ActivationRolledBack), 1);

    // Provider recovers; the same link works.
    Mock::given(method("PUT"))
        .and(path_regex(r"^/admin/users/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "user-1",
            "email": "ada@example.com"
        })))
        .mount(&server)
        .await;
    mount_profile_and_link(&server).await;

    let outcome = setup.service.activate(request("emailed-token")).await.unwrap();
    assert!(outcome.credential.is_some());

    let registration = setup.store.get(&id).await.unwrap().unwrap();
    assert_eq!(registration.status, RegistrationStatus::Activated);
}

#[tokio::test]
async fn test_link_generation_failure_falls_back_to_sign_in() {
    let server = MockServer::start().await;
    let setup = setup(&server);
    seed(&setup, "ada@example.com", "emailed-token").await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/admin/users/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "user-1",
            "email": "ada@example.com"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/rest/profiles/user-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "user_id": "user-1",
            "email": "ada@example.com"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/profiles/user-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "user_id": "user-1",
            "email": "ada@example.com",
            "onboarding_completed": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/admin/generate_link"))
        .respond_with(ResponseTemplate::new(500).set_body_string("mailer down"))
        .mount(&server)
        .await;

    let outcome = setup.service.activate(request("emailed-token")).await.unwrap();

    assert!(outcome.credential.is_none());
    assert_eq!(outcome.redirect, "/");
    assert!(outcome.message.is_some());
    assert_eq!(
        setup.audit.count(AuditEventType::CredentialIssuanceDegraded),
        1
    );
}
