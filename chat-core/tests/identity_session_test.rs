mod common;

use chat_core::auth::{DelegationMode, IdentitySession};
use chat_core::models::{AccountId, RequestMetadata, Scope};
use chat_core::AuthError;
use common::*;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_sign_in(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("code=good-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sign_in_body("graph-token", "rt-1")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("app-token")))
        .mount(server)
        .await;
}

async fn mount_graph(server: &MockServer, status: u16) {
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .and(header("authorization", "Bearer graph-token"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({
            "id": "graph-oid-1",
            "displayName": "Ada Lovelace",
            "userPrincipalName": "ada@contoso.com",
        })))
        .mount(server)
        .await;
}

fn metadata() -> RequestMetadata {
    RequestMetadata::new(Some("203.0.113.7:55012".to_string()))
}

#[tokio::test]
async fn begin_login_builds_authorize_url() {
    let server = MockServer::start().await;
    let identity = identity_service(&server);

    let url = identity.begin_login("state-123").unwrap();

    assert!(url.starts_with(&format!("{}/tenant-1/oauth2/v2.0/authorize?", server.uri())));
    assert!(url.contains("client_id=client-1"));
    assert!(url.contains("response_type=code"));
    assert!(url.contains("response_mode=query"));
    assert!(url.contains("state=state-123"));
    assert!(url.contains("scope=User.Read+openid+profile+offline_access"));
}

#[tokio::test]
async fn complete_login_populates_session() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_graph(&server, 200).await;

    let identity = identity_service(&server);
    let mut session = IdentitySession::default();

    identity
        .complete_login(&mut session, "good-code", &metadata())
        .await
        .unwrap();

    let user = session.identity().expect("authenticated");
    assert_eq!(user.profile().display_name, "Ada Lovelace");
    assert_eq!(user.user_grant().scope(), &Scope::graph_user_read());
    assert_eq!(
        user.application_grant().map(|g| g.bearer()),
        Some("app-token")
    );

    let context = user.security_context();
    assert_eq!(context.application_name(), "Azure OpenAI Chatbot");
    assert_eq!(context.end_user_id(), "graph-oid-1");
    assert_eq!(context.source_ip(), "203.0.113.7");
    assert_eq!(context.end_user_tenant_id(), Some(TENANT_ID));
}

#[tokio::test]
async fn graph_failure_still_signs_in_with_unknown_user() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_graph(&server, 500).await;

    let identity = identity_service(&server);
    let mut session = IdentitySession::default();

    identity
        .complete_login(&mut session, "good-code", &RequestMetadata::default())
        .await
        .unwrap();

    let context = session.security_context().unwrap();
    assert_eq!(context.end_user_id(), "unknown");
    assert_eq!(context.source_ip(), "unknown");
}

#[tokio::test]
async fn failed_login_leaves_session_untouched() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_graph(&server, 200).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("code=stale-code"))
        .respond_with(ResponseTemplate::new(400).set_body_json(aad_error("invalid_grant", 54005)))
        .mount(&server)
        .await;

    let identity = identity_service(&server);

    let mut anonymous = IdentitySession::default();
    let err = identity
        .complete_login(&mut anonymous, "stale-code", &metadata())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant(_)));
    assert!(!anonymous.is_authenticated());

    let mut signed_in = IdentitySession::default();
    identity
        .complete_login(&mut signed_in, "good-code", &metadata())
        .await
        .unwrap();
    identity
        .complete_login(&mut signed_in, "stale-code", &metadata())
        .await
        .unwrap_err();
    assert_eq!(
        signed_in.security_context().map(|c| c.end_user_id()),
        Some("graph-oid-1")
    );
}

#[tokio::test]
async fn on_behalf_of_uses_application_grant_as_assertion() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_graph(&server, 200).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("assertion=app-token"))
        .and(body_string_contains("requested_token_use=on_behalf_of"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("aoai-obo-token")))
        .expect(1)
        .mount(&server)
        .await;

    let identity = identity_service(&server);
    let mut session = IdentitySession::default();
    identity
        .complete_login(&mut session, "good-code", &metadata())
        .await
        .unwrap();

    let grant = identity
        .completion_grant(&session, DelegationMode::OnBehalfOfUser)
        .await
        .unwrap();

    assert_eq!(grant.bearer(), "aoai-obo-token");
    assert_eq!(grant.scope(), &Scope::cognitive_services());
}

#[tokio::test]
async fn expired_assertion_does_not_disturb_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("code=good-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sign_in_body("graph-token", "rt-1")))
        .mount(&server)
        .await;
    // The application grant is itself a JWT that has already lapsed.
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(&id_token(-60))))
        .mount(&server)
        .await;
    mount_graph(&server, 200).await;

    let identity = identity_service(&server);
    let mut session = IdentitySession::default();
    identity
        .complete_login(&mut session, "good-code", &metadata())
        .await
        .unwrap();

    let err = identity
        .completion_grant(&session, DelegationMode::OnBehalfOfUser)
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::AssertionExpired);
    assert!(session.is_authenticated());
    assert_eq!(session.security_context().unwrap().end_user_id(), "graph-oid-1");
}

#[tokio::test]
async fn anonymous_session_cannot_delegate() {
    let server = MockServer::start().await;
    let identity = identity_service(&server);

    let err = identity
        .completion_grant(&IdentitySession::Anonymous, DelegationMode::OnBehalfOfUser)
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::NoCachedAccount);
}

#[tokio::test]
async fn logout_forgets_cached_account() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_graph(&server, 200).await;

    let identity = identity_service(&server);
    let mut session = IdentitySession::default();
    identity
        .complete_login(&mut session, "good-code", &metadata())
        .await
        .unwrap();

    let account = AccountId::new("oid-1", TENANT_ID);
    assert!(identity.broker().has_account(&account));

    identity.logout(&mut session);

    assert!(!session.is_authenticated());
    assert!(!identity.broker().has_account(&account));
}

#[tokio::test]
async fn unreadable_profile_fails_login_and_drops_refresh_token() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let identity = identity_service(&server);
    let mut session = IdentitySession::default();

    let err = identity
        .complete_login(&mut session, "good-code", &metadata())
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::MalformedResponse(_)));
    assert!(!session.is_authenticated());
    assert!(!identity.broker().has_account(&AccountId::new("oid-1", TENANT_ID)));
}

#[tokio::test]
async fn signing_in_as_another_user_forgets_the_previous_account() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_graph(&server, 200).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("code=other-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "access_token": "graph-token-2",
            "expires_in": 3599,
            "id_token": jwt(json!({
                "oid": "oid-2",
                "tid": TENANT_ID,
                "exp": chrono::Utc::now().timestamp() + 3600,
            })),
            "refresh_token": "rt-other",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .and(header("authorization", "Bearer graph-token-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "graph-oid-2",
            "displayName": "Grace Hopper",
        })))
        .mount(&server)
        .await;

    let identity = identity_service(&server);
    let mut session = IdentitySession::default();
    identity
        .complete_login(&mut session, "good-code", &metadata())
        .await
        .unwrap();
    identity
        .complete_login(&mut session, "other-code", &metadata())
        .await
        .unwrap();

    assert!(!identity.broker().has_account(&AccountId::new("oid-1", TENANT_ID)));
    assert!(identity.broker().has_account(&AccountId::new("oid-2", TENANT_ID)));
    assert_eq!(session.security_context().unwrap().end_user_id(), "graph-oid-2");
}
