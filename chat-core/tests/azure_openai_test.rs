use chat_core::completion::{
    AzureOpenAiBackend, CompletionGateway, CompletionMode, CompletionRequest,
};
use chat_core::config::{CompletionBackendKind, CompletionSettings};
use chat_core::conversation::ConversationStore;
use chat_core::models::{
    GrantOrigin, RequestMetadata, Scope, SecurityContext, TokenGrant, UserProfile, APOLOGY_TEXT,
};
use chat_core::CompletionError;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEPLOYMENT_PATH: &str = "/openai/deployments/gpt-4o/chat/completions";

fn settings(server: &MockServer) -> CompletionSettings {
    CompletionSettings {
        backend: CompletionBackendKind::AzureOpenai,
        endpoint: server.uri(),
        api_version: "2024-06-01".to_string(),
        resource_scope: Scope::COGNITIVE_SERVICES.to_string(),
        request_timeout_secs: 5,
        stream_idle_timeout_secs: 2,
    }
}

fn gateway(server: &MockServer) -> CompletionGateway {
    let settings = settings(server);
    let backend = AzureOpenAiBackend::new(&settings).unwrap();
    CompletionGateway::new(
        Arc::new(backend),
        Scope::cognitive_services(),
        Duration::from_secs(settings.stream_idle_timeout_secs),
    )
}

fn grant() -> TokenGrant {
    TokenGrant::new(
        "aoai-token",
        3600,
        Utc::now(),
        Scope::cognitive_services(),
        GrantOrigin::ServicePrincipal,
    )
}

fn request() -> CompletionRequest {
    let mut store = ConversationStore::new("You are a helpful assistant", "Hello!");
    store.append_user("What is the capital of France?", None);

    let profile = UserProfile {
        id: "oid-1".to_string(),
        ..Default::default()
    };
    CompletionRequest {
        model: "gpt-4o".to_string(),
        messages: store.messages().to_vec(),
        max_tokens: 1000,
        security_context: Some(SecurityContext::derive(
            "Azure OpenAI Chatbot",
            &profile,
            Some("tenant-1"),
            &RequestMetadata::new(Some("10.0.0.1:443".to_string())),
        )),
    }
}

fn sse(events: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn stream_events() -> Vec<serde_json::Value> {
    vec![
        json!({"choices": [], "prompt_filter_results": []}),
        json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}),
        json!({"choices": [{"index": 0, "delta": {"content": "Paris"}}]}),
        json!({"choices": [{"index": 0, "delta": {"content": " is the capital."}}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 25, "completion_tokens": 5, "total_tokens": 30}}),
    ]
}

fn batch_body() -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "finish_reason": "stop",
            "message": {"role": "assistant", "content": "Paris is the capital."}
        }],
        "usage": {"prompt_tokens": 25, "completion_tokens": 5, "total_tokens": 30}
    })
}

#[tokio::test]
async fn batch_request_carries_auth_and_security_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEPLOYMENT_PATH))
        .and(query_param("api-version", "2024-06-01"))
        .and(header("authorization", "Bearer aoai-token"))
        .and(body_string_contains(r#""user_security_context":{"application_name":"Azure OpenAI Chatbot","end_user_id":"oid-1","source_ip":"10.0.0.1","end_user_tenant_id":"tenant-1"}"#))
        .and(body_string_contains(r#""stream":false"#))
        .respond_with(ResponseTemplate::new(200).set_body_json(batch_body()))
        .expect(1)
        .mount(&server)
        .await;

    let result = gateway(&server)
        .complete(&grant(), &request(), CompletionMode::Batch, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.text(), "Paris is the capital.");
    assert_eq!(result.prompt_tokens(), 25);
    assert_eq!(result.completion_tokens(), 5);
    assert_eq!(result.total_tokens(), 30);
}

#[tokio::test]
async fn streaming_matches_batch_and_forwards_deltas() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEPLOYMENT_PATH))
        .and(body_string_contains(r#""stream":true"#))
        .and(body_string_contains(r#""stream_options":{"include_usage":true}"#))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse(&stream_events()), "text/event-stream"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(DEPLOYMENT_PATH))
        .and(body_string_contains(r#""stream":false"#))
        .respond_with(ResponseTemplate::new(200).set_body_json(batch_body()))
        .mount(&server)
        .await;

    let gateway = gateway(&server);
    let cancel = CancellationToken::new();

    let (tx, mut rx) = mpsc::channel(16);
    let streamed = gateway
        .complete(&grant(), &request(), CompletionMode::streaming_to(tx), &cancel)
        .await
        .unwrap();
    let batch = gateway
        .complete(&grant(), &request(), CompletionMode::Batch, &cancel)
        .await
        .unwrap();

    assert_eq!(streamed, batch);

    let mut deltas = Vec::new();
    while let Some(delta) = rx.recv().await {
        deltas.push(delta);
    }
    assert_eq!(deltas, vec!["Paris".to_string(), " is the capital.".to_string()]);
}

#[tokio::test]
async fn empty_batch_content_is_an_apology() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEPLOYMENT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": ""}}],
            "usage": {"prompt_tokens": 25, "completion_tokens": 0, "total_tokens": 25}
        })))
        .mount(&server)
        .await;

    let result = gateway(&server)
        .complete(&grant(), &request(), CompletionMode::Batch, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.text(), APOLOGY_TEXT);
    assert_eq!(result.total_tokens(), 0);
}

#[tokio::test]
async fn unauthorized_is_auth_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEPLOYMENT_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": "401", "message": "Access denied due to invalid subscription key or wrong API endpoint."}
        })))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .complete(&grant(), &request(), CompletionMode::Batch, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CompletionError::AuthRejected(_)));
}

#[tokio::test]
async fn server_error_is_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEPLOYMENT_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .complete(
            &grant(),
            &request(),
            CompletionMode::Streaming { deltas: None },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CompletionError::TransportFailure(_)));
}

#[tokio::test]
async fn undecodable_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEPLOYMENT_PATH))
        .and(body_string_contains(r#""stream":false"#))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(DEPLOYMENT_PATH))
        .and(body_string_contains(r#""stream":true"#))
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: {not json}\n\n", "text/event-stream"))
        .mount(&server)
        .await;

    let gateway = gateway(&server);
    let cancel = CancellationToken::new();

    let batch = gateway
        .complete(&grant(), &request(), CompletionMode::Batch, &cancel)
        .await
        .unwrap_err();
    let streamed = gateway
        .complete(&grant(), &request(), CompletionMode::Streaming { deltas: None }, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(batch, CompletionError::MalformedResponse(_)));
    assert!(matches!(streamed, CompletionError::MalformedResponse(_)));
}

#[tokio::test]
async fn unreachable_endpoint_is_transport_failure() {
    let server = MockServer::start().await;
    let settings = settings(&server);
    drop(server);

    let backend = AzureOpenAiBackend::new(&settings).unwrap();
    let gateway = CompletionGateway::new(
        Arc::new(backend),
        Scope::cognitive_services(),
        Duration::from_secs(1),
    );

    let err = gateway
        .complete(&grant(), &request(), CompletionMode::Batch, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CompletionError::TransportFailure(_)));
}
