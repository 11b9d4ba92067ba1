use std::sync::Arc;
use std::time::Duration;

use coordination::{Backend, BackendError, FailureKind, GenerationRouter, RouterConfig};
use relay_agents::backends::{HuggingFaceBackend, OpenAiCompatibleBackend};
use relay_agents::{BackendConfig, BackendKind};
use serde_json::json;
use wiremock::matchers::{bearer_token, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn openai_config(server: &MockServer) -> BackendConfig {
    BackendConfig {
        name: "mock".to_string(),
        kind: BackendKind::OpenAi,
        base_url: format!("{}/v1", server.uri()),
        model: "mock-model".to_string(),
        api_key: Some("sk-test".to_string()),
        api_key_env: None,
        max_tokens: 64,
        temperature: 0.2,
    }
}

fn hf_config(server: &MockServer) -> BackendConfig {
    BackendConfig {
        name: "hf".to_string(),
        kind: BackendKind::HuggingFace,
        base_url: server.uri(),
        model: "org/model".to_string(),
        api_key: Some("hf-test".to_string()),
        api_key_env: None,
        max_tokens: 64,
        temperature: 0.2,
    }
}

fn chat_reply(content: &str) -> serde_json::Value {
    json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
}

#[tokio::test]
async fn openai_success_returns_trimmed_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(bearer_token("sk-test"))
        .and(body_partial_json(json!({
            "model": "mock-model",
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hello" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("  hi there \n")))
        .expect(1)
        .mount(&server)
        .await;

    let backend = OpenAiCompatibleBackend::new(&openai_config(&server), TIMEOUT).unwrap();
    let text = backend.call("hello", Some("be brief")).await.unwrap();
    assert_eq!(text, "hi there");
}

#[tokio::test]
async fn openai_status_codes_map_to_failure_kinds() {
    let cases = [
        (401, FailureKind::AuthFailure),
        (403, FailureKind::AuthFailure),
        (429, FailureKind::RateLimit),
        (500, FailureKind::Generic),
    ];
    for (status, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let backend = OpenAiCompatibleBackend::new(&openai_config(&server), TIMEOUT).unwrap();
        let err = backend.call("hello", None).await.unwrap_err();
        assert_eq!(err.kind(), expected, "status {status}");
        assert!(err.to_string().contains("nope"));
    }
}

#[tokio::test]
async fn openai_missing_content_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let backend = OpenAiCompatibleBackend::new(&openai_config(&server), TIMEOUT).unwrap();
    let err = backend.call("hello", None).await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidResponse(_)));
    assert_eq!(err.kind(), FailureKind::Generic);
}

#[tokio::test]
async fn huggingface_accepts_list_and_object_replies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/org/model"))
        .and(bearer_token("hf-test"))
        .and(body_partial_json(json!({
            "inputs": "User: first\nAssistant:",
            "parameters": { "return_full_text": false }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{ "generated_text": " listed " }])),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/org/model"))
        .and(body_partial_json(json!({ "inputs": "User: second\nAssistant:" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "generated_text": "single" })),
        )
        .mount(&server)
        .await;

    let backend = HuggingFaceBackend::new(&hf_config(&server), TIMEOUT).unwrap();
    assert_eq!(backend.call("first", None).await.unwrap(), "listed");
    assert_eq!(backend.call("second", None).await.unwrap(), "single");
}

#[tokio::test]
async fn router_falls_back_from_rate_limited_http_backend() {
    let limited = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(1)
        .mount(&limited)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("from healthy")))
        .mount(&healthy)
        .await;

    let mut first = openai_config(&limited);
    first.name = "limited".to_string();
    let mut second = openai_config(&healthy);
    second.name = "healthy".to_string();
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(OpenAiCompatibleBackend::new(&first, TIMEOUT).unwrap()),
        Arc::new(OpenAiCompatibleBackend::new(&second, TIMEOUT).unwrap()),
    ];
    let router = GenerationRouter::new(backends, RouterConfig::default());

    let generation = router.generate("hello", None, None).await;
    assert_eq!(generation.text, "from healthy");
    assert_eq!(generation.backend_name(), Some("healthy"));
    assert!(!router.is_usable("limited"));

    // The rate-limited backend is skipped on the next call.
    let again = router.generate("hello", None, None).await;
    assert_eq!(again.backend_name(), Some("healthy"));
}
