//! HTTP-level tests for the Ollama adapter against a mock server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use llmux_engine::config::{ModelDefaults, OllamaSettings};
use llmux_engine::llm::providers::OllamaAdapter;
use llmux_engine::{
    Engine, EngineError, EventBus, FunctionDeclaration, Gen, JsonMap, Prompt, Schema, handler_fn,
};

/// Replies with the next body in sequence and records every request body.
struct Sequence {
    bodies: Vec<String>,
    content_type: &'static str,
    served: AtomicUsize,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl Sequence {
    fn json(bodies: Vec<Value>, seen: &Arc<Mutex<Vec<Value>>>) -> Self {
        Self {
            bodies: bodies.iter().map(Value::to_string).collect(),
            content_type: "application/json",
            served: AtomicUsize::new(0),
            seen: Arc::clone(seen),
        }
    }

    fn ndjson(streams: Vec<Vec<Value>>, seen: &Arc<Mutex<Vec<Value>>>) -> Self {
        Self {
            bodies: streams
                .iter()
                .map(|lines| {
                    lines
                        .iter()
                        .map(|l| format!("{l}\n"))
                        .collect::<String>()
                })
                .collect(),
            content_type: "application/x-ndjson",
            served: AtomicUsize::new(0),
            seen: Arc::clone(seen),
        }
    }
}

impl Respond for Sequence {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if let Ok(body) = request.body_json::<Value>() {
            self.seen.lock().unwrap().push(body);
        }
        let n = self.served.fetch_add(1, Ordering::SeqCst);
        match self.bodies.get(n) {
            Some(body) => ResponseTemplate::new(200)
                .insert_header("content-type", self.content_type)
                .set_body_string(body.clone()),
            None => ResponseTemplate::new(500).set_body_string("script exhausted"),
        }
    }
}

fn engine(server: &MockServer) -> Engine {
    let adapter = OllamaAdapter::new(
        OllamaSettings {
            base_url: server.uri(),
        },
        ModelDefaults {
            model_name: Some("llama3.2".into()),
            ..ModelDefaults::default()
        },
        Duration::from_secs(10),
    );
    Engine::new(Arc::new(adapter), EventBus::default(), ModelDefaults::default())
}

fn weather_prompt() -> Prompt {
    Prompt::new("Weather in Paris?").with_tool(
        FunctionDeclaration::new("get_weather", "Current weather for a city")
            .with_parameters(Schema::object([("city", Schema::string())], &["city"])),
        handler_fn(|_cancel, args| async move {
            let city = args
                .get("city")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let mut out = JsonMap::new();
            out.insert("forecast".into(), json!(format!("sunny in {city}")));
            Ok(out)
        }),
    )
}

#[tokio::test]
async fn blocking_tool_loop_over_http() {
    let server = MockServer::start().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(Sequence::json(
            vec![
                json!({
                    "model": "llama3.2",
                    "message": {
                        "role": "assistant",
                        "content": "",
                        "tool_calls": [{
                            "function": {"name": "Get_Weather", "arguments": {"city": "Paris"}}
                        }]
                    },
                    "done": true,
                    "done_reason": "stop",
                    "prompt_eval_count": 20,
                    "eval_count": 5
                }),
                json!({
                    "model": "llama3.2",
                    "message": {"role": "assistant", "content": "It is sunny in Paris."},
                    "done": true,
                    "done_reason": "stop",
                    "prompt_eval_count": 40,
                    "eval_count": 7
                }),
            ],
            &seen,
        ))
        .expect(2)
        .mount(&server)
        .await;

    let answer = engine(&server)
        .generate(&weather_prompt(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(answer, "It is sunny in Paris.");

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0]["model"], "llama3.2");
    assert_eq!(seen[0]["stream"], false);
    assert_eq!(seen[0]["tools"][0]["function"]["name"], "get_weather");
    assert_eq!(seen[0]["options"]["temperature"], 0.7);

    let messages = seen[1]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["tool_calls"][0]["function"]["arguments"]["city"], "Paris");
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["tool_name"], "Get_Weather");
    let content: Value = serde_json::from_str(messages[2]["content"].as_str().unwrap()).unwrap();
    assert_eq!(content["forecast"], "sunny in Paris");
}

#[tokio::test]
async fn streaming_tool_loop_over_http() {
    let server = MockServer::start().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(Sequence::ndjson(
            vec![
                vec![
                    json!({"message": {"role": "assistant", "content": "", "tool_calls": [
                        {"function": {"name": "get_weather", "arguments": {"city": "Paris"}}}
                    ]}, "done": false}),
                    json!({"message": {"role": "assistant", "content": ""}, "done": true,
                        "done_reason": "stop", "prompt_eval_count": 20, "eval_count": 5}),
                ],
                vec![
                    json!({"message": {"role": "assistant", "content": "Sunny"}, "done": false}),
                    json!({"message": {"role": "assistant", "content": " today."}, "done": false}),
                    json!({"message": {"role": "assistant", "content": ""}, "done": true,
                        "done_reason": "stop", "prompt_eval_count": 41, "eval_count": 3}),
                ],
            ],
            &seen,
        ))
        .mount(&server)
        .await;

    let stream = engine(&server)
        .generate_stream(&weather_prompt(), &CancellationToken::new())
        .await
        .unwrap();
    let text = stream.collect_text().await.unwrap();
    assert_eq!(text, "Sunny today.");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["stream"], true);
    assert_eq!(seen[1]["messages"][2]["role"], "tool");
}

#[tokio::test]
async fn token_count_disables_generation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"options": {"num_predict": 0}, "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "prompt_eval_count": 26,
            "eval_count": 0
        })))
        .expect(1)
        .mount(&server)
        .await;

    let usage = engine(&server)
        .count_tokens(&Prompt::new("count me"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(usage.input, 26);
    assert_eq!(usage.total, 26);
}

#[tokio::test]
async fn backend_error_body_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"error": "model \"llama9\" not found"})),
        )
        .mount(&server)
        .await;

    let err = engine(&server)
        .generate(&Prompt::new("hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "llm request failed: ollama error: model \"llama9\" not found"
    );
}

#[tokio::test]
async fn http_status_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
        .mount(&server)
        .await;

    let err = engine(&server)
        .generate(&Prompt::new("hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("503"));
    assert!(err.to_string().contains("loading model"));
}

#[tokio::test]
async fn missing_model_is_a_configuration_error() {
    let server = MockServer::start().await;
    let adapter = OllamaAdapter::new(
        OllamaSettings {
            base_url: server.uri(),
        },
        ModelDefaults::default(),
        Duration::from_secs(10),
    );
    let engine = Engine::new(Arc::new(adapter), EventBus::default(), ModelDefaults::default());

    let err = engine
        .generate(&Prompt::new("hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config { .. }));
    assert!(err.to_string().contains("llama3.2"));
    assert!(server.received_requests().await.unwrap().is_empty());
}
