//! HTTP surface of the coordinator

pub mod error;
pub mod routes;

use crate::dispatch::Dispatcher;
use crate::format::ResponseFormatter;
use axum::{
    routing::{get, post},
    Router,
};
use lockstep_common::LockstepConfig;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ApiResult};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub formatter: ResponseFormatter,
    pub metrics_enabled: bool,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &LockstepConfig) -> Self {
        Self {
            dispatcher,
            formatter: ResponseFormatter::from_config(&config.chat),
            metrics_enabled: config.observability.enable_metrics,
        }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(routes::chat))
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{ExecutionGroup, GroupSettings};
    use crate::launcher::TaskLauncher;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use lockstep_common::config::LaunchMode;
    use lockstep_common::Result;
    use lockstep_proto::{CompletionEnvelope, Dialog, Rank};
    use lockstep_worker::{EchoGenerator, Generation, GenerationParams, Generator, GeneratorFactory};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    /// Echo backend that counts its calls
    struct CountingEcho {
        inner: EchoGenerator,
        calls: Arc<AtomicUsize>,
    }

    impl Generator for CountingEcho {
        fn name(&self) -> &str {
            "counting-echo"
        }

        fn generate(
            &self,
            dialogs: &[Dialog],
            params: &GenerationParams,
        ) -> Result<Vec<Generation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.generate(dialogs, params)
        }
    }

    struct TestApp {
        router: Router,
        dispatcher: Arc<Dispatcher>,
        calls: Arc<AtomicUsize>,
    }

    async fn app(size: usize) -> TestApp {
        let mut config = LockstepConfig::default();
        config.group.size = size;
        config.group.launch = LaunchMode::InProcess;
        config.group.ready_timeout_secs = 5;
        config.group.shutdown_timeout_secs = 1;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory: GeneratorFactory = Arc::new(move |_: Rank| -> Result<Arc<dyn Generator>> {
            Ok(Arc::new(CountingEcho {
                inner: EchoGenerator::new(4),
                calls: counter.clone(),
            }))
        });

        let launcher = TaskLauncher::with_factory(&config, factory);
        let group = ExecutionGroup::start(GroupSettings::from(&config), &launcher).await.unwrap();
        let dispatcher = Arc::new(Dispatcher::from_config(group, &config));
        let router = create_router(AppState::new(dispatcher.clone(), &config));

        TestApp {
            router,
            dispatcher,
            calls,
        }
    }

    fn post_chat(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn error_code(response: axum::response::Response) -> String {
        let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
        value["error"]["code"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_chat_returns_assistant_message() {
        let app = app(2).await;
        let body = json!({"messages": [{"role": "user", "content": "Hello"}]}).to_string();

        let response = app.router.clone().oneshot(post_chat(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let envelope: CompletionEnvelope =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(envelope.object, "chat.completion");
        let choice = &envelope.choices[0];
        let message = choice.message.as_ref().unwrap();
        assert_eq!(message.role, "assistant");
        assert_eq!(message.content, "Hello");
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
        assert_eq!(envelope.usage.total_tokens, 0);

        // One generation per rank.
        assert_eq!(app.calls.load(Ordering::SeqCst), 2);
        app.dispatcher.group().shutdown().await;
    }

    #[tokio::test]
    async fn test_chat_stream_emits_chunks() {
        let app = app(1).await;
        let content = "a".repeat(300);
        let body = json!({
            "messages": [{"role": "user", "content": content}],
            "stream": true,
        })
        .to_string();

        let response = app.router.clone().oneshot(post_chat(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

        let text = body_text(response).await;
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], "data: [DONE]");

        let sizes: Vec<usize> = lines[..3]
            .iter()
            .map(|line| {
                let data = line.strip_prefix("data: ").unwrap();
                let chunk: CompletionEnvelope = serde_json::from_str(data).unwrap();
                chunk.choices[0].delta.as_ref().unwrap().content.len()
            })
            .collect();
        assert_eq!(sizes, vec![128, 128, 44]);
        app.dispatcher.group().shutdown().await;
    }

    #[tokio::test]
    async fn test_messages_not_a_list() {
        let app = app(2).await;
        let body = json!({"messages": "not a list"}).to_string();

        let response = app.router.clone().oneshot(post_chat(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "invalid_message_list");
        assert_eq!(app.calls.load(Ordering::SeqCst), 0);
        app.dispatcher.group().shutdown().await;
    }

    #[tokio::test]
    async fn test_message_without_content() {
        let app = app(2).await;
        let body = json!({"messages": [{"role": "user"}]}).to_string();

        let response = app.router.clone().oneshot(post_chat(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "invalid_message");
        assert_eq!(app.calls.load(Ordering::SeqCst), 0);
        app.dispatcher.group().shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let app = app(1).await;

        let response = app.router.clone().oneshot(post_chat("{\"messages\": [")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "invalid_json");
        assert_eq!(app.calls.load(Ordering::SeqCst), 0);
        app.dispatcher.group().shutdown().await;
    }

    #[tokio::test]
    async fn test_health_follows_group_status() {
        let app = app(2).await;

        let response = app.router.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(report["status"], "ready");
        assert_eq!(report["size"], 2);
        assert_eq!(report["ranks"], json!(["idle", "idle"]));

        app.dispatcher.group().mark_failed("rank 1 exited");
        let response = app.router.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let report: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(report["status"], "failed");
        assert_eq!(report["reason"], "rank 1 exited");

        let body = json!({"messages": [{"role": "user", "content": "Hello"}]}).to_string();
        let response = app.router.clone().oneshot(post_chat(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "group_unavailable");
        app.dispatcher.group().shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = app(1).await;

        let response = app.router.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("chat_requests_total"));
        app.dispatcher.group().shutdown().await;
    }
}
