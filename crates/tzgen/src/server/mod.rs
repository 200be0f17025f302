use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

mod mock;

use crate::{
    diagram::DiagramKind,
    document::Section,
    error::{PipelineError, classify},
    publish::{self, PublishRequest},
    state::AppContext,
    storage::{self, StoredResponse},
};

#[derive(Clone)]
pub struct ServerState {
    ctx: AppContext,
}

impl ServerState {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    fn ctx(&self) -> &AppContext {
        &self.ctx
    }
}

pub async fn serve(state: ServerState) -> anyhow::Result<()> {
    let addr: SocketAddr = state.ctx().config().server.addr().parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_with_listener(listener, state).await
}

pub async fn serve_with_listener(listener: TcpListener, state: ServerState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "server listening");

    let app = router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.ctx().clone()))
        .await?;

    Ok(())
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/chat/:id", post(chat))
        .route("/api/v1/chat/:id/history", get(chat_history))
        .route("/api/v1/documents/:token", get(document))
        .route("/api/v1/mermaid", post(generate_mermaid))
        .route("/api/v1/mermaid/:token", get(stored_mermaid))
        .route("/api/v1/mermaid/:token/:kind", get(mermaid_image))
        .route("/api/v1/create-confluence-tz", post(create_confluence_tz))
        .route("/api/v1/create-confluence-tz/", post(create_confluence_tz))
        .route("/api/v1/mock/chat/:id", post(mock::chat))
        .route("/api/v1/mock/mermaid", post(mock::mermaid))
        .route("/api/logs/llm", get(llm_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(ctx: AppContext) {
    ctx.shutdown_notifier().notified().await;
}

async fn health() -> &'static str {
    "ok"
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Maps classified failures to their status; everything else is an opaque 500.
fn error_response(err: anyhow::Error) -> Response {
    match classify(&err) {
        Some(pipeline_err) => {
            let status = pipeline_err.status();
            if status.is_server_error() {
                warn!(error = ?err, %status, "request failed");
            }
            error_body(status, pipeline_err.to_string())
        }
        None => {
            warn!(error = ?err, "request failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn json_payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| error_body(StatusCode::BAD_REQUEST, rejection.body_text()))
}

fn parse_agent_id(raw: &str) -> Result<i64, PipelineError> {
    raw.trim().parse().map_err(|_| {
        PipelineError::validation(format!("Agent id must be an integer, got '{}'", raw.trim()))
    })
}

#[derive(Debug, Default, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

async fn chat(
    State(state): State<ServerState>,
    Path(agent_id): Path<String>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match json_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let agent_id = match parse_agent_id(&agent_id) {
        Ok(id) => id,
        Err(err) => return error_response(err.into()),
    };

    let pipeline = state.ctx().pipeline();
    match pipeline
        .run_stage(
            agent_id,
            request.token.as_deref(),
            request.text.as_deref().unwrap_or_default(),
        )
        .await
    {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    token: String,
    responses: Vec<StoredResponse>,
}

async fn chat_history(State(state): State<ServerState>, Path(token): Path<String>) -> Response {
    let pipeline = state.ctx().pipeline();
    match pipeline.history(&token).await {
        Ok(responses) => Json(HistoryResponse { token, responses }).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct DocumentResponse {
    token: Uuid,
    sections: Vec<Section>,
    markdown: String,
}

async fn document(State(state): State<ServerState>, Path(token): Path<String>) -> Response {
    let pipeline = state.ctx().pipeline();
    match pipeline.assemble(&token).await {
        Ok(document) => {
            let markdown = document.markdown();
            Json(DocumentResponse {
                token: document.token,
                sections: document.sections,
                markdown,
            })
            .into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct MermaidRequest {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    diagram_types: Option<Vec<String>>,
}

async fn generate_mermaid(
    State(state): State<ServerState>,
    payload: Result<Json<MermaidRequest>, JsonRejection>,
) -> Response {
    let request = match json_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let Some(token) = request.token.as_deref().filter(|token| !token.trim().is_empty()) else {
        return error_response(PipelineError::validation("The 'token' field is required").into());
    };

    let pipeline = state.ctx().pipeline();
    match pipeline
        .generate_diagrams(
            token,
            request.diagram_types.as_deref(),
            request.text.as_deref(),
        )
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(err) => error_response(err),
    }
}

async fn stored_mermaid(State(state): State<ServerState>, Path(token): Path<String>) -> Response {
    let pipeline = state.ctx().pipeline();
    match pipeline.diagrams(&token).await {
        Ok(set) => Json(set).into_response(),
        Err(err) => error_response(err),
    }
}

async fn mermaid_image(
    State(state): State<ServerState>,
    Path((token, kind)): Path<(String, String)>,
) -> Response {
    let kind = match kind.parse::<DiagramKind>() {
        Ok(kind) => kind,
        Err(err) => return error_response(err.into()),
    };
    let pipeline = state.ctx().pipeline();
    let set = match pipeline.diagrams(&token).await {
        Ok(set) => set,
        Err(err) => return error_response(err),
    };
    let Some(encoded) = set.images.get(kind.title()) else {
        return error_response(
            PipelineError::not_found(format!("Diagram '{}' not found for this token", kind.title()))
                .into(),
        );
    };
    match STANDARD.decode(encoded) {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(err) => error_response(anyhow::Error::new(err).context("decoding stored diagram")),
    }
}

async fn create_confluence_tz(
    State(state): State<ServerState>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> Response {
    let request = match json_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let config = state.ctx().config();
    let confluence = config.confluence.clone();
    drop(config);

    let pipeline = state.ctx().pipeline();
    match publish::publish(&pipeline, &request, confluence.as_ref()).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct LlmLogsQuery {
    #[serde(default, alias = "level")]
    phase: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    run_id: Option<Uuid>,
    #[serde(default)]
    token: Option<Uuid>,
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LlmLogsResponse {
    entries: Vec<crate::llm::LlmLogEntry>,
}

async fn llm_logs(
    State(state): State<ServerState>,
    Query(params): Query<LlmLogsQuery>,
) -> impl IntoResponse {
    let config = state.ctx().config();
    let data_dir = config.data_dir.clone();
    drop(config);

    let since = params
        .since
        .as_deref()
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let query = storage::LlmLogQuery {
        phase: params.phase.clone(),
        model: params.model.clone(),
        run_id: params.run_id,
        token: params.token,
        since,
        limit: params.limit.unwrap_or(100),
    };

    match storage::read_llm_logs(&data_dir, query).await {
        Ok(entries) => Json(LlmLogsResponse { entries }).into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to read llm logs");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AppConfig, render::is_png};
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _tmp: TempDir,
        router: Router,
    }

    fn test_app(pipeline_yaml: &str) -> TestApp {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("config")).expect("config dir");
        fs::write(root.join("config/llm.yml"), "provider: local_stub\n").expect("llm config");
        fs::write(root.join("config/renderer.yml"), "provider: local_stub\n")
            .expect("renderer config");
        fs::write(root.join("config/pipeline.yml"), pipeline_yaml).expect("pipeline config");

        unsafe {
            std::env::set_var("TZGEN_APP_ROOT", root);
            std::env::set_var("TZGEN_SERVER_BIND", "127.0.0.1:0");
        }
        let config = AppConfig::load().expect("load config");
        unsafe {
            std::env::remove_var("TZGEN_APP_ROOT");
            std::env::remove_var("TZGEN_SERVER_BIND");
        }

        let ctx = AppContext::from_config(config).expect("context");
        TestApp {
            _tmp: tmp,
            router: router(ServerState::new(ctx)),
        }
    }

    async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    async fn send_json(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, bytes) = send(app, method, uri, body).await;
        let payload = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, payload)
    }

    #[tokio::test]
    #[serial]
    async fn healthz_returns_ok() {
        let app = test_app("critic_enabled: true\n");
        let (status, body) = send(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    #[serial]
    async fn chat_stages_build_document() {
        let app = test_app("critic_enabled: false\n");

        let (status, first) = send_json(
            &app,
            "POST",
            "/api/v1/chat/1",
            Some(json!({"text": "Online bookshop"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["agent_id"], json!(1));
        assert_eq!(first["kind"], json!("section"));
        let token = first["token"].as_str().unwrap().to_string();

        let (status, second) = send_json(
            &app,
            "POST",
            "/api/v1/chat/2",
            Some(json!({"token": token, "text": "Sell paper books"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["token"], json!(token));
        assert_eq!(second["text"], json!("Goals and objectives\n\n- Sell paper books"));

        let (status, history) =
            send_json(&app, "GET", &format!("/api/v1/chat/{token}/history"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["responses"].as_array().unwrap().len(), 2);

        let (status, document) =
            send_json(&app, "GET", &format!("/api/v1/documents/{token}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(document["sections"].as_array().unwrap().len(), 2);
        let markdown = document["markdown"].as_str().unwrap();
        assert!(markdown.starts_with("# Technical specification"));
        assert!(markdown.contains("## Goals and objectives"));
    }

    #[tokio::test]
    #[serial]
    async fn chat_errors_are_json() {
        let app = test_app("critic_enabled: true\n");

        let (status, body) =
            send_json(&app, "POST", "/api/v1/chat/1", Some(json!({"text": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("The 'text' field is required"));

        let (status, body) =
            send_json(&app, "POST", "/api/v1/chat/9", Some(json!({"text": "shop"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            json!("Agent with id 9 not found. Available agents: 1, 2, 3, 4")
        );

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/v1/chat/1",
            Some(json!({"token": "abc", "text": "shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid token"));

        let (status, body) = send_json(
            &app,
            "GET",
            &format!("/api/v1/documents/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("Technical specification not found"));
    }

    #[tokio::test]
    #[serial]
    async fn mermaid_generates_and_serves_images() {
        let app = test_app("critic_enabled: true\ndiagram_retry_delay_ms: 1\n");
        let (_, first) =
            send_json(&app, "POST", "/api/v1/chat/1", Some(json!({"text": "Bookshop"}))).await;
        let token = first["token"].as_str().unwrap().to_string();

        let (status, report) = send_json(
            &app,
            "POST",
            "/api/v1/mermaid",
            Some(json!({"token": token, "diagram_types": ["DFD", "ER Diagram"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(report["diagrams"]["DFD"].is_string());
        assert!(report["diagrams"]["ER Diagram"].is_string());
        assert_eq!(report["failures"], json!({}));

        let (status, stored) =
            send_json(&app, "GET", &format!("/api/v1/mermaid/{token}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["images"].as_object().unwrap().len(), 2);

        let (status, png) = send(&app, "GET", &format!("/api/v1/mermaid/{token}/dfd"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(is_png(&png));

        let (status, _) =
            send_json(&app, "GET", &format!("/api/v1/mermaid/{token}/activity"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) =
            send_json(&app, "POST", "/api/v1/mermaid", Some(json!({"text": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("The 'token' field is required"));
    }

    #[tokio::test]
    #[serial]
    async fn llm_logs_filter_by_phase() {
        let app = test_app("critic_enabled: true\n");
        let (_, reply) =
            send_json(&app, "POST", "/api/v1/chat/1", Some(json!({"text": "Bookshop"}))).await;
        let token = reply["token"].as_str().unwrap();

        let (status, logs) = send_json(&app, "GET", "/api/logs/llm?phase=critic", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = logs["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["token"], json!(token));

        let (_, all) = send_json(&app, "GET", &format!("/api/logs/llm?token={token}"), None).await;
        assert_eq!(all["entries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    #[serial]
    async fn confluence_publish_validates_request() {
        let app = test_app("critic_enabled: true\n");

        let (status, body) =
            send_json(&app, "POST", "/api/v1/create-confluence-tz", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Missing required field: token"));

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/v1/create-confluence-tz/",
            Some(json!({"token": Uuid::new_v4()})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .starts_with("Confluence access configuration error")
        );
    }

    #[tokio::test]
    #[serial]
    async fn mock_endpoints_serve_canned_responses() {
        let app = test_app("critic_enabled: true\n");

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/v1/mock/chat/2",
            Some(json!({"text": "shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["text"].as_str().unwrap().starts_with("[MOCK agent 2]"));
        assert!(Uuid::parse_str(body["token"].as_str().unwrap()).is_ok());

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/v1/mock/chat/99",
            Some(json!({"text": "shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            json!("Agent with id 99 not found. Available agents: 1, 2, 3, 4")
        );

        let (status, _) = send_json(
            &app,
            "POST",
            "/api/v1/mock/chat/1?error=server",
            Some(json!({"text": "shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, png) = send(&app, "POST", "/api/v1/mock/mermaid", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(is_png(&png));

        let (status, body) =
            send_json(&app, "POST", "/api/v1/mock/mermaid?error=render", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("[MOCK] Mermaid render error"));
    }

    #[tokio::test]
    #[serial]
    async fn malformed_json_is_rejected_with_json_error() {
        let app = test_app("critic_enabled: true\n");
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/chat/1")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].is_string());
    }
}
