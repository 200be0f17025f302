//! Canned endpoints for front-end development. They never call the model.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ChatRequest, ServerState, error_body, error_response, json_payload, parse_agent_id};
use crate::{agent::Stage, storage::ResponseKind};

const MOCK_DIAGRAM: &str = "graph TD\n    A[User] -->|Uploads| B(Server)\n    B --> C{Processing}\n    C -->|Success| D[Database]\n    C -->|Failure| E[Logs]";

#[derive(Debug, Default, Deserialize)]
pub(super) struct MockQuery {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct MockChatResponse {
    token: String,
    agent_id: u8,
    kind: ResponseKind,
    text: String,
}

fn canned_text(stage: Stage, text: &str) -> String {
    match stage {
        Stage::Description => format!(
            "[MOCK agent 1] Specification drafted from \"{text}\": 1. Home page with a product catalogue 2. Cart with checkout 3. Personal account"
        ),
        Stage::Goals => format!(
            "[MOCK agent 2] Requirements analysed: \"{text}\". Key points: UX, payment security, responsive design"
        ),
        Stage::Users => format!(
            "[MOCK agent 3] Roles for \"{text}\": customers, managers, administrators"
        ),
        Stage::Requirements => format!(
            "[MOCK agent 4] Requirements for \"{text}\": 1. Catalogue search 2. Online payment 3. Order tracking"
        ),
    }
}

fn simulated_error(query: &MockQuery, allow_render: bool) -> Option<Response> {
    match query.error.as_deref() {
        Some("validation") => Some(error_body(
            StatusCode::BAD_REQUEST,
            "[MOCK] Validation error: invalid token or text",
        )),
        Some("server") => Some(error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "[MOCK] Internal server error",
        )),
        Some("render") if allow_render => Some(error_body(
            StatusCode::BAD_REQUEST,
            "[MOCK] Mermaid render error",
        )),
        _ => None,
    }
}

pub(super) async fn chat(
    Path(agent_id): Path<String>,
    Query(query): Query<MockQuery>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    if let Some(response) = simulated_error(&query, false) {
        return response;
    }
    let request = match json_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let stage = match parse_agent_id(&agent_id).and_then(Stage::from_id) {
        Ok(stage) => stage,
        Err(err) => return error_response(err.into()),
    };

    let token = request
        .token
        .filter(|token| !token.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let text = request.text.unwrap_or_default();
    Json(MockChatResponse {
        token,
        agent_id: stage.id(),
        kind: ResponseKind::Section,
        text: canned_text(stage, text.trim()),
    })
    .into_response()
}

pub(super) async fn mermaid(
    State(state): State<ServerState>,
    Query(query): Query<MockQuery>,
) -> Response {
    if let Some(response) = simulated_error(&query, true) {
        return response;
    }
    let renderer = state.ctx().pipeline().renderer();
    match renderer.render_png(MOCK_DIAGRAM).await {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(err) => error_response(err),
    }
}
