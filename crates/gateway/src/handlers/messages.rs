//! Message handler: runs one agentic turn and streams its events as SSE
//!
//! Each `LoopEvent` becomes one SSE event whose name is the event kind and
//! whose data is the JSON-encoded event. The stream ends after `done` or
//! `error`.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use quarry_common::{
    errors::{AppError, Result},
    events::{EventSink, LoopEvent, EVENT_BUFFER},
};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;

/// Send message request
#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    #[validate(length(min = 1, max = 4000))]
    pub message: String,
}

/// Post a user message; the answer arrives as a server-sent event stream.
///
/// Session errors (unknown, busy) are plain HTTP errors returned before
/// the stream opens.
pub async fn send_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("message".to_string()),
    })?;

    let turn = state.sessions.begin_turn(session_id, &request.message).await?;
    let (sink, rx) = EventSink::channel(EVENT_BUFFER);

    tokio::spawn(async move {
        if let Err(e) = turn.run(&sink).await {
            tracing::warn!(session_id = %session_id, error = %e, "Turn ended with error");
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &LoopEvent) -> Event {
    Event::default()
        .event(event.kind())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event("error").data(r#"{"type":"error","message":"unserializable event"}"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_router, AppState};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use quarry_common::{
        config::AppConfig,
        context::AgenticLoop,
        llm::MockLanguageModel,
        search::MockSearch,
        session::{InMemorySessionStore, SessionManager},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> AppState {
        let mut config = AppConfig::default();
        config.search.collection = Some("vs_test".to_string());
        config.rate_limit.enabled = false;

        let agent = AgenticLoop::new(
            Arc::new(MockLanguageModel::new()),
            Arc::new(MockSearch::new()),
            &config.search,
            &config.agent,
        );
        let sessions = SessionManager::new(Arc::new(InMemorySessionStore::new()), Arc::new(agent), 3);

        AppState {
            config: Arc::new(config),
            sessions,
            metrics: None,
        }
    }

    fn post(uri: String, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_message_streams_events() {
        let state = state();
        let session = state.sessions.create_session().await.unwrap();
        let app = create_router(state);

        let response = app
            .oneshot(post(
                format!("/v2/sessions/{}/messages", session.id),
                serde_json::json!({ "message": "What is policy X?" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: text-fragment"));
        assert!(text.contains("event: sources"));
        assert!(text.trim_end().ends_with(r#"data: {"type":"done"}"#));
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = create_router(state());
        let response = app
            .oneshot(post(
                format!("/v2/sessions/{}/messages", Uuid::new_v4()),
                serde_json::json!({ "message": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_busy_session_is_409() {
        let state = state();
        let session = state.sessions.create_session().await.unwrap();
        let _pending = state.sessions.begin_turn(session.id, "first").await.unwrap();

        let response = create_router(state)
            .oneshot(post(
                format!("/v2/sessions/{}/messages", session.id),
                serde_json::json!({ "message": "second" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let state = state();
        let session = state.sessions.create_session().await.unwrap();

        let response = create_router(state)
            .oneshot(post(
                format!("/v2/sessions/{}/messages", session.id),
                serde_json::json!({ "message": "" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
