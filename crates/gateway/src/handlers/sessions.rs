//! Session management handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use quarry_common::{
    errors::Result,
    session::{ConversationTurn, SessionState},
};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;

/// Create session response
#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub created_at: String,
}

/// Session state response
#[derive(Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub history: Vec<ConversationTurn>,
    pub version: u64,
    pub message_count: u64,
    pub search_count: u64,
    pub created_at: String,
    pub last_active_at: String,
}

impl From<SessionState> for SessionResponse {
    fn from(session: SessionState) -> Self {
        Self {
            session_id: session.id,
            history: session.history,
            version: session.version,
            message_count: session.message_count,
            search_count: session.search_count,
            created_at: session.created_at.to_rfc3339(),
            last_active_at: session.last_active_at.to_rfc3339(),
        }
    }
}

/// Create a new session
pub async fn create_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreateSessionResponse>)> {
    let session = state.sessions.create_session().await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
            created_at: session.created_at.to_rfc3339(),
        }),
    ))
}

/// Get session state
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionResponse>> {
    let session = state.sessions.get_session(session_id).await?;
    Ok(Json(session.into()))
}
