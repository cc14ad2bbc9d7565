use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;

use crate::database::ExecuteRequest;
use crate::http::extract::ExecuteRequestDto;
use crate::http::AppState;

/// `GET /v2/db/{id}/ws` upgrade target. Each text frame carries one
/// [`ExecuteRequestDto`]; the connection streams one JSON
/// [`crate::database::ExecuteResponse`] (or error body) back per frame,
/// generalized from the teacher's per-connection WebSocket task pattern.
pub async fn execute_stream(
    ws: WebSocketUpgrade,
    Path(database_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, database_id, state))
}

async fn handle_socket(mut socket: WebSocket, database_id: String, state: AppState) {
    loop {
        let msg = match socket.recv().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                tracing::debug!(error = %err, "ws recv error");
                break;
            }
            None => break,
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };

        let reply = handle_frame(&state, &database_id, &text).await;
        if socket.send(Message::Text(reply)).await.is_err() {
            break;
        }
    }
}

async fn handle_frame(state: &AppState, database_id: &str, text: &str) -> String {
    let parsed: Result<ExecuteRequestDto, _> = serde_json::from_str(text);
    let dto = match parsed {
        Ok(dto) => dto,
        Err(err) => {
            return serde_json::json!({"code": "INVALID_REQUEST", "error": err.to_string()}).to_string();
        }
    };

    let Some(instance) = state.node.database(database_id) else {
        return serde_json::json!({"code": "NOT_FOUND", "error": "database not found"}).to_string();
    };

    let result = instance
        .execute(ExecuteRequest {
            sql: dto.sql,
            params: dto.params,
            required_wal_position: dto.required_wal_position,
            caller: dto.caller_address,
        })
        .await;

    match result {
        Ok(resp) => serde_json::to_string(&resp).unwrap_or_default(),
        Err(err) => serde_json::json!({"code": err.code(), "error": err.to_string()}).to_string(),
    }
}
