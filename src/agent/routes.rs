//! HTTP routes for the havoc-agent.
//!
//! `POST /` carries every command; authentication happens inside the
//! envelope, so there is no header-based auth. `/health` is a public
//! liveness probe.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::Value;

use havoc::protocol::{ErrorEnvelope, ErrorKind};

use crate::commands::command_names;
use crate::AppState;

/// Creates the router with all agent routes.
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(banner).post(run_command))
        .route("/health", get(health))
}

/// GET / - Usage banner and command catalogue
async fn banner() -> impl IntoResponse {
    let commands = serde_json::to_string_pretty(&command_names()).unwrap_or_default();
    format!(
        "havoc-agent v{}\n\n\
         POST a JSON envelope to this path:\n\n    \
         {{\"command\": \"kill_process\", \"arguments\": {{\"names\": [\"nginx*\"]}}, \"key\": \"<sha256 of secret>\"}}\n\n\
         Available commands:\n{}\n",
        env!("CARGO_PKG_VERSION"),
        commands
    )
}

/// GET /health - Simple health check (public)
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "havoc-agent",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// POST / - Validate the envelope and run its command
///
/// Commands block (poll loops, subprocesses), so they run off the async
/// workers.
async fn run_command(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking(move || state.validator.validate_and_run(&body))
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Command task failed: {}", e);
            Err(ErrorEnvelope::new(
                ErrorKind::UnexpectedError,
                "Command task failed",
            ))
        });

    respond(result)
}

fn respond(result: Result<Value, ErrorEnvelope>) -> (StatusCode, Json<Value>) {
    match result {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(envelope) => {
            let body = serde_json::to_value(&envelope).unwrap_or(Value::Null);
            (StatusCode::FORBIDDEN, Json(body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc::protocol::{key_digest, CommandEnvelope};
    use serde_json::json;

    use crate::commands::tests::test_agent;
    use crate::validator::Validator;

    async fn spawn_agent() -> String {
        let state = Arc::new(AppState {
            validator: Validator::new(key_digest("secret"), test_agent(true), false),
        });
        let app = create_routes().with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_respond_status_codes() {
        let (status, Json(body)) = respond(Ok(json!({"list": []})));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"list": []}));

        let (status, Json(body)) = respond(Err(ErrorEnvelope::new(
            ErrorKind::WrongCommand,
            "Unknown command 'x'",
        )));
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["status"], "wrong_command");
    }

    #[tokio::test]
    async fn test_banner_lists_commands() {
        let url = spawn_agent().await;
        let text = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert!(text.contains("havoc-agent"));
        assert!(text.contains("\"burn_disk\""));
        assert!(text.contains("\"restart_node\""));
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let url = spawn_agent().await;
        let resp = reqwest::get(format!("{}health", url)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["service"], "havoc-agent");
    }

    #[tokio::test]
    async fn test_post_runs_command() {
        let url = spawn_agent().await;
        let client = reqwest::Client::new();

        let ok = client
            .post(&url)
            .json(&CommandEnvelope::new("list_network_adapters", None, "secret"))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);
        assert_eq!(ok.json::<Value>().await.unwrap(), json!(["eth0"]));

        let denied = client
            .post(&url)
            .json(&CommandEnvelope::new("list_network_adapters", None, "wrong"))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 403);
        let body: Value = denied.json().await.unwrap();
        assert_eq!(body["status"], "authorization_failed");
    }
}
