use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware as axum_middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use sb_core::config::{Config, ShellConfig, ShellKind};
use sb_core::types::{CreateSessionRequest, CreateSessionResponse, SessionStatus, TerminalSize};
use sb_session::{SessionManager, SessionSpec};
use sb_telemetry::tracing_setup::request_id_middleware;
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::terminal_ws;

/// Shared state for all HTTP/WS handlers.
pub struct ApiState {
    pub manager: Arc<SessionManager>,
    pub config: Config,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(manager: Arc<SessionManager>, config: Config) -> Self {
        Self {
            manager,
            config,
            start_time: Instant::now(),
        }
    }

    /// Build a launch spec from a create request layered over the configured
    /// defaults.
    ///
    /// An explicit selector different from the configured shell type starts
    /// from a clean shell config, so a configured `program` override only
    /// applies to the configured type. Unknown selectors are spawn failures.
    pub fn session_spec(&self, req: &CreateSessionRequest) -> Result<SessionSpec, ApiError> {
        let mut spec = SessionSpec::from_config(&self.config);

        if let Some(selector) = req.shell_selector.as_deref() {
            let kind: ShellKind = selector
                .parse()
                .map_err(|e: sb_core::config::ConfigError| ApiError::SpawnFailed(e.to_string()))?;
            if kind != self.config.shell.kind {
                spec.shell = ShellConfig {
                    kind,
                    root_dir: self.config.shell.root_dir.clone(),
                    ..Default::default()
                };
            }
        }

        if let Some(distro) = req.wsl_distro.as_deref().filter(|d| !d.is_empty()) {
            if spec.shell.kind != ShellKind::Wsl {
                return Err(ApiError::BadRequest(format!(
                    "wsl_distro requires the wsl shell (got {})",
                    spec.shell.kind
                )));
            }
            spec.shell.wsl_distro = Some(distro.to_string());
        }

        if let Some(env) = &req.environment {
            spec.environment = env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>();
        }
        spec.working_directory = req
            .working_directory
            .clone()
            .filter(|dir| !dir.trim().is_empty());

        let rows = req.rows.unwrap_or(spec.size.rows);
        let cols = req.cols.unwrap_or(spec.size.cols);
        if rows == 0 || cols == 0 {
            return Err(ApiError::BadRequest(
                "rows and cols must be non-zero".to_string(),
            ));
        }
        spec.size = TerminalSize::new(rows, cols);

        if let Some(enabled) = req.prompt_watcher {
            spec.prompt_watcher = enabled;
        }
        Ok(spec)
    }
}

/// Build the API router with all REST and WebSocket routes.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/{id}/status", get(get_session))
        .route("/ws/terminal/{id}", get(terminal_ws::terminal_ws))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    session_count: usize,
    max_sessions: usize,
}

/// GET /api/status
async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        session_count: state.manager.len().await,
        max_sessions: state.manager.max_sessions(),
    })
}

/// POST /api/sessions -- spawn a session; a WebSocket attaches to it later.
async fn create_session(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = state.session_spec(&req)?;
    let id = Uuid::new_v4().to_string();
    let session = state.manager.spawn_session(id, &spec).await?;
    let size = session.size()?;

    let resp = CreateSessionResponse {
        session_id: session.id().to_string(),
        shell: session.shell().to_string(),
        rows: size.rows,
        cols: size.cols,
    };
    Ok((StatusCode::CREATED, Json(resp)))
}

/// GET /api/sessions
async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionStatus>> {
    Json(state.manager.list().await)
}

/// GET /api/sessions/{id} and GET /api/sessions/{id}/status -- the
/// snapshot a disconnected client polls. Recently closed sessions answer
/// with their final status.
async fn get_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    Ok(Json(state.manager.session_status(&id).await?))
}

/// DELETE /api/sessions/{id}
async fn delete_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.manager.close_session(&id).await {
        return Err(ApiError::NotFound(format!("session not found: {id}")));
    }
    Ok(Json(serde_json::json!({ "status": "closed", "session_id": id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn state() -> ApiState {
        let manager = SessionManager::new(Arc::new(sb_session::pty::NativePtyBackend), 4);
        let mut config = Config::default();
        config.shell.program = Some("/bin/sh".to_string());
        ApiState::new(manager, config)
    }

    #[tokio::test]
    async fn spec_defaults_follow_config() {
        let spec = state().session_spec(&CreateSessionRequest::default()).unwrap();
        assert_eq!(spec.shell.program.as_deref(), Some("/bin/sh"));
        assert_eq!(spec.size, TerminalSize::new(24, 80));
        assert!(!spec.prompt_watcher);
        assert!(spec.working_directory.is_none());
    }

    #[tokio::test]
    async fn spec_applies_request_overrides() {
        let req = CreateSessionRequest {
            shell_selector: Some("default".into()),
            environment: Some(HashMap::from([("A".to_string(), "1".to_string())])),
            working_directory: Some("/tmp".into()),
            rows: Some(40),
            cols: Some(120),
            prompt_watcher: Some(true),
            ..Default::default()
        };
        let spec = state().session_spec(&req).unwrap();
        // Same type as configured, so the program override survives.
        assert_eq!(spec.shell.program.as_deref(), Some("/bin/sh"));
        assert_eq!(spec.environment.get("A").map(String::as_str), Some("1"));
        assert_eq!(spec.working_directory.as_deref(), Some("/tmp"));
        assert_eq!(spec.size, TerminalSize::new(40, 120));
        assert!(spec.prompt_watcher);
    }

    #[tokio::test]
    async fn different_selector_drops_program_override() {
        let req = CreateSessionRequest {
            shell_selector: Some("wsl".into()),
            wsl_distro: Some("Debian".into()),
            ..Default::default()
        };
        let spec = state().session_spec(&req).unwrap();
        assert_eq!(spec.shell.kind, ShellKind::Wsl);
        assert!(spec.shell.program.is_none());
        assert_eq!(spec.shell.wsl_distro.as_deref(), Some("Debian"));
    }

    #[tokio::test]
    async fn unknown_selector_is_spawn_failure() {
        let req = CreateSessionRequest {
            shell_selector: Some("fish".into()),
            ..Default::default()
        };
        let err = state().session_spec(&req).unwrap_err();
        assert!(matches!(err, ApiError::SpawnFailed(ref d) if d.contains("fish")));
    }

    #[tokio::test]
    async fn invalid_geometry_and_distro_are_bad_requests() {
        let req = CreateSessionRequest {
            rows: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            state().session_spec(&req),
            Err(ApiError::BadRequest(_))
        ));

        let req = CreateSessionRequest {
            wsl_distro: Some("Ubuntu".into()),
            ..Default::default()
        };
        assert!(matches!(
            state().session_spec(&req),
            Err(ApiError::BadRequest(_))
        ));
    }
}
