use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Json, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kissbot_runner::{
    AccessCheck, Bot, BotRunner, RunnerConfig, RunnerError, UploadRequest, UploadedFile,
};

#[derive(Clone)]
struct AppState {
    runner: Arc<BotRunner>,
}

#[derive(Debug, Deserialize)]
struct AccessRequest {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Serialize)]
struct AccessResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    running_bots: usize,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    success: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kissbot_runner_server=info,kissbot_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RunnerConfig::load(None)?;

    tracing::info!("🚀 Starting KissBot Runner Server");
    tracing::info!("📦 Database: {}", config.db_path.display());
    tracing::info!("📁 Bots directory: {}", config.bots_dir.display());
    tracing::info!("🐍 Interpreter: {}", config.supervisor.interpreter);

    let runner = Arc::new(BotRunner::new(&config).await?);
    runner.supervisor().reconcile().await?;

    let state = AppState {
        runner: runner.clone(),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/validate-access", post(validate_access_handler))
        .route("/api/bots", get(list_handler))
        .route("/api/bots/upload", post(upload_handler))
        .route("/api/bots/:id", get(get_handler).delete(delete_handler))
        .route("/api/bots/:id/start", post(start_handler))
        .route("/api/bots/:id/stop", post(stop_handler))
        .route("/api/bots/:id/restart", post(restart_handler))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Start server
    let addr = config.bind_addr();
    tracing::info!("🤖 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("🧹 Cleaning up...");
    runner
        .supervisor()
        .shutdown(config.supervisor.stop_timeout() + Duration::from_secs(2))
        .await;
    tracing::info!("✅ Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let mut signals = match Signals::new(&[SIGTERM, SIGINT]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!("❌ Cannot install signal handlers: {}", e);
            return std::future::pending().await;
        }
    };

    if let Some(signal) = signals.next().await {
        tracing::info!("🛑 Received signal {:?}, shutting down...", signal);
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: kissbot_runner::VERSION.to_string(),
        running_bots: state.runner.supervisor().registry().len(),
    })
}

async fn validate_access_handler(
    State(state): State<AppState>,
    Json(req): Json<AccessRequest>,
) -> Response {
    match state.runner.validate_access(&req.code) {
        AccessCheck::Granted => Json(AccessResponse {
            valid: true,
            message: None,
        })
        .into_response(),
        AccessCheck::Denied => (
            StatusCode::UNAUTHORIZED,
            Json(AccessResponse {
                valid: false,
                message: Some("Invalid access code".to_string()),
            }),
        )
            .into_response(),
        AccessCheck::Empty => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Access code is required".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn list_handler(State(state): State<AppState>) -> Result<Json<Vec<Bot>>, AppError> {
    Ok(Json(state.runner.list().await?))
}

async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Bot>, AppError> {
    Ok(Json(state.runner.get(&id).await?))
}

async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Bot>, AppError> {
    let mut name = String::new();
    let mut script = None;
    let mut manifest = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "name" => name = field.text().await.map_err(bad_multipart)?,
            "botFile" | "requirementsFile" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content = field.bytes().await.map_err(bad_multipart)?.to_vec();
                let file = UploadedFile::new(file_name, content);
                if field_name == "botFile" {
                    script = Some(file);
                } else {
                    manifest = Some(file);
                }
            }
            other => tracing::debug!("Ignoring upload field '{}'", other),
        }
    }

    let script = script
        .ok_or_else(|| RunnerError::InvalidInput("Bot file is required".to_string()))?;

    let bot = state
        .runner
        .upload(UploadRequest {
            name,
            script,
            manifest,
        })
        .await?;

    Ok(Json(bot))
}

async fn start_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Bot>, AppError> {
    Ok(Json(state.runner.start(&id).await?))
}

async fn stop_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Bot>, AppError> {
    Ok(Json(state.runner.stop(&id).await?))
}

async fn restart_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Bot>, AppError> {
    Ok(Json(state.runner.restart(&id).await?))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    state.runner.delete(&id).await?;
    Ok(Json(DeleteResponse { success: true }))
}

fn bad_multipart(e: MultipartError) -> AppError {
    AppError(RunnerError::InvalidInput(format!("Malformed upload: {}", e)))
}

// Error handling
struct AppError(RunnerError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RunnerError::NotFound(_) => StatusCode::NOT_FOUND,
            RunnerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.0.to_string();

        tracing::error!("❌ Error: {} - {}", status, message);

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<RunnerError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
