//! HTTP surface. Handlers only call `ModelService`; every registry error leaves
//! as `{code, message, details}` with a status chosen by its kind.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use model_registry::{ErrorKind, ModelService, NewModel, PredictionRequest, RegistryError, Version};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub type AppState = Arc<ModelService>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/models", get(list_models).post(register))
        .route("/models/latest/:model_id", get(latest))
        .route("/models/:model_id/versions", get(versions))
        .route("/models/:model_id/versions/:version/pointer", put(repoint))
        .route("/models/:model_id/versions/:version/restore", post(restore))
        .route("/predictions/:model_id", post(predict))
        .route("/predictions/:model_id/versions/:version", post(predict_version))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self { Self(e) }
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self { Self(RegistryError::InvalidRequest(r.body_text())) }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Dependency => StatusCode::BAD_GATEWAY,
        ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            debug!(code = self.0.code(), error = %self.0, "request rejected");
        }
        let body = json!({ "code": self.0.code(), "message": self.0.to_string(), "details": self.0.details() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Ledger and bundle access is blocking file IO; keep it off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(RegistryError::Storage(format!("request task failed: {e}"))))?
        .map_err(ApiError)
}

#[derive(Debug, Deserialize)]
pub struct RepointBody {
    pub artifact_pointer: String,
}

pub async fn register(State(svc): State<AppState>, payload: Result<Json<NewModel>, JsonRejection>) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(new) = payload?;
    let record = svc.register(new).await?;
    Ok((StatusCode::CREATED, Json(json!({ "model_id": record.model_id, "version": record.version, "record": record }))))
}

pub async fn list_models(State(svc): State<AppState>) -> ApiResult<Json<Value>> {
    let models = blocking(move || svc.models()).await?;
    Ok(Json(json!({ "models": models })))
}

pub async fn latest(State(svc): State<AppState>, Path(model_id): Path<String>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(blocking(move || svc.latest(&model_id)).await?)))
}

pub async fn versions(State(svc): State<AppState>, Path(model_id): Path<String>) -> ApiResult<Json<Value>> {
    let id = model_id.clone();
    let versions = blocking(move || svc.versions(&id)).await?;
    Ok(Json(json!({ "model_id": model_id, "versions": versions })))
}

pub async fn repoint(
    State(svc): State<AppState>,
    Path((model_id, version)): Path<(String, String)>,
    payload: Result<Json<RepointBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let version: Version = version.parse()?;
    let Json(body) = payload?;
    let record = blocking(move || svc.repoint(&model_id, version, &body.artifact_pointer)).await?;
    Ok(Json(json!(record)))
}

pub async fn restore(State(svc): State<AppState>, Path((model_id, version)): Path<(String, String)>) -> ApiResult<Json<Value>> {
    let version: Version = version.parse()?;
    Ok(Json(json!(blocking(move || svc.restore_bundle(&model_id, version)).await?)))
}

pub async fn predict(
    State(svc): State<AppState>,
    Path(model_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload?;
    let rows = PredictionRequest::from_json_rows(body, svc.join_key())?;
    Ok(Json(json!(svc.predict(&model_id, &rows).await?)))
}

pub async fn predict_version(
    State(svc): State<AppState>,
    Path((model_id, version)): Path<(String, String)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let version: Version = version.parse()?;
    let Json(body) = payload?;
    let rows = PredictionRequest::from_json_rows(body, svc.join_key())?;
    Ok(Json(json!(svc.predict_version(&model_id, version, &rows).await?)))
}
