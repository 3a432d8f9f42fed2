use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use flagforge_storage::NewFlag;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

pub async fn readyz(State(state): State<AppState>) -> Response {
    let cache = state.snapshots.cache().mode();
    match state.flags.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready", "cache": cache }))).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            ApiError::ServiceUnavailable("store unavailable".into()).into_response()
        }
    }
}

pub async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => ApiError::ServiceUnavailable("metrics not initialized".into()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListFlagsQuery {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
}

/// `GET /v1/flags?project_id=&env=`
pub async fn list_flags(
    State(state): State<AppState>,
    Query(query): Query<ListFlagsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (Some(project_id), Some(env)) = (
        query.project_id.filter(|p| !p.is_empty()),
        query.env.filter(|e| !e.is_empty()),
    ) else {
        return Err(ApiError::bad_request("project_id and env are required"));
    };

    let fetched = state
        .snapshots
        .fetch(&project_id, &env)
        .await
        .map_err(|e| ApiError::from_storage(e, "unable to fetch flags"))?;

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if fetched.matches_tag(if_none_match) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let mut response = (StatusCode::OK, Json(json!({ "flags": fetched.flags }))).into_response();
    if let Ok(tag) = HeaderValue::from_str(&fetched.tag) {
        response.headers_mut().insert(header::ETAG, tag);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct CreateFlagRequest {
    pub project_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: String,
    #[serde(default)]
    pub description: Option<String>,
    pub values: BTreeMap<String, Value>,
}

impl From<CreateFlagRequest> for NewFlag {
    fn from(req: CreateFlagRequest) -> Self {
        let mut new_flag = NewFlag::new(req.project_id, req.key, req.flag_type);
        if let Some(description) = req.description {
            new_flag = new_flag.with_description(description);
        }
        new_flag.values = req.values;
        new_flag
    }
}

/// `POST /v1/flags`
pub async fn create_flag(
    State(state): State<AppState>,
    payload: Result<Json<CreateFlagRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let flag = state
        .flags
        .create_flag(req.into())
        .await
        .map_err(|e| ApiError::from_storage(e, "unable to create flag"))?;

    Ok((StatusCode::CREATED, Json(json!({ "id": flag.id }))).into_response())
}

/// `GET /v1/flags/{id}/audit`
pub async fn flag_audit(
    State(state): State<AppState>,
    Path(flag_id): Path<String>,
) -> Result<Response, ApiError> {
    let logs = state
        .flags
        .audit_logs(&flag_id)
        .await
        .map_err(|e| ApiError::from_storage(e, "unable to fetch audit logs"))?;

    Ok((StatusCode::OK, Json(json!({ "logs": logs }))).into_response())
}
