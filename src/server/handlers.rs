use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::auth::AppState;
use crate::error::PortalError;
use crate::tenant::SchoolScope;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Only return publicly visible records
    #[serde(default)]
    pub published: bool,
}

/// Generic error body; details stay in the log
fn error_response(e: PortalError) -> Response {
    let (status, message) = match &e {
        PortalError::NotFound { .. } => (StatusCode::NOT_FOUND, "not found".to_string()),
        PortalError::InvalidRecord(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        _ => {
            warn!("Request failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
    };
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn list_records(
    State(state): State<AppState>,
    Path((school_id, collection)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Response {
    let scope = SchoolScope::new(state.store.clone(), school_id);
    let records = if query.published {
        scope.published(&collection)
    } else {
        scope.get(&collection)
    };
    match records {
        Ok(records) => Json(json!({
            "collection": collection,
            "records": records,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_record(
    State(state): State<AppState>,
    Path((school_id, collection, id)): Path<(String, String, String)>,
) -> Response {
    let scope = SchoolScope::new(state.store.clone(), school_id);
    match scope.get_item(&collection, &id) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(PortalError::not_found(&collection, &id)),
        Err(e) => error_response(e),
    }
}

pub async fn insert_record(
    State(state): State<AppState>,
    Path((school_id, collection)): Path<(String, String)>,
    Json(data): Json<Value>,
) -> Response {
    let scope = SchoolScope::new(state.store.clone(), school_id);
    match scope.insert(&collection, data) {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn update_record(
    State(state): State<AppState>,
    Path((school_id, collection, id)): Path<(String, String, String)>,
    Json(partial): Json<Value>,
) -> Response {
    let scope = SchoolScope::new(state.store.clone(), school_id);
    match scope.update(&collection, &id, partial) {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn delete_record(
    State(state): State<AppState>,
    Path((school_id, collection, id)): Path<(String, String, String)>,
) -> Response {
    let scope = SchoolScope::new(state.store.clone(), school_id);
    match scope.delete(&collection, &id) {
        Ok(true) => Json(json!({ "success": true, "id": id })).into_response(),
        Ok(false) => error_response(PortalError::not_found(&collection, &id)),
        Err(e) => error_response(e),
    }
}

pub async fn storage_stats(State(state): State<AppState>) -> Response {
    match state.store.stats() {
        Ok(stats) => Json(json!({
            "total_records": stats.total_records,
            "total_bytes": stats.total_bytes,
            "collections": stats.collections,
            "live_peers": state.broker.peer_count().await,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}
