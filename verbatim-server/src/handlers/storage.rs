//! Document store endpoints.
//!
//! Status mapping: 404 absent, 403 owner-key mismatch, 204 successful
//! mutation, 500 storage failure. SQLite work runs on blocking
//! threads.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::Storage;

fn key_param(params: &HashMap<String, String>) -> String {
    params.get("key").cloned().unwrap_or_default()
}

/// Run a storage closure on the blocking pool.
async fn blocking<T, F>(storage: &Storage, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(Storage) -> Result<T, ApiError> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || op(storage))
        .await
        .map_err(|e| ApiError::Internal(format!("storage task failed: {e}")))?
}

/// `GET /api/storage/{id}`
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (doc_type, data) = blocking(&state.storage, move |storage| {
        storage.get(&id)?.ok_or(ApiError::NotFound)
    })
    .await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::HeaderName::from_static("type"), doc_type),
        ],
        data,
    )
        .into_response())
}

/// `PUT /api/storage/{id}?key=` — upsert; the key becomes the owner
/// key.
pub async fn put_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let key = key_param(&params);
    blocking(&state.storage, move |storage| {
        storage.put(&id, &body, &key, "json")?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// `DELETE /api/storage/{id}?key=` — only the owner key deletes; a
/// mismatch is indistinguishable from an absent document.
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let key = key_param(&params);
    let removed = blocking(&state.storage, move |storage| {
        Ok(storage.remove(&id, &key)?)
    })
    .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

/// `GET /api/storage/{id}/verify?key=`
pub async fn verify(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let key = key_param(&params);
    let matches = blocking(&state.storage, move |storage| {
        storage.check_owner(&id, &key)?.ok_or(ApiError::NotFound)
    })
    .await?;
    if matches {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::Forbidden)
    }
}

async fn require_owner(state: &AppState, id: String, key: String) -> Result<(), ApiError> {
    let matches = blocking(&state.storage, move |storage| {
        storage.check_owner(&id, &key)?.ok_or(ApiError::NotFound)
    })
    .await?;
    if matches {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// `PUT /api/storage/{id}/audio?key=` — owner-gated companion WAV.
pub async fn put_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    require_owner(&state, id.clone(), key_param(&params)).await?;

    blocking(&state.storage, move |storage| {
        storage.put_file(&id, &body, ".wav")?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/storage/{id}/audio` — no key required for reads.
pub async fn get_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = blocking(&state.storage, move |storage| {
        storage.get_file(&id, ".wav")?.ok_or(ApiError::NotFound)
    })
    .await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "audio/wav")],
        bytes,
    )
        .into_response())
}

/// `DELETE /api/storage/{id}/audio?key=`
pub async fn delete_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    require_owner(&state, id.clone(), key_param(&params)).await?;

    let removed = blocking(&state.storage, move |storage| {
        Ok(storage.remove_file(&id, ".wav")?)
    })
    .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}
