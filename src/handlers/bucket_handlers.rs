//! HTTP handlers for buckets and their tags.

use crate::{
    errors::AppError,
    models::{bucket::Bucket, bucket_tag::BucketTag},
    services::{bucket_manager::NewBucket, storage_service::StorageService},
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    pub lock: bool,
}

/// `GET /buckets` — every bucket not flagged deleted.
pub async fn list_buckets(
    State(service): State<StorageService>,
) -> Result<Json<Vec<Bucket>>, AppError> {
    Ok(Json(service.list_buckets().await?))
}

/// `POST /buckets` — an empty body creates a bucket with all defaults.
pub async fn create_bucket(
    State(service): State<StorageService>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let params: NewBucket = if body.is_empty() {
        NewBucket::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, err.to_string()))?
    };
    let bucket = service.create_bucket(params).await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// `GET /buckets/{id}`
pub async fn get_bucket(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.get_bucket(id).await?))
}

/// `DELETE /buckets/{id}`
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    service.delete_bucket(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /buckets/{id}/snapshot?lock=`
pub async fn snapshot_bucket(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
    Query(q): Query<SnapshotQuery>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = service.snapshot_bucket(id, q.lock).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// `GET /buckets/{id}/tags`
pub async fn get_tags(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
) -> Result<Json<BTreeMap<String, String>>, AppError> {
    Ok(Json(service.bucket_tags(id).await?))
}

/// `PUT /buckets/{id}/tags/{key}` — the raw body is the value.
pub async fn put_tag(
    State(service): State<StorageService>,
    Path((id, key)): Path<(Uuid, String)>,
    value: String,
) -> Result<Json<BucketTag>, AppError> {
    Ok(Json(service.put_tag(id, &key, &value).await?))
}

/// `DELETE /buckets/{id}/tags/{key}`
pub async fn delete_tag(
    State(service): State<StorageService>,
    Path((id, key)): Path<(Uuid, String)>,
) -> Result<StatusCode, AppError> {
    service.delete_tag(id, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}
