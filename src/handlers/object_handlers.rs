//! HTTP handlers for versioned objects.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`.

use crate::{
    errors::AppError,
    services::storage_service::{CopyTarget, ObjectMeta, StorageService},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const VERSION_ID_HEADER: HeaderName = HeaderName::from_static("x-version-id");
const DELETE_MARKER_HEADER: HeaderName = HeaderName::from_static("x-delete-marker");

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    #[serde(default)]
    pub versions: bool,
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version_id: Option<Uuid>,
}

/// Body of `POST /buckets/{id}/objects/{*key}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ObjectAction {
    Copy {
        version_id: Option<Uuid>,
        bucket: Option<Uuid>,
        key: Option<String>,
    },
    Restore {
        version_id: Uuid,
    },
}

/// `GET /buckets/{id}/objects?versions=`
pub async fn list_objects(
    State(service): State<StorageService>,
    Path(bucket): Path<Uuid>,
    Query(q): Query<ListObjectsQuery>,
) -> Result<Json<Vec<ObjectMeta>>, AppError> {
    Ok(Json(service.list_objects(bucket, q.versions).await?))
}

/// `PUT /buckets/{id}/objects/{*key}` — stream the body into a new version.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(Uuid, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let size_hint = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let meta = service
        .upload_object(bucket, &key, content_type.as_deref(), stream, size_hint)
        .await?;

    let mut response = Json(&meta).into_response();
    *response.status_mut() = StatusCode::CREATED;
    set_identity_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `GET /buckets/{id}/objects/{*key}?version_id=` as a streaming response.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(Uuid, String)>,
    Query(q): Query<VersionQuery>,
) -> Result<Response, AppError> {
    let (meta, reader, length) = service
        .get_object_reader(bucket, &key, q.version_id)
        .await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta, length);
    Ok(response)
}

/// HEAD `/buckets/{id}/objects/{*key}` — same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(Uuid, String)>,
    Query(q): Query<VersionQuery>,
) -> Result<Response, AppError> {
    let meta = service
        .get_object_metadata(bucket, &key, q.version_id)
        .await?;
    if meta.version.is_delete_marker() {
        return Err(AppError::not_found(format!("object `{}` is deleted", key)));
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta, meta.size.max(0) as u64);
    Ok(response)
}

/// DELETE `/buckets/{id}/objects/{*key}` — delete marker, or with
/// `?version_id=` permanent removal of that version.
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(Uuid, String)>,
    Query(q): Query<VersionQuery>,
) -> Result<Response, AppError> {
    let marker = service.delete_object(bucket, &key, q.version_id).await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Some(marker) = marker {
        let headers = response.headers_mut();
        headers.insert(DELETE_MARKER_HEADER, HeaderValue::from_static("true"));
        if let Ok(value) = HeaderValue::from_str(&marker.version_id.to_string()) {
            headers.insert(VERSION_ID_HEADER, value);
        }
    }
    Ok(response)
}

/// POST `/buckets/{id}/objects/{*key}` — copy or restore.
pub async fn object_action(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(Uuid, String)>,
    Json(action): Json<ObjectAction>,
) -> Result<impl IntoResponse, AppError> {
    let meta = match action {
        ObjectAction::Copy {
            version_id,
            bucket: target_bucket,
            key: target_key,
        } => {
            service
                .copy_object(
                    bucket,
                    &key,
                    version_id,
                    CopyTarget {
                        bucket: target_bucket,
                        key: target_key,
                    },
                )
                .await?
        }
        ObjectAction::Restore { version_id } => {
            service.restore_object(bucket, &key, version_id).await?
        }
    };

    let mut response = Json(&meta).into_response();
    *response.status_mut() = StatusCode::CREATED;
    set_identity_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_identity_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    if let Ok(value) = HeaderValue::from_str(&meta.version.version_id.to_string()) {
        headers.insert(VERSION_ID_HEADER, value);
    }
    if let Some(checksum) = meta.checksum.as_deref() {
        let hex = checksum.strip_prefix("md5:").unwrap_or(checksum);
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", hex)) {
            headers.insert(header::ETAG, value);
        }
    }
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectMeta, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mimetype)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&meta.version.created.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    set_identity_headers(headers, meta);
}
