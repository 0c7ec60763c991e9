//! Defines routes for bucket, tag and versioned-object operations.
//!
//! ## Structure
//! - **Bucket endpoints**
//!   - `GET    /buckets` — list buckets
//!   - `POST   /buckets` — create bucket
//!   - `GET    /buckets/{id}` — bucket metadata
//!   - `DELETE /buckets/{id}` — remove bucket, its versions and tags
//!   - `POST   /buckets/{id}/snapshot?lock=` — fork the current heads
//!
//! - **Tag endpoints**
//!   - `GET    /buckets/{id}/tags`
//!   - `PUT    /buckets/{id}/tags/{key}` — raw body is the value
//!   - `DELETE /buckets/{id}/tags/{key}`
//!
//! - **Object endpoints**
//!   - `GET    /buckets/{id}/objects?versions=` — list heads or full history
//!   - `PUT    /buckets/{id}/objects/{*key}` — upload a new version
//!   - `GET    /buckets/{id}/objects/{*key}?version_id=` — download
//!   - `HEAD   /buckets/{id}/objects/{*key}?version_id=` — metadata only
//!   - `DELETE /buckets/{id}/objects/{*key}?version_id=` — delete marker or version removal
//!   - `POST   /buckets/{id}/objects/{*key}` — copy / restore
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        bucket_handlers::{
            create_bucket, delete_bucket, delete_tag, get_bucket, get_tags, list_buckets, put_tag,
            snapshot_bucket,
        },
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_object, get_object, head_object, list_objects, object_action, upload_object,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router; state (`StorageService`) is supplied by the caller.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Bucket-level routes
        .route("/buckets", get(list_buckets).post(create_bucket))
        .route("/buckets/{id}", get(get_bucket).delete(delete_bucket))
        .route("/buckets/{id}/snapshot", post(snapshot_bucket))
        .route("/buckets/{id}/tags", get(get_tags))
        .route("/buckets/{id}/tags/{key}", put(put_tag).delete(delete_tag))
        // Object-level routes
        .route("/buckets/{id}/objects", get(list_objects))
        .route(
            "/buckets/{id}/objects/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object)
                .post(object_action),
        )
}
