//! Defines routes for all S3-compatible bucket and object operations.
//!
//! ## Structure
//! - **Service endpoint**
//!   - `GET    /`: list buckets
//!
//! - **Bucket-level endpoints**
//!   - `GET    /{bucket}`: ListObjectsV2 (prefix, max-keys, continuation-token)
//!   - `PUT    /{bucket}`: create bucket
//!   - `HEAD   /{bucket}`: bucket exists
//!   - `DELETE /{bucket}`: delete empty bucket
//!   - `POST   /{bucket}?delete`: DeleteObjects
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}`: upload object, or part with `?partNumber=&uploadId=`
//!   - `GET    /{bucket}/{*key}`: download object (single `Range` supported)
//!   - `HEAD   /{bucket}/{*key}`: retrieve metadata only
//!   - `DELETE /{bucket}/{*key}`: soft-delete object, or abort with `?uploadId=`
//!   - `POST   /{bucket}/{*key}`: `?uploads` starts, `?uploadId=` completes a multipart upload
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        bucket_handlers::{
            create_bucket, delete_bucket, head_bucket, list_buckets, list_objects, post_bucket,
        },
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, get_object, head_object, post_object, put_object},
    },
    services::backend::Backend,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build and return the router for all S3-compatible routes.
///
/// The router carries the shared `Backend` to all handlers.
pub fn routes() -> Router<Backend> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", get(list_buckets))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(put_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object)
                .post(post_object),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(list_objects)
                .put(create_bucket)
                .head(head_bucket)
                .delete(delete_bucket)
                .post(post_bucket),
        )
}
