//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the storage layout and disk I/O

use crate::services::backend::Backend;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe: always 200, never touches the disk.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. The bucket area is a readable directory.
/// 2. A probe file can be written, read back and removed in the tmp area,
///    which is where every write is staged.
///
/// HTTP 200 when all checks pass, HTTP 503 otherwise.
pub async fn readyz(State(backend): State<Backend>) -> impl IntoResponse {
    let paths = backend.paths();

    let buckets_check = match fs::metadata(paths.buckets()).await {
        Ok(meta) if meta.is_dir() => CheckStatus::ok(),
        Ok(_) => CheckStatus::failed("bucket area is not a directory"),
        Err(e) => CheckStatus::failed(format!("could not stat bucket area: {}", e)),
    };

    let probe = paths.tmp().join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&probe, b"readyz").await {
        Ok(_) => {
            let check = match fs::read(&probe).await {
                Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
                Ok(_) => CheckStatus::failed("probe content mismatch"),
                Err(e) => CheckStatus::failed(format!("could not read probe: {}", e)),
            };
            match fs::remove_file(&probe).await {
                Ok(_) => check,
                Err(e) if check.ok => CheckStatus {
                    ok: true,
                    error: Some(format!("could not remove probe: {}", e)),
                },
                Err(_) => check,
            }
        }
        Err(e) => CheckStatus::failed(format!("could not write probe: {}", e)),
    };

    let overall_ok = buckets_check.ok && disk_check.ok;
    let mut checks = BTreeMap::new();
    checks.insert("buckets", buckets_check);
    checks.insert("disk", disk_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{layout::StoragePaths, lock::LocalLocker};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn ready_when_layout_is_writable() {
        let dir = tempdir().unwrap();
        let backend = Backend::init(
            StoragePaths::new(dir.path(), None),
            Arc::new(LocalLocker::new()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let response = readyz(State(backend.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let leftovers = std::fs::read_dir(backend.paths().tmp())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".readyz-"))
            .count();
        assert_eq!(leftovers, 0);

        std::fs::remove_dir_all(dir.path().join("buckets")).unwrap();
        let response = readyz(State(backend)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
