//! Liveness and readiness endpoints.

use crate::services::upload_service::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, fmt::Display};

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    checks: BTreeMap<&'static str, Check>,
}

#[derive(Serialize)]
struct Check {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<E: Display> From<Result<(), E>> for Check {
    fn from(result: Result<(), E>) -> Self {
        Check {
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

/// `GET /healthz`: the process is up. Never touches I/O.
pub async fn healthz() -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        checks: BTreeMap::new(),
    })
}

/// `GET /readyz`: SQLite answers and the temp dir is writable.
/// 503 when either check fails.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let (database, storage) = tokio::join!(service.check_database(), service.check_storage());

    let mut checks = BTreeMap::new();
    checks.insert("sqlite", Check::from(database));
    checks.insert("disk", Check::from(storage));

    let ready = checks.values().all(|check| check.ok);
    if !ready {
        tracing::warn!("readiness check failed");
    }
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthBody {
            status: if ready { "ok" } else { "error" },
            checks,
        }),
    )
}
