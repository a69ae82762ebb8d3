use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use jobforge_core::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// `POST /jobs`
///
/// The body is parsed by hand so that every malformed request is a 400
/// with the common error shape.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let req: dto::SubmitJobRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string());
        }
    };

    match services.submission.submit(&req.job_type, req.payload).await {
        Ok(submitted) => (
            StatusCode::CREATED,
            Json(dto::SubmitJobResponse::from(submitted)),
        )
            .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// `GET /jobs/:id`
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_id",
                format!("invalid job id: {id}"),
            );
        }
    };

    match services.submission.lookup(job_id).await {
        Ok(Some(job)) => Json(dto::JobResponse::from(job)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job {job_id} not found"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}
