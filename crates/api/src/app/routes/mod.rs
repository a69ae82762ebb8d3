use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/:id", get(jobs::get_job))
}
