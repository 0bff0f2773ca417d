use axum::{Json, http::StatusCode};
use serde::Serialize;

use krishi_types::api::{ApiResponse, Page};

pub type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

pub fn ok<T>(data: T, message: &str) -> Reply<T> {
    (StatusCode::OK, Json(ApiResponse::new(200, data, message)))
}

pub fn created<T>(data: T, message: &str) -> Reply<T> {
    (StatusCode::CREATED, Json(ApiResponse::new(201, data, message)))
}

pub fn page<T>(page: Page<T>, message: &str) -> Reply<Vec<T>> {
    (StatusCode::OK, Json(ApiResponse::paginated(200, page, message)))
}

/// Body for actions that have nothing else to return.
#[derive(Debug, Serialize)]
pub struct Done {
    pub success: bool,
}

pub fn done(message: &str) -> Reply<Done> {
    ok(Done { success: true }, message)
}
