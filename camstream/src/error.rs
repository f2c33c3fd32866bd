use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    Busy(String),
    NotReady(String),
    NotFound(String),
    BadRequest(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn busy<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::Busy(t.to_string())
    }

    pub fn not_ready<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::NotReady(t.to_string())
    }

    pub fn not_found<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::NotFound(t.to_string())
    }

    pub fn bad_request<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::BadRequest(t.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Busy(err) => (
                StatusCode::CONFLICT,
                Json(json!({ "success": false, "reason": "busy", "error": err })),
            )
                .into_response(),
            AppError::NotReady(err) => (StatusCode::SERVICE_UNAVAILABLE, err).into_response(),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err).into_response(),
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err).into_response(),
            AppError::InternalServerError(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError::InternalServerError(err.into())
    }
}
