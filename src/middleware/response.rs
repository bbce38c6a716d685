// middleware/response.rs - Success envelope for migration endpoints

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::error::ApiError;

/// `{"success": true, "data": ...}` with the status the handler picked
#[derive(Debug)]
pub struct ApiResponse<T: Serialize> {
    data: T,
    status: StatusCode,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            data,
            status: StatusCode::OK,
        }
    }

    /// 202: the request was recorded and work continues in the background
    pub fn accepted(data: T) -> Self {
        Self {
            data,
            status: StatusCode::ACCEPTED,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match serde_json::to_value(&self.data) {
            Ok(data) => (self.status, Json(json!({ "success": true, "data": data }))).into_response(),
            Err(e) => {
                tracing::error!("Failed to serialize response data: {}", e);
                ApiError::InternalServerError("Failed to serialize response data".to_string())
                    .into_response()
            }
        }
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;
