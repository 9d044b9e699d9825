//! 错误到HTTP响应的映射

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use telederm_core::TeledermError;

/// HTTP层错误包装，响应体为 `{error_code, message, status}`
#[derive(Debug)]
pub struct ApiError(pub TeledermError);

impl From<TeledermError> for ApiError {
    fn from(e: TeledermError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error_code": self.0.error_code(),
            "message": self.0.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

/// HTTP处理器统一结果类型
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let resp = ApiError(TeledermError::SlotTaken(7)).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError(TeledermError::Unauthorized("no token".into())).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = ApiError(TeledermError::SlotGone(7)).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
