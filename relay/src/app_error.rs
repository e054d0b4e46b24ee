use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Failures of the JSON-RPC front door. Each carries the request id so the
/// error envelope can echo it (`null` when the id could not be read).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Method not found")]
    MethodNotFound { id: Value },
    #[error("Invalid params: {message}")]
    InvalidParams { id: Value, message: String },
    #[error("Parse error")]
    ParseError,
    #[error("Internal error: {cause}")]
    Internal { id: Value, cause: anyhow::Error },
}

impl AppError {
    pub fn code(&self) -> i64 {
        match self {
            AppError::MethodNotFound { .. } => -32601,
            AppError::InvalidParams { .. } => -32602,
            AppError::ParseError => -32700,
            AppError::Internal { .. } => -32603,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn id(&self) -> Value {
        match self {
            AppError::MethodNotFound { id } | AppError::InvalidParams { id, .. } | AppError::Internal { id, .. } => {
                id.clone()
            }
            AppError::ParseError => Value::Null,
        }
    }

    /// Client-facing message. Internal details stay in the log.
    fn message(&self) -> String {
        match self {
            AppError::Internal { .. } => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    jsonrpc: &'static str,
    error: ErrorObject,
    id: Value,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal { cause, .. } = &self {
            tracing::error!("internal error: {cause:#}");
        }
        let body = ErrorEnvelope {
            jsonrpc: "2.0",
            error: ErrorObject {
                code: self.code(),
                message: self.message(),
            },
            id: self.id(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn render(err: AppError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_method_not_found_keeps_id() {
        let (status, body) = render(AppError::MethodNotFound { id: json!(7) }).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["error"]["code"], -32601);
        assert_eq!(body["id"], 7);
    }

    #[tokio::test]
    async fn test_internal_hides_details() {
        let err = AppError::Internal {
            id: json!("abc"),
            cause: anyhow::anyhow!("database exploded"),
        };
        let (status, body) = render(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], -32603);
        assert_eq!(body["error"]["message"], "Internal error");
        assert_eq!(body["id"], "abc");
    }

    #[tokio::test]
    async fn test_parse_error_has_null_id() {
        let (status, body) = render(AppError::ParseError).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], -32700);
        assert!(body["id"].is_null());
    }
}
