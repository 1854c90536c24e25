//! API response types
//!
//! The webhook endpoint has its own contract (always HTTP 200 with a
//! success flag; the signal source must never retry). Everything else
//! uses the unified `ApiResponse` wrapper.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::orchestrator::{AccountResult, BatchOutcome};

// ============================================================================
// Webhook contract
// ============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookSummary {
    pub total_accounts: usize,
    pub successful_orders: usize,
    pub failed_orders: usize,
}

#[derive(Debug, Serialize)]
pub struct PerformanceMetrics {
    pub elapsed_ms: u64,
    pub deadline_ms: u64,
    pub timed_out: bool,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub results: Vec<AccountResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<WebhookSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_metrics: Option<PerformanceMetrics>,
}

impl WebhookResponse {
    pub fn ok(
        action: String,
        strategy: String,
        outcome: BatchOutcome,
        metrics: PerformanceMetrics,
    ) -> Self {
        Self {
            success: outcome.failed_orders == 0,
            timeout: None,
            error: None,
            action: Some(action),
            strategy: Some(strategy),
            summary: Some(WebhookSummary {
                total_accounts: outcome.total_accounts,
                successful_orders: outcome.successful_orders,
                failed_orders: outcome.failed_orders,
            }),
            results: outcome.results,
            performance_metrics: Some(metrics),
        }
    }

    pub fn rejected(error: String) -> Self {
        Self {
            success: false,
            timeout: None,
            error: Some(error),
            action: None,
            strategy: None,
            results: Vec::new(),
            summary: None,
            performance_metrics: None,
        }
    }

    /// The deadline response. Never a 5xx: the signal source must not
    /// retry; in-flight work completes and the reconciler converges.
    pub fn timed_out(metrics: PerformanceMetrics) -> Self {
        Self {
            success: false,
            timeout: Some(true),
            error: None,
            action: None,
            strategy: None,
            results: Vec::new(),
            summary: None,
            performance_metrics: Some(metrics),
        }
    }
}

// ============================================================================
// Unified API response format (non-webhook endpoints)
// ============================================================================

/// All non-webhook responses follow this structure:
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or null (error)
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Type alias for handler return types - reduces boilerplate
pub type ApiResult<T> =
    Result<(StatusCode, Json<ApiResponse<T>>), (StatusCode, Json<ApiResponse<()>>)>;

#[inline]
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

/// Unified API error with automatic IntoResponse.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, error_codes::AUTH_FAILED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error_codes::FORBIDDEN, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, error_codes::CONFLICT, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            msg,
        )
    }

    pub fn db_error(msg: impl std::fmt::Display) -> Self {
        Self::internal(format!("Database error: {}", msg))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ApiResponse::<()>::error(self.code, self.message));
        (self.status, body).into_response()
    }
}

impl From<ApiError> for (StatusCode, Json<ApiResponse<()>>) {
    fn from(err: ApiError) -> Self {
        (
            err.status,
            Json(ApiResponse::<()>::error(err.code, err.message)),
        )
    }
}

/// Standard API error codes
pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;

    // Auth errors (2xxx)
    pub const AUTH_FAILED: i32 = 2002;
    pub const FORBIDDEN: i32 = 2003;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4091;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_timeout_shape() {
        let resp = WebhookResponse::timed_out(PerformanceMetrics {
            elapsed_ms: 10_000,
            deadline_ms: 10_000,
            timed_out: true,
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["timeout"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_webhook_summary_field_names() {
        let resp = WebhookResponse::ok(
            "LIMIT".to_string(),
            "s1".to_string(),
            BatchOutcome {
                results: Vec::new(),
                successful_orders: 1,
                failed_orders: 0,
                total_accounts: 1,
            },
            PerformanceMetrics {
                elapsed_ms: 42,
                deadline_ms: 10_000,
                timed_out: false,
            },
        );
        let json = serde_json::to_value(&resp).unwrap();
        // Contractual field names.
        assert_eq!(json["summary"]["successful_orders"], 1);
        assert_eq!(json["summary"]["failed_orders"], 0);
        assert_eq!(json["summary"]["total_accounts"], 1);
    }
}
