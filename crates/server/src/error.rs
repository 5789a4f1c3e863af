use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// Stable machine-readable error codes returned in the response envelope.
///
/// Capability routes deliberately collapse every invalid-credential case —
/// unknown, expired, revoked, or wrong tier — into `NotFound`, so that key
/// existence and tier can never be probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    PermissionDenied,
    InvalidRequest,
    InvalidPath,
    AppendNotFound,
    Conflict,
    TokenInvalid,
    TokenExpired,
    TokenAlreadyUsed,
    KeyRevoked,
    ConnectionLimitExceeded,
    ServerBusy,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidPath => "INVALID_PATH",
            Self::AppendNotFound => "APPEND_NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            Self::KeyRevoked => "KEY_REVOKED",
            Self::ConnectionLimitExceeded => "CONNECTION_LIMIT_EXCEEDED",
            Self::ServerBusy => "SERVER_BUSY",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::InvalidPath => StatusCode::BAD_REQUEST,
            Self::AppendNotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::TokenInvalid => StatusCode::UNAUTHORIZED,
            Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::TokenAlreadyUsed => StatusCode::UNAUTHORIZED,
            Self::KeyRevoked => StatusCode::UNAUTHORIZED,
            Self::ConnectionLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::Unauthorized => "missing or malformed credential",
            Self::NotFound => "not found",
            Self::PermissionDenied => "caller lacks required permission",
            Self::InvalidRequest => "request validation failed",
            Self::InvalidPath => "path is invalid",
            Self::AppendNotFound => "append not found",
            Self::Conflict => "resource already exists",
            Self::TokenInvalid => "subscription token is invalid",
            Self::TokenExpired => "subscription token has expired",
            Self::TokenAlreadyUsed => "subscription token was already redeemed",
            Self::KeyRevoked => "capability key has been revoked",
            Self::ConnectionLimitExceeded => "too many connections for this key",
            Self::ServerBusy => "workspace connection capacity reached",
            Self::RateLimited => "request was rate limited",
            Self::InternalError => "internal server error",
        }
    }
}

/// An API error carried to the handler boundary and rendered as the
/// `{ok:false, error:{code, message}}` envelope.
#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code.as_str(),
            "message": self.message,
        });

        if let Some(details) = self.details {
            if let (Some(target), Some(extra)) = (error.as_object_mut(), details.as_object()) {
                for (key, value) in extra {
                    target.insert(key.clone(), value.clone());
                }
            }
        }

        (self.code.status(), Json(json!({ "ok": false, "error": error }))).into_response()
    }
}

/// Wrap successful response data in the `{ok:true, data}` envelope.
pub fn ok_envelope(data: Value) -> Json<Value> {
    Json(json!({ "ok": true, "data": data }))
}

/// Envelope variant carrying a browser-facing URL alongside the data.
pub fn ok_envelope_with_web_url(data: Value, web_url: &str) -> Json<Value> {
    Json(json!({ "ok": true, "data": data, "webUrl": web_url }))
}

/// Translate any storage-layer failure into the public taxonomy.
///
/// No raw rusqlite error text ever reaches a caller; the original error is
/// logged server-side with full context instead.
pub fn storage_error(error: anyhow::Error) -> ApiError {
    tracing::error!(error = ?error, "storage operation failed");
    ApiError::from_code(ErrorCode::InternalError)
}
