use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

/// Provider messages that mean "ask for fewer blocks", not "the call failed".
const SPAN_TOO_WIDE_KEYWORDS: &[&str] = &[
    "block range is too large",
    "too many results",
    "query timeout",
    "response size exceeded",
    "limit exceeded",
    "more than",
];

#[derive(Debug, Error)]
pub enum AppError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("RPC {method} error: {message}")]
    Rpc { method: String, message: String },

    #[error("RPC call failed after {attempts} attempts on method={method}: {last_error}")]
    RpcExhausted {
        method: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// True for the provider-capacity class: the range should be shrunk and retried.
    pub fn is_span_too_wide(&self) -> bool {
        let message = match self {
            AppError::Rpc { message, .. } => message.to_lowercase(),
            AppError::RpcExhausted { last_error, .. } => last_error.to_lowercase(),
            _ => return false,
        };
        SPAN_TOO_WIDE_KEYWORDS.iter().any(|k| message.contains(k))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_too_wide_detected_on_rpc_errors_only() {
        let e = AppError::Rpc {
            method: "eth_getLogs".into(),
            message: "{\"code\":-32005,\"message\":\"Block range is too large\"}".into(),
        };
        assert!(e.is_span_too_wide());

        let e = AppError::RpcExhausted {
            method: "eth_getLogs".into(),
            attempts: 4,
            last_error: "query timeout exceeded".into(),
        };
        assert!(e.is_span_too_wide());

        let e = AppError::Rpc {
            method: "eth_getLogs".into(),
            message: "invalid params".into(),
        };
        assert!(!e.is_span_too_wide());

        assert!(!AppError::Config("more than one".into()).is_span_too_wide());
    }
}
