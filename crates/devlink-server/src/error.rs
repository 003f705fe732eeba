//! Request rejections.
//!
//! Everything that can go wrong before a connection is upgraded. After the
//! upgrade, failures end only the session involved and are reported as close
//! frames instead.

use crate::auth::BindingError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{error, warn};

/// Pre-upgrade rejection.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No authenticated account on the request.
    #[error("User not logged in")]
    NotLoggedIn,

    /// Query parameters missing or malformed.
    #[error("{0}")]
    BadRequest(String),

    /// The device is not bound to the account.
    #[error("device not binding")]
    NotBound,

    /// The binding store could not answer.
    #[error("Service Temporary Unavailable")]
    Unavailable(#[source] BindingError),

    /// The request could not be upgraded to a WebSocket.
    #[error("websocket upgrade failed")]
    UpgradeFailed(String),
}

impl RelayError {
    /// HTTP status for this rejection.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotLoggedIn => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotBound => StatusCode::NOT_FOUND,
            Self::Unavailable(_) | Self::UpgradeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotLoggedIn => "not_logged_in",
            Self::BadRequest(_) => "bad_request",
            Self::NotBound => "not_bound",
            Self::Unavailable(_) => "unavailable",
            Self::UpgradeFailed(_) => "upgrade_failed",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match &self {
            Self::Unavailable(e) => error!(error = %e, "Binding lookup failed"),
            Self::UpgradeFailed(e) => warn!(error = %e, "WebSocket upgrade failed"),
            _ => {}
        }
        crate::metrics::record_rejection(self.kind());

        let body = Json(serde_json::json!({ "reason": self.to_string() }));
        (self.status(), body).into_response()
    }
}
