use actix_web::ResponseError;
use actix_web::http::StatusCode;
use thiserror::Error;

/// Errors raised while building an [`AccessLogger`](crate::AccessLogger).
///
/// These are startup errors: a logger with an invalid template is never
/// constructed, so nothing is reported per request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown template field `{0}`")]
    UnknownField(String),

    #[error("template field `{0}` requires a parameter, e.g. `${{{0}:name}}`")]
    MissingParam(String),

    #[error("template field `{0}` does not take a parameter")]
    UnexpectedParam(String),

    #[error("unterminated template tag starting at byte {0}")]
    UnterminatedTag(usize),

    #[error("invalid header name `{0}` in template")]
    InvalidHeaderName(String),

    #[error("invalid custom time format: {0}")]
    InvalidTimeFormat(String),
}

/// Error carrying the HTTP status it should be answered with.
///
/// Returned from handlers, it is turned into a response with that status and
/// the message as body, both by actix-web itself and by
/// [`ErrorHandler`](crate::ErrorHandler).
///
/// # Examples
/// ```rust
/// use actix_web::{HttpResponse, http::StatusCode};
/// use actix_web_middleware_accesslog::HttpError;
///
/// async fn show_user() -> Result<HttpResponse, HttpError> {
///     Err(HttpError::new(StatusCode::NOT_FOUND, "no such user"))
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        HttpError {
            status,
            message: message.into(),
        }
    }

    /// Error with the canonical reason phrase as message, e.g. `Not Found`.
    pub fn from_status(status: StatusCode) -> Self {
        HttpError::new(status, status.canonical_reason().unwrap_or_default())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl ResponseError for HttpError {
    fn status_code(&self) -> StatusCode {
        self.status
    }
}
