//! Actix-web middleware for template based access logs and error responses.
//! The log format follows the `${field}` template style of Go web frameworks.
//!
//! # Examples:
//! ## By default the access log is written to stdout.
//! ```bash
//! cargo add actix-web-middleware-accesslog
//! ```
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_accesslog::{AccessLogger, ErrorHandler};
//!
//! #[actix_web::main] // or #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let logger = AccessLogger::default();
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(ErrorHandler::default())
//!             .wrap(logger.clone())
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind("127.0.0.1:8080")?;
//!     Ok(())
//! }
//! ```
//! ## Lines can be forwarded to the `log` facade instead.
//! Example usage with `structured_logger` crate:
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_accesslog::{AccessLogger, LoggerConfig, Output};
//! use tokio;
//! use structured_logger::{Builder, async_json::new_writer};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     Builder::new()
//!         .with_target_writer("*", new_writer(tokio::io::stdout()))
//!         .init();
//!
//!     let logger = AccessLogger::new(
//!         LoggerConfig::new("${remote_ip} \"${method} ${uri} ${protocol}\" ${status} ${bytes_out} ${latency_human}")
//!             .output(Output::log("http_access")),
//!     )
//!     .expect("valid access log format");
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(logger.clone())
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind("127.0.0.1:8080")?;
//!     Ok(())
//! }
//! ```
//! # Features
//! - Access log lines rendered from a template compiled once at startup
//! - Request and response fields, request headers, query, form and cookie values
//! - Request ID tracking (with UUID v4 or v7 support)
//! - Integration with tracing ecosystem via `tracing-request-id` feature
//! - Pattern-based path exclusion
//! - Error middleware answering failures with their status and message
//! - Panic recovery answering `500 Internal Server Error`
//!
//! # Template fields
//!
//! A field is written `${name}`, or `${name:param}` for lookups. Any other
//! text is copied verbatim.
//!
//! - `time_rfc3339`, `time_rfc3339_nano`, `time_rfc2822`, `time_unix`,
//!   `time_unix_milli`, `time_unix_micro`, `time_unix_nano`, `time_custom` -
//!   request time, UTC
//! - `id` - request ID, from the request or generated
//! - `remote_ip` - `X-Real-IP`, then the first `X-Forwarded-For` entry, then the peer address
//! - `host`, `method`, `uri`, `path`, `protocol`, `referer`, `user_agent`
//! - `status` - response status code
//! - `error` - message of the error the request ended with
//! - `latency` - nanoseconds, `latency_human` - e.g. `1.2ms`
//! - `bytes_in` - request `Content-Length`, `bytes_out` - response body size
//! - `header:NAME`, `query:NAME`, `form:NAME`, `cookie:NAME`
//!
//! Unknown fields are rejected by [`AccessLogger::new`]. Missing values
//! render as an empty string.
//!
//! ## Path Exclusions
//!
//! ```rust
//! use actix_web_middleware_accesslog::{AccessLogger, LoggerConfig};
//! use regex::Regex;
//!
//! let logger = AccessLogger::new(
//!     LoggerConfig::default()
//!         .exclude("/health")
//!         .exclude_regex(Regex::new(r"^/assets/.*").unwrap()),
//! );
//! ```
//!
//! # Feature Flags
//!
//! - `uuid_v4` (default) - Generate UUIDv4 request IDs
//! - `uuid_v7` - Use UUIDv7 instead of UUIDv4 for request IDs
//! - `tracing-request-id` - Reuse `tracing-actix-web`'s request ID

mod error;
mod fault;
mod logger;
mod output;
mod resolver;
mod template;

pub use crate::error::{ConfigError, HttpError};
pub use crate::fault::{ConvertErrorFn, ErrorHandler, FaultConfig, LogFn, PanicHandler};
pub use crate::logger::{AccessLogger, DEFAULT_FORM_LIMIT, DEFAULT_FORMAT, LoggerConfig, StreamLog};
pub use crate::output::{Output, rust_log};
pub use crate::resolver::{RequestId, RequestLogContext};
pub use crate::template::{Field, Node, Template, TimeLayout};
