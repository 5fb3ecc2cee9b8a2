//! Error and panic handling middleware.
//!
//! [`ErrorHandler`] turns an error produced further down the chain into a
//! plain text response carrying the error's status, and makes sure no layer
//! above it handles the same error again. [`PanicHandler`] answers 500 when a
//! handler panics.

use std::{
    any::Any,
    fmt,
    future::Future,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::ready;
use futures_util::FutureExt;
use futures_util::future::CatchUnwind;
use pin_project_lite::pin_project;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::http::header::ContentType;
use actix_web::{Error, HttpRequest, HttpResponse, ResponseError};

/// Called with the original error before anything else happens to it.
pub type LogFn = Arc<dyn Fn(fmt::Arguments<'_>) + Send + Sync>;

/// Replaces an error with the one sent to the client.
///
/// The request is `None` when the error was returned by a middleware instead
/// of a handler; actix-web has dropped the request by then.
pub type ConvertErrorFn = Arc<dyn Fn(Option<&HttpRequest>, &Error) -> Error + Send + Sync>;

/// Settings of an [`ErrorHandler`]. Both functions are optional.
#[derive(Clone, Default)]
pub struct FaultConfig {
    log: Option<LogFn>,
    convert: Option<ConvertErrorFn>,
}

impl FaultConfig {
    pub fn new() -> Self {
        FaultConfig::default()
    }

    /// Log every handled error with `log`.
    pub fn log_with<F>(mut self, log: F) -> Self
    where
        F: Fn(fmt::Arguments<'_>) + Send + Sync + 'static,
    {
        self.log = Some(Arc::new(log));
        self
    }

    /// Convert every handled error with `convert` before responding.
    pub fn convert_with<F>(mut self, convert: F) -> Self
    where
        F: Fn(Option<&HttpRequest>, &Error) -> Error + Send + Sync + 'static,
    {
        self.convert = Some(Arc::new(convert));
        self
    }

    fn handle(&self, req: Option<&HttpRequest>, err: &Error) -> Handled {
        if let Some(log) = &self.log {
            log(format_args!("{err}"));
        }

        match &self.convert {
            Some(convert) => Handled::from_error(&convert(req, err)),
            None => Handled::from_error(err),
        }
    }
}

impl fmt::Debug for FaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultConfig")
            .field("log", &self.log.is_some())
            .field("convert", &self.convert.is_some())
            .finish()
    }
}

/// Middleware answering errors from the rest of the chain.
///
/// The status comes from the error's [`ResponseError::status_code`], which is
/// 500 for errors that do not declare one; the body is the error message.
/// The response leaves this middleware without an error attached, so outer
/// middleware see a regular response.
///
/// # Examples
/// ```rust
/// use actix_web::{App, error};
/// use actix_web_middleware_accesslog::{ErrorHandler, FaultConfig};
///
/// let app = App::new().wrap(ErrorHandler::new(
///     FaultConfig::new()
///         .log_with(|args| eprintln!("request failed: {args}"))
///         .convert_with(|_req, err| error::ErrorInternalServerError(err.to_string())),
/// ));
/// ```
#[derive(Clone, Debug)]
pub struct ErrorHandler(Arc<FaultConfig>);

impl ErrorHandler {
    pub fn new(config: FaultConfig) -> Self {
        ErrorHandler(Arc::new(config))
    }
}

impl Default for ErrorHandler {
    /// Handler logging errors with `log::error!` and converting nothing.
    fn default() -> Self {
        ErrorHandler::new(FaultConfig::new().log_with(|args| log::error!("{args}")))
    }
}

impl<S, B> Transform<S, ServiceRequest> for ErrorHandler
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ErrorHandlerService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ErrorHandlerService {
            service,
            config: Arc::clone(&self.0),
        }))
    }
}

/// Error handler middleware service.
pub struct ErrorHandlerService<S> {
    config: Arc<FaultConfig>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for ErrorHandlerService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = ErrorHandlerResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        ErrorHandlerResponse {
            fut: self.service.call(req),
            config: Arc::clone(&self.config),
            _phantom: PhantomData,
        }
    }
}

pin_project! {
    pub struct ErrorHandlerResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        config: Arc<FaultConfig>,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for ErrorHandlerResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<EitherBody<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match ready!(this.fut.poll(cx)) {
            Ok(res) => {
                let handled = match res.response().error() {
                    Some(err) if !Handled::is(err) => this.config.handle(Some(res.request()), err),
                    _ => return Poll::Ready(Ok(res.map_into_left_body())),
                };

                let (req, _) = res.into_parts();
                let res = ServiceResponse::new(req, handled.error_response());
                Poll::Ready(Ok(res.map_into_right_body()))
            }
            Err(err) if Handled::is(&err) => Poll::Ready(Err(err)),
            Err(err) => Poll::Ready(Err(this.config.handle(None, &err).into())),
        }
    }
}

/// Middleware recovering from panics in the rest of the chain.
///
/// The panic message goes to the log function and the client gets a plain
/// `500 Internal Server Error`. Put it inside [`ErrorHandler`] and the access
/// logger so both see the 500.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_accesslog::{ErrorHandler, PanicHandler};
///
/// let app = App::new()
///     .wrap(PanicHandler::new(|args| eprintln!("{args}")))
///     .wrap(ErrorHandler::default());
/// ```
#[derive(Clone)]
pub struct PanicHandler {
    log: Option<LogFn>,
}

impl PanicHandler {
    pub fn new<F>(log: F) -> Self
    where
        F: Fn(fmt::Arguments<'_>) + Send + Sync + 'static,
    {
        PanicHandler {
            log: Some(Arc::new(log)),
        }
    }

    /// Recover without logging anything.
    pub fn silent() -> Self {
        PanicHandler { log: None }
    }
}

impl Default for PanicHandler {
    /// Handler logging panics with `log::error!`.
    fn default() -> Self {
        PanicHandler::new(|args| log::error!("{args}"))
    }
}

impl fmt::Debug for PanicHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicHandler")
            .field("log", &self.log.is_some())
            .finish()
    }
}

impl<S, B> Transform<S, ServiceRequest> for PanicHandler
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = PanicHandlerService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(PanicHandlerService {
            service,
            log: self.log.clone(),
        }))
    }
}

/// Panic handler middleware service.
pub struct PanicHandlerService<S> {
    log: Option<LogFn>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for PanicHandlerService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = PanicHandlerResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let fut = match panic::catch_unwind(AssertUnwindSafe(|| self.service.call(req))) {
            Ok(fut) => Some(AssertUnwindSafe(fut).catch_unwind()),
            Err(payload) => {
                recovered(self.log.as_ref(), payload.as_ref());
                None
            }
        };

        PanicHandlerResponse {
            fut,
            log: self.log.clone(),
            _phantom: PhantomData,
        }
    }
}

pin_project! {
    pub struct PanicHandlerResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        // None when the call itself panicked
        #[pin]
        fut: Option<CatchUnwind<AssertUnwindSafe<S::Future>>>,
        log: Option<LogFn>,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for PanicHandlerResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<B>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let Some(fut) = this.fut.as_pin_mut() else {
            return Poll::Ready(Err(Handled::internal().into()));
        };

        match ready!(fut.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(payload) => {
                recovered(this.log.as_ref(), payload.as_ref());
                Poll::Ready(Err(Handled::internal().into()))
            }
        }
    }
}

fn recovered(log: Option<&LogFn>, payload: &(dyn Any + Send)) {
    let Some(log) = log else {
        return;
    };

    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");
    log(format_args!("recovered from panic: {message}"));
}

/// An error that has already been answered by an [`ErrorHandler`] or a
/// [`PanicHandler`].
///
/// Only travels up the chain when the failing layer returned `Err` and no
/// request is left to build a response for; outer handlers let it through.
#[derive(Debug)]
struct Handled {
    status: StatusCode,
    message: String,
}

impl Handled {
    fn from_error(err: &Error) -> Self {
        Handled {
            status: err.as_response_error().status_code(),
            message: err.to_string(),
        }
    }

    fn internal() -> Self {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        Handled {
            status,
            message: status.canonical_reason().unwrap_or_default().to_string(),
        }
    }

    fn is(err: &Error) -> bool {
        err.as_error::<Handled>().is_some()
    }
}

impl fmt::Display for Handled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl ResponseError for Handled {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status)
            .insert_header(ContentType::plaintext())
            .body(self.message.clone())
    }
}
