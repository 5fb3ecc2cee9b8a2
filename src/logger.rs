use std::{
    borrow::Cow,
    collections::HashSet,
    future::{Future, poll_fn},
    marker::PhantomData,
    pin::{Pin, pin},
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_core::{Stream, future::LocalBoxFuture, ready};
use pin_project_lite::pin_project;
use regex::Regex;
use time::format_description::{self, OwnedFormatItem};

use actix_http::error::PayloadError;
use actix_http::h1;
use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{self, HeaderName};
use actix_web::{Error, HttpMessage, Result};

use crate::error::ConfigError;
use crate::output::Output;
use crate::resolver::RequestLogContext;
use crate::template::Template;

/// Format used when [`LoggerConfig`] is given an empty one.
pub const DEFAULT_FORMAT: &str = concat!(
    r#"{"time":"${time_rfc3339_nano}","id":"${id}","remote_ip":"${remote_ip}","#,
    r#""host":"${host}","method":"${method}","uri":"${uri}","user_agent":"${user_agent}","#,
    r#""status":${status},"error":"${error}","latency":${latency},"#,
    r#""latency_human":"${latency_human}","bytes_in":${bytes_in},"bytes_out":${bytes_out}}"#,
);

/// Largest urlencoded body buffered for `${form:...}` fields.
pub const DEFAULT_FORM_LIMIT: usize = 64 * 1024;

const DEFAULT_REQUEST_ID_HEADER: &str = "x-request-id";

/// Middleware that writes one line per request, rendered from a template.
///
/// The template is compiled once, in [`AccessLogger::new`]; a bad template is
/// reported there and never at request time. The line is written when the
/// response body has been fully sent, so `${bytes_out}` and `${latency}`
/// cover the whole exchange.
///
/// An `AccessLogger` is cheap to clone and safe to build outside the
/// `HttpServer::new` closure; every worker then shares the same output.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_accesslog::{AccessLogger, LoggerConfig, Output};
///
/// let logger = AccessLogger::new(
///     LoggerConfig::new("${remote_ip} ${method} ${uri} ${status} ${latency_human}")
///         .output(Output::stderr())
///         .exclude("/health"),
/// )
/// .unwrap();
///
/// let app = App::new().wrap(logger);
/// ```
#[derive(Clone)]
pub struct AccessLogger(Arc<Inner>);

struct Inner {
    template: Template,
    output: Output,
    custom_time_format: Option<Arc<OwnedFormatItem>>,
    request_id_header: HeaderName,
    form_limit: usize,
    exclude: HashSet<String>,
    exclude_regex: Vec<Regex>,
}

/// Settings of an [`AccessLogger`]. Nothing is validated until
/// [`AccessLogger::new`].
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    format: String,
    output: Output,
    custom_time_format: Option<String>,
    request_id_header: Cow<'static, str>,
    form_limit: usize,
    exclude: HashSet<String>,
    exclude_regex: Vec<Regex>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig::new(DEFAULT_FORMAT)
    }
}

impl LoggerConfig {
    /// Start from `format`. An empty format means [`DEFAULT_FORMAT`].
    pub fn new(format: impl Into<String>) -> Self {
        LoggerConfig {
            format: format.into(),
            output: Output::default(),
            custom_time_format: None,
            request_id_header: Cow::Borrowed(DEFAULT_REQUEST_ID_HEADER),
            form_limit: DEFAULT_FORM_LIMIT,
            exclude: HashSet::new(),
            exclude_regex: Vec::new(),
        }
    }

    /// Where lines go. Stdout by default.
    pub fn output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    /// Layout of `${time_custom}`, in the `time` crate's format description
    /// syntax, e.g. `[year]-[month]-[day] [hour]:[minute]:[second]`.
    pub fn custom_time_format(mut self, format: impl Into<String>) -> Self {
        self.custom_time_format = Some(format.into());
        self
    }

    /// Header checked for a client supplied request ID. `x-request-id` by default.
    pub fn request_id_header(mut self, header: impl Into<Cow<'static, str>>) -> Self {
        self.request_id_header = header.into();
        self
    }

    /// Largest body buffered for `${form:...}` fields.
    pub fn form_limit(mut self, limit: usize) -> Self {
        self.form_limit = limit;
        self
    }

    /// Ignore and do not log access info for specified path.
    pub fn exclude<T: Into<String>>(mut self, path: T) -> Self {
        self.exclude.insert(path.into());
        self
    }

    /// Ignore and do not log access info for paths that match regex.
    pub fn exclude_regex(mut self, regex: Regex) -> Self {
        self.exclude_regex.push(regex);
        self
    }
}

impl AccessLogger {
    /// Compile `config` into a middleware.
    pub fn new(config: LoggerConfig) -> Result<AccessLogger, ConfigError> {
        let format = match config.format.as_str() {
            "" => DEFAULT_FORMAT,
            format => format,
        };
        let template = Template::compile(format)?;

        let custom_time_format = config
            .custom_time_format
            .as_deref()
            .map(|format| {
                format_description::parse_owned::<2>(format)
                    .map(Arc::new)
                    .map_err(|err| ConfigError::InvalidTimeFormat(err.to_string()))
            })
            .transpose()?;

        let request_id_header = HeaderName::try_from(config.request_id_header.as_ref())
            .map_err(|_| ConfigError::InvalidHeaderName(config.request_id_header.to_string()))?;

        Ok(AccessLogger(Arc::new(Inner {
            template,
            output: config.output,
            custom_time_format,
            request_id_header,
            form_limit: config.form_limit,
            exclude: config.exclude,
            exclude_regex: config.exclude_regex,
        })))
    }

    pub fn template(&self) -> &Template {
        &self.0.template
    }
}

impl Default for AccessLogger {
    /// Logger with [`DEFAULT_FORMAT`] writing to stdout.
    fn default() -> Self {
        AccessLogger::new(LoggerConfig::default()).expect("default access log format compiles")
    }
}

impl Inner {
    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.contains(path) || self.exclude_regex.iter().any(|r| r.is_match(path))
    }

    fn context(&self, req: &ServiceRequest) -> RequestLogContext {
        RequestLogContext::new(req.request(), &self.request_id_header)
            .with_time_format(self.custom_time_format.clone())
    }

    fn emit(&self, ctx: &RequestLogContext) {
        self.output.write_line(self.template.render(ctx));
    }
}

impl<S, B> Transform<S, ServiceRequest> for AccessLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Transform = AccessLoggerService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AccessLoggerService {
            service: Rc::new(service),
            inner: Arc::clone(&self.0),
        }))
    }
}

/// Logger middleware service.
pub struct AccessLoggerService<S> {
    inner: Arc<Inner>,
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for AccessLoggerService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_service::forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            if inner.is_excluded(req.path()) {
                let res = service.call(req).await?;
                return Ok(res.map_body(|_, body| StreamLog::untracked(body)));
            }

            let mut ctx = inner.context(&req);

            if inner.template.uses_form() {
                match capture_form(&mut req, inner.form_limit).await {
                    Ok(form) => ctx.set_form(form),
                    Err(err) => {
                        let err = Error::from(err);
                        ctx.set_status(err.as_response_error().status_code());
                        ctx.set_error(&err);
                        inner.emit(&ctx);
                        return Err(err);
                    }
                }
            }

            AccessLoggerResponse::<S, B> {
                fut: service.call(req),
                ctx: Some(ctx),
                inner,
                _phantom: PhantomData,
            }
            .await
        })
    }
}

/// Buffer an urlencoded body small enough to log and put it back for the
/// handlers. Anything else is left untouched.
async fn capture_form(
    req: &mut ServiceRequest,
    limit: usize,
) -> Result<Vec<(String, String)>, PayloadError> {
    if req.content_type() != "application/x-www-form-urlencoded" {
        return Ok(Vec::new());
    }

    let length = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    let length = match length {
        Some(length) if length > 0 && length <= limit => length,
        _ => return Ok(Vec::new()),
    };

    let mut payload = pin!(req.take_payload());
    let mut body = BytesMut::with_capacity(length);
    let mut failure = None;

    while let Some(chunk) = poll_fn(|cx| payload.as_mut().poll_next(cx)).await {
        match chunk {
            Ok(chunk) => body.extend_from_slice(&chunk),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    let body = body.freeze();
    let (_, mut restored) = h1::Payload::create(true);
    restored.unread_data(body.clone());
    req.set_payload(restored.into());

    match failure {
        Some(err) => Err(err),
        None => Ok(url::form_urlencoded::parse(&body).into_owned().collect()),
    }
}

pin_project! {
    pub struct AccessLoggerResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        ctx: Option<RequestLogContext>,
        inner: Arc<Inner>,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for AccessLoggerResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<StreamLog<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let result = ready!(this.fut.poll(cx));
        // taken to move into the body; only missing if polled after completion
        let Some(mut ctx) = this.ctx.take() else {
            return Poll::Ready(result.map(|res| res.map_body(|_, body| StreamLog::untracked(body))));
        };

        let res = match result {
            Ok(res) => res,
            Err(err) => {
                // nothing will be streamed, log right away and hand the error on
                ctx.set_status(err.as_response_error().status_code());
                ctx.set_error(&err);
                this.inner.emit(&ctx);
                return Poll::Ready(Err(err));
            }
        };

        ctx.set_status(res.status());
        if let Some(error) = res.response().error() {
            log::debug!("Error in response: {:?}", error);
            ctx.set_error(error);
        }

        let pending = PendingLine {
            ctx,
            inner: Arc::clone(this.inner),
        };

        Poll::Ready(Ok(res.map_body(move |_, body| StreamLog {
            body,
            pending: Some(pending),
            size: 0,
        })))
    }
}

struct PendingLine {
    ctx: RequestLogContext,
    inner: Arc<Inner>,
}

pin_project! {
    /// Response body that counts streamed bytes and writes the access log
    /// line when dropped.
    pub struct StreamLog<B> {
        #[pin]
        body: B,
        pending: Option<PendingLine>,
        size: usize,
    }

    impl<B> PinnedDrop for StreamLog<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(PendingLine { mut ctx, inner }) = this.pending.take() {
                ctx.set_bytes_out(*this.size);
                inner.emit(&ctx);
            }
        }
    }
}

impl<B> StreamLog<B> {
    fn untracked(body: B) -> Self {
        StreamLog {
            body,
            pending: None,
            size: 0,
        }
    }
}

impl<B: MessageBody> MessageBody for StreamLog<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.size += chunk.len();
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}
