use std::{
    fmt::{self, Write as _},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use actix_web::{HttpMessage, HttpRequest};
use actix_web::cookie::Cookie;
use actix_web::http::header::{self, HeaderMap, HeaderName};
use actix_web::http::{Method, StatusCode, Uri, Version};
use time::OffsetDateTime;
use time::format_description::OwnedFormatItem;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use uuid::Uuid;

use crate::template::{Field, Node, Template, TimeLayout};

const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Everything needed to render one access log line.
///
/// Request metadata is copied out when the request enters the logger, the
/// response side is filled in once the inner service is done. The context is
/// owned by a single request and consumed when its line is written.
#[derive(Debug)]
pub struct RequestLogContext {
    started: Instant,
    time: OffsetDateTime,
    method: Method,
    uri: Uri,
    version: Version,
    host: String,
    peer_addr: Option<SocketAddr>,
    headers: HeaderMap,
    request_id: String,
    form: Vec<(String, String)>,
    status: StatusCode,
    bytes_out: usize,
    error: Option<String>,
    custom_time_format: Option<Arc<OwnedFormatItem>>,
}

impl RequestLogContext {
    /// Snapshot `req` and start the clock.
    ///
    /// The request ID is resolved here: `request_id_header` wins if the client
    /// sent it, otherwise an ID already stored in the request extensions is
    /// reused, and only then a new one is generated and stored.
    pub fn new(req: &HttpRequest, request_id_header: &HeaderName) -> Self {
        let host = request_host(req);
        let request_id = request_id(req, request_id_header);

        RequestLogContext {
            started: Instant::now(),
            time: OffsetDateTime::now_utc(),
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            host,
            peer_addr: req.peer_addr(),
            headers: req.headers().clone(),
            request_id,
            form: Vec::new(),
            status: StatusCode::OK,
            bytes_out: 0,
            error: None,
            custom_time_format: None,
        }
    }

    pub(crate) fn with_time_format(mut self, format: Option<Arc<OwnedFormatItem>>) -> Self {
        self.custom_time_format = format;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn set_form(&mut self, form: Vec<(String, String)>) {
        self.form = form;
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_error(&mut self, error: &dyn fmt::Display) {
        self.error = Some(error.to_string());
    }

    pub fn set_bytes_out(&mut self, size: usize) {
        self.bytes_out = size;
    }

    fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn write_remote_ip(&self, out: &mut String) {
        if let Some(ip) = self.header(X_REAL_IP).map(str::trim).filter(|ip| !ip.is_empty()) {
            out.push_str(ip);
            return;
        }

        let forwarded = self
            .header(header::X_FORWARDED_FOR)
            .and_then(|list| list.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            out.push_str(ip);
            return;
        }

        if let Some(addr) = self.peer_addr {
            let _ = write!(out, "{}", addr.ip());
        }
    }

    fn write_time(&self, layout: TimeLayout, out: &mut String) {
        let time = self.time;
        let formatted = match layout {
            TimeLayout::Rfc3339 => time
                .replace_nanosecond(0)
                .ok()
                .and_then(|t| t.format(&Rfc3339).ok()),
            TimeLayout::Rfc3339Nano => time.format(&Rfc3339).ok(),
            TimeLayout::Rfc2822 => time.format(&Rfc2822).ok(),
            TimeLayout::Unix => Some(time.unix_timestamp().to_string()),
            TimeLayout::UnixMilli => Some((time.unix_timestamp_nanos() / 1_000_000).to_string()),
            TimeLayout::UnixMicro => Some((time.unix_timestamp_nanos() / 1_000).to_string()),
            TimeLayout::UnixNano => Some(time.unix_timestamp_nanos().to_string()),
            TimeLayout::Custom => match &self.custom_time_format {
                Some(format) => time.format(&**format).ok(),
                None => return self.write_time(TimeLayout::DEFAULT, out),
            },
        };

        if let Some(formatted) = formatted {
            out.push_str(&formatted);
        }
    }

    fn query(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::COOKIE)
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| Cookie::parse(pair.trim()).ok())
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_string())
    }
}

impl Field {
    /// Append the value of this field for `ctx` to `out`.
    ///
    /// Never fails: anything missing from the request resolves to an empty
    /// string, or `0` for sizes.
    pub fn resolve(&self, ctx: &RequestLogContext, out: &mut String) {
        match self {
            Field::Time(layout) => ctx.write_time(*layout, out),
            Field::Id => out.push_str(&ctx.request_id),
            Field::RemoteIp => ctx.write_remote_ip(out),
            Field::Host => out.push_str(&ctx.host),
            Field::Method => out.push_str(ctx.method.as_str()),
            Field::Uri => match ctx.uri.path_and_query() {
                Some(origin) => out.push_str(origin.as_str()),
                None => {
                    let _ = write!(out, "{}", ctx.uri);
                }
            },
            Field::Path => match ctx.uri.path() {
                "" => out.push('/'),
                path => out.push_str(path),
            },
            Field::Protocol => out.push_str(protocol(ctx.version)),
            Field::Referer => out.push_str(ctx.header(header::REFERER).unwrap_or_default()),
            Field::UserAgent => out.push_str(ctx.header(header::USER_AGENT).unwrap_or_default()),
            Field::Status => out.push_str(ctx.status.as_str()),
            Field::Error => out.push_str(ctx.error.as_deref().unwrap_or_default()),
            Field::Latency => {
                let _ = write!(out, "{}", ctx.started.elapsed().as_nanos());
            }
            Field::LatencyHuman => out.push_str(&human_duration(ctx.started.elapsed())),
            Field::BytesIn => {
                let size = ctx
                    .header(header::CONTENT_LENGTH)
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(0);
                let _ = write!(out, "{size}");
            }
            Field::BytesOut => {
                let _ = write!(out, "{}", ctx.bytes_out);
            }
            Field::Header(name) => out.push_str(ctx.header(name).unwrap_or_default()),
            Field::Query(name) => out.push_str(&ctx.query(name).unwrap_or_default()),
            Field::Form(name) => {
                match ctx.form.iter().find(|(key, _)| key == name) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&ctx.query(name).unwrap_or_default()),
                }
            }
            Field::Cookie(name) => out.push_str(&ctx.cookie(name).unwrap_or_default()),
        }
    }
}

impl Template {
    /// Render one log line, without the trailing newline.
    pub fn render(&self, ctx: &RequestLogContext) -> String {
        let mut line = String::with_capacity(256);
        self.render_into(ctx, &mut line);
        line
    }

    pub fn render_into(&self, ctx: &RequestLogContext, out: &mut String) {
        for node in self.nodes() {
            match node {
                Node::Literal(text) => out.push_str(text),
                Node::Field(field) => field.resolve(ctx, out),
            }
        }
    }
}

/// Request ID stored in the request extensions when the logger had to
/// generate one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new() -> Self {
        #[cfg(not(feature = "uuid_v7"))]
        {
            Self(Uuid::new_v4())
        }
        #[cfg(feature = "uuid_v7")]
        {
            Self(Uuid::now_v7())
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.as_hyphenated(), f)
    }
}

/// The `Host` header as sent, or the URI authority for HTTP/2 requests.
/// Forwarding headers are not consulted.
fn request_host(req: &HttpRequest) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default()
        .to_string()
}

fn request_id(req: &HttpRequest, header: &HeaderName) -> String {
    let provided = req
        .headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    if let Some(id) = provided {
        return id.to_string();
    }

    #[cfg(feature = "tracing-request-id")]
    if let Some(id) = req.extensions().get::<tracing_actix_web::RequestId>() {
        return id.to_string();
    }

    if let Some(id) = req.extensions().get::<RequestId>() {
        return id.to_string();
    }

    let id = RequestId::new();
    req.extensions_mut().insert(id);
    id.to_string()
}

fn protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "unknown",
    }
}

/// Format `duration` the way Go's `time.Duration` prints: `850ns`, `12.5µs`,
/// `1.2ms`, `3.25s`, `1m2.5s`, `1h0m0s`.
pub(crate) fn human_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    match nanos {
        0 => "0s".to_string(),
        1..1_000 => format!("{nanos}ns"),
        1_000..1_000_000 => with_fraction(nanos, 1_000, "µs"),
        1_000_000..1_000_000_000 => with_fraction(nanos, 1_000_000, "ms"),
        _ => {
            let secs = duration.as_secs();
            let (hours, minutes) = (secs / 3600, secs / 60 % 60);
            let mut out = String::new();
            if hours > 0 {
                let _ = write!(out, "{hours}h");
            }
            if hours > 0 || minutes > 0 {
                let _ = write!(out, "{minutes}m");
            }
            let rest = u128::from(secs % 60) * 1_000_000_000 + u128::from(duration.subsec_nanos());
            out.push_str(&with_fraction(rest, 1_000_000_000, "s"));
            out
        }
    }
}

fn with_fraction(value: u128, unit: u128, suffix: &str) -> String {
    let (whole, fraction) = (value / unit, value % unit);
    if fraction == 0 {
        return format!("{whole}{suffix}");
    }

    let width = unit.ilog10() as usize;
    let digits = format!("{fraction:0width$}");
    format!("{whole}.{}{suffix}", digits.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::Method, test::TestRequest};

    fn render(format: &str, ctx: &RequestLogContext) -> String {
        Template::compile(format).unwrap().render(ctx)
    }

    fn context(req: TestRequest) -> RequestLogContext {
        RequestLogContext::new(
            &req.to_http_request(),
            &HeaderName::from_static("x-request-id"),
        )
    }

    #[test]
    fn test_literal_fidelity() {
        let ctx = context(TestRequest::default());
        assert_eq!(render("nothing to see here", &ctx), "nothing to see here");
    }

    #[test]
    fn test_request_fields() {
        let ctx = context(
            TestRequest::default()
                .method(Method::POST)
                .uri("/users/42?page=2")
                .insert_header(("host", "example.com"))
                .insert_header(("user-agent", "test-agent"))
                .insert_header(("referer", "https://example.com"))
                .insert_header(("content-length", "512"))
                .insert_header(("x-custom-header", "AAA-CUSTOM-VALUE")),
        );

        assert_eq!(render("${method}", &ctx), "POST");
        assert_eq!(render("${uri}", &ctx), "/users/42?page=2");
        assert_eq!(render("${path}", &ctx), "/users/42");
        assert_eq!(render("${protocol}", &ctx), "HTTP/1.1");
        assert_eq!(render("${host}", &ctx), "example.com");
        assert_eq!(render("${user_agent}", &ctx), "test-agent");
        assert_eq!(render("${referer}", &ctx), "https://example.com");
        assert_eq!(render("${bytes_in}", &ctx), "512");
        assert_eq!(render("${header:X-Custom-Header}", &ctx), "AAA-CUSTOM-VALUE");
        assert_eq!(render("${query:page}", &ctx), "2");
    }

    #[test]
    fn test_response_fields() {
        let mut ctx = context(TestRequest::default());
        assert_eq!(render("${status}|${bytes_out}|${error}", &ctx), "200|0|");

        ctx.set_status(StatusCode::NOT_FOUND);
        ctx.set_bytes_out(1024);
        ctx.set_error(&"no such user");
        assert_eq!(
            render("${status}|${bytes_out}|${error}", &ctx),
            "404|1024|no such user"
        );
    }

    #[test]
    fn test_missing_values_resolve_empty() {
        let ctx = context(TestRequest::default().uri("/"));
        assert_eq!(render("[${header:X-Missing}]", &ctx), "[]");
        assert_eq!(render("[${query:username}]", &ctx), "[]");
        assert_eq!(render("[${form:username}]", &ctx), "[]");
        assert_eq!(render("[${cookie:session}]", &ctx), "[]");
        assert_eq!(render("[${referer}${user_agent}]", &ctx), "[]");
        assert_eq!(render("${bytes_in}", &ctx), "0");

        let ctx = context(TestRequest::default().insert_header(("content-length", "lots")));
        assert_eq!(render("${bytes_in}", &ctx), "0");
    }

    #[test]
    fn test_query_and_form() {
        let mut ctx = context(TestRequest::default().uri("/?username=alice&tag=a&tag=b"));
        assert_eq!(render("${query:username}", &ctx), "alice");
        assert_eq!(render("${query:tag}", &ctx), "a");
        // form falls back to the query string
        assert_eq!(render("${form:username}", &ctx), "alice");

        ctx.set_form(vec![("username".to_string(), "bob".to_string())]);
        assert_eq!(render("${form:username}", &ctx), "bob");
        assert_eq!(render("${query:username}", &ctx), "alice");
    }

    #[test]
    fn test_cookie() {
        let ctx = context(TestRequest::default().insert_header((
            "cookie",
            "_ga=GA1.2.000000000.0000000000; session=ac08034cd216a647fc2eb62f2bcf7b810",
        )));
        assert_eq!(
            render("${cookie:session}", &ctx),
            "ac08034cd216a647fc2eb62f2bcf7b810"
        );
        assert_eq!(render("${cookie:_ga}", &ctx), "GA1.2.000000000.0000000000");
    }

    #[test]
    fn test_host_is_not_taken_from_forwarding_headers() {
        let ctx = context(
            TestRequest::default()
                .insert_header(("host", "real.example"))
                .insert_header(("x-forwarded-host", "evil.example"))
                .insert_header(("forwarded", "host=evil.example")),
        );
        assert_eq!(render("${host}", &ctx), "real.example");

        let ctx = context(TestRequest::default().uri("/"));
        assert_eq!(render("[${host}]", &ctx), "[]");

        let ctx = context(TestRequest::default().uri("http://a.example/p?q=1"));
        assert_eq!(render("${host}", &ctx), "a.example");
    }

    #[test]
    fn test_uri_is_origin_form() {
        let ctx = context(TestRequest::default().uri("http://a.example/p?q=1"));
        assert_eq!(render("${uri}", &ctx), "/p?q=1");
        assert_eq!(render("${path}", &ctx), "/p");
    }

    #[test]
    fn test_context_without_request_id_header() {
        let header = HeaderName::from_static("x-request-id");
        let req = TestRequest::default()
            .insert_header(("host", "real.example"))
            .to_http_request();
        let ctx = RequestLogContext::new(&req, &header);

        assert!(!ctx.request_id().is_empty());
        assert_eq!(render("${host}", &ctx), "real.example");
        assert!(req.extensions().get::<RequestId>().is_some());
    }

    #[test]
    fn test_empty_path() {
        let mut ctx = context(TestRequest::default());
        ctx.uri = Uri::from_static("example.com:443");
        assert_eq!(render("${path}", &ctx), "/");
    }

    #[test]
    fn test_remote_ip_precedence() {
        let peer: SocketAddr = "10.0.0.1:4711".parse().unwrap();

        let ctx = context(
            TestRequest::default()
                .peer_addr(peer)
                .insert_header(("x-real-ip", "127.0.0.1"))
                .insert_header(("x-forwarded-for", "1.2.3.4, 5.6.6.7")),
        );
        assert_eq!(render("${remote_ip}", &ctx), "127.0.0.1");

        let ctx = context(
            TestRequest::default()
                .peer_addr(peer)
                .insert_header(("x-forwarded-for", "1.2.3.4, 5.6.6.7")),
        );
        assert_eq!(render("${remote_ip}", &ctx), "1.2.3.4");

        let ctx = context(
            TestRequest::default()
                .peer_addr(peer)
                .insert_header(("x-real-ip", "")),
        );
        assert_eq!(render("${remote_ip}", &ctx), "10.0.0.1");

        let ctx = context(TestRequest::default());
        assert_eq!(render("${remote_ip}", &ctx), "");
    }

    #[test]
    fn test_request_id() {
        let header = HeaderName::from_static("x-request-id");

        let req = TestRequest::default()
            .insert_header(("x-request-id", "6ba7b810-9dad-11d1-80b4-00c04fd430c8"))
            .to_http_request();
        let ctx = RequestLogContext::new(&req, &header);
        assert_eq!(render("${id}", &ctx), "6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        assert!(req.extensions().get::<RequestId>().is_none());

        // generated once, then reused from the extensions
        let req = TestRequest::default().to_http_request();
        let first = RequestLogContext::new(&req, &header);
        let stored = *req.extensions().get::<RequestId>().unwrap();
        assert_eq!(first.request_id(), stored.to_string());
        let second = RequestLogContext::new(&req, &header);
        assert_eq!(second.request_id(), first.request_id());
    }

    #[test]
    fn test_request_id_generation() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_time_layouts() {
        let mut ctx = context(TestRequest::default());
        ctx.time = OffsetDateTime::from_unix_timestamp_nanos(1_559_155_860_123_000_000).unwrap();

        assert_eq!(render("${time_rfc3339}", &ctx), "2019-05-29T18:51:00Z");
        assert_eq!(render("${time_rfc3339_nano}", &ctx), "2019-05-29T18:51:00.123Z");
        assert_eq!(render("${time_rfc2822}", &ctx), "Wed, 29 May 2019 18:51:00 +0000");
        assert_eq!(render("${time_unix}", &ctx), "1559155860");
        assert_eq!(render("${time_unix_milli}", &ctx), "1559155860123");
        assert_eq!(render("${time_unix_micro}", &ctx), "1559155860123000");
        assert_eq!(render("${time_unix_nano}", &ctx), "1559155860123000000");
        // unknown layouts and an unset custom layout use the default
        assert_eq!(render("${time_kitchen}", &ctx), "2019-05-29T18:51:00.123Z");
        assert_eq!(render("${time_custom}", &ctx), "2019-05-29T18:51:00.123Z");

        let format = time::format_description::parse_owned::<2>("[year]/[month]/[day]").unwrap();
        let ctx = ctx.with_time_format(Some(Arc::new(format)));
        assert_eq!(render("${time_custom}", &ctx), "2019/05/29");
    }

    #[test]
    fn test_latency() {
        let mut ctx = context(TestRequest::default());
        ctx.started = Instant::now() - Duration::from_millis(5);

        let latency: u128 = render("${latency}", &ctx).parse().unwrap();
        assert!(latency >= 5_000_000);
        assert!(render("${latency_human}", &ctx).ends_with("ms"));
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(Duration::ZERO), "0s");
        assert_eq!(human_duration(Duration::from_nanos(850)), "850ns");
        assert_eq!(human_duration(Duration::from_nanos(12_500)), "12.5µs");
        assert_eq!(human_duration(Duration::from_micros(1_200)), "1.2ms");
        assert_eq!(human_duration(Duration::from_millis(7)), "7ms");
        assert_eq!(human_duration(Duration::from_millis(3_250)), "3.25s");
        assert_eq!(human_duration(Duration::from_millis(62_500)), "1m2.5s");
        assert_eq!(human_duration(Duration::from_secs(3_600)), "1h0m0s");
        assert_eq!(human_duration(Duration::from_nanos(1_000_000_001)), "1.000000001s");
    }

    #[test]
    fn test_end_to_end_line() {
        let ctx = context(TestRequest::default().method(Method::GET).uri("/"));
        assert_eq!(render("${method} ${path} ${status}", &ctx), "GET / 200");
    }
}
