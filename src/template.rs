use std::{fmt, str::FromStr};

use actix_web::http::header::HeaderName;

use crate::error::ConfigError;

const TAG_OPEN: &str = "${";
const TAG_CLOSE: char = '}';
const PARAM_SEPARATOR: char = ':';

/// Access log format compiled once into literal text and field references.
///
/// The format language has a single construct: `${name}` or `${name:param}`.
/// Everything outside a tag is copied to the log line verbatim.
///
/// # Examples
/// ```rust
/// use actix_web_middleware_accesslog::{Field, Node, Template};
///
/// let template = Template::compile("${method} ${path} ${status}").unwrap();
/// assert_eq!(template.nodes()[0], Node::Field(Field::Method));
/// assert_eq!(template.nodes()[1], Node::Literal(" ".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

/// One piece of a compiled [`Template`], in output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Text emitted as is.
    Literal(String),
    /// Value looked up for every request.
    Field(Field),
}

/// A value the resolver knows how to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Request time in the given layout. Example: 2019-05-29T18:51:00.123Z
    Time(TimeLayout),
    /// Request ID. Example: 7b77f3f1-8e15-4b6a-9b3f-7f4b6f4b6f4b.
    /// Taken from the request if provided, generated otherwise.
    Id,
    /// Client IP address, proxy headers first. Example: 192.168.0.1
    RemoteIp,
    /// Host. Example: localhost
    Host,
    /// Method. Example: GET
    Method,
    /// Request target. Example: /index.html?page=2
    Uri,
    /// Request path. Example: /index.html
    Path,
    /// Version of the HTTP protocol. Example: HTTP/1.1
    Protocol,
    /// Referer. Example: https://actix.rs
    Referer,
    /// User agent. Example: Mozilla/5.0
    UserAgent,
    /// Status code. Example: 200, 404
    Status,
    /// Message of the error the request ended with, if any.
    Error,
    /// Duration of the request in nanoseconds. Example: 1200345
    Latency,
    /// Duration of the request in human units. Example: 1.200345ms
    LatencyHuman,
    /// Request `Content-Length`. Example: 512
    BytesIn,
    /// Size of the response body in bytes. Example: 1024
    BytesOut,
    /// Request header. Example: `${header:x-custom}`
    Header(HeaderName),
    /// Query string parameter. Example: `${query:page}`
    Query(String),
    /// Urlencoded form value, falling back to the query string. Example: `${form:username}`
    Form(String),
    /// Cookie value. Example: `${cookie:session}`
    Cookie(String),
}

/// Layouts of the `time_*` field family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeLayout {
    /// `2006-01-02T15:04:05Z`
    Rfc3339,
    /// `2006-01-02T15:04:05.999999999Z`, trailing zeros trimmed
    Rfc3339Nano,
    /// `Mon, 02 Jan 2006 15:04:05 +0000`
    Rfc2822,
    /// Seconds since the Unix epoch.
    Unix,
    UnixMilli,
    UnixMicro,
    UnixNano,
    /// Layout configured with [`LoggerConfig::custom_time_format`](crate::LoggerConfig::custom_time_format).
    Custom,
}

impl TimeLayout {
    /// Used for `time_*` names nobody recognizes.
    pub const DEFAULT: TimeLayout = TimeLayout::Rfc3339Nano;

    fn from_name(name: &str) -> TimeLayout {
        match name {
            "rfc3339" => TimeLayout::Rfc3339,
            "rfc3339_nano" => TimeLayout::Rfc3339Nano,
            "rfc2822" => TimeLayout::Rfc2822,
            "unix" => TimeLayout::Unix,
            "unix_milli" => TimeLayout::UnixMilli,
            "unix_micro" => TimeLayout::UnixMicro,
            "unix_nano" => TimeLayout::UnixNano,
            "custom" => TimeLayout::Custom,
            _ => TimeLayout::DEFAULT,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TimeLayout::Rfc3339 => "rfc3339",
            TimeLayout::Rfc3339Nano => "rfc3339_nano",
            TimeLayout::Rfc2822 => "rfc2822",
            TimeLayout::Unix => "unix",
            TimeLayout::UnixMilli => "unix_milli",
            TimeLayout::UnixMicro => "unix_micro",
            TimeLayout::UnixNano => "unix_nano",
            TimeLayout::Custom => "custom",
        }
    }
}

impl Template {
    /// Parse `format` into a template.
    ///
    /// Fails on unknown field names, on parameter misuse and on a `${` that is
    /// never closed. Compiling the same input twice yields equal templates.
    pub fn compile(format: &str) -> Result<Template, ConfigError> {
        let mut nodes = Vec::new();
        let mut rest = format;
        let mut offset = 0;

        while let Some(start) = rest.find(TAG_OPEN) {
            if start > 0 {
                nodes.push(Node::Literal(rest[..start].to_string()));
            }

            let tag_start = start + TAG_OPEN.len();
            let Some(tag_len) = rest[tag_start..].find(TAG_CLOSE) else {
                return Err(ConfigError::UnterminatedTag(offset + start));
            };

            let tag = &rest[tag_start..tag_start + tag_len];
            nodes.push(Node::Field(Field::parse(tag)?));

            let consumed = tag_start + tag_len + TAG_CLOSE.len_utf8();
            offset += consumed;
            rest = &rest[consumed..];
        }

        if !rest.is_empty() {
            nodes.push(Node::Literal(rest.to_string()));
        }

        Ok(Template { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Whether rendering needs the urlencoded request body.
    pub fn uses_form(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| matches!(node, Node::Field(Field::Form(_))))
    }
}

impl FromStr for Template {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::compile(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            match node {
                Node::Literal(text) => f.write_str(text)?,
                Node::Field(field) => write!(f, "{TAG_OPEN}{field}{TAG_CLOSE}")?,
            }
        }
        Ok(())
    }
}

impl Field {
    fn parse(tag: &str) -> Result<Field, ConfigError> {
        let (name, param) = match tag.split_once(PARAM_SEPARATOR) {
            Some((name, param)) => (name, Some(param)),
            None => (tag, None),
        };

        let field = match name {
            "id" => Field::Id,
            "remote_ip" => Field::RemoteIp,
            "host" => Field::Host,
            "method" => Field::Method,
            "uri" => Field::Uri,
            "path" => Field::Path,
            "protocol" => Field::Protocol,
            "referer" => Field::Referer,
            "user_agent" => Field::UserAgent,
            "status" => Field::Status,
            "error" => Field::Error,
            "latency" => Field::Latency,
            "latency_human" => Field::LatencyHuman,
            "bytes_in" => Field::BytesIn,
            "bytes_out" => Field::BytesOut,
            "header" | "query" | "form" | "cookie" => return Field::parse_lookup(name, param),
            _ => match name.strip_prefix("time_") {
                Some(layout) => Field::Time(TimeLayout::from_name(layout)),
                None => return Err(ConfigError::UnknownField(name.to_string())),
            },
        };

        match param {
            Some(_) => Err(ConfigError::UnexpectedParam(name.to_string())),
            None => Ok(field),
        }
    }

    fn parse_lookup(name: &str, param: Option<&str>) -> Result<Field, ConfigError> {
        let Some(param) = param.filter(|p| !p.is_empty()) else {
            return Err(ConfigError::MissingParam(name.to_string()));
        };

        Ok(match name {
            "header" => Field::Header(
                HeaderName::try_from(param)
                    .map_err(|_| ConfigError::InvalidHeaderName(param.to_string()))?,
            ),
            "query" => Field::Query(param.to_string()),
            "form" => Field::Form(param.to_string()),
            _ => Field::Cookie(param.to_string()),
        })
    }

    /// Name of the field as written in a template.
    pub fn name(&self) -> &'static str {
        match self {
            Field::Time(_) => "time",
            Field::Id => "id",
            Field::RemoteIp => "remote_ip",
            Field::Host => "host",
            Field::Method => "method",
            Field::Uri => "uri",
            Field::Path => "path",
            Field::Protocol => "protocol",
            Field::Referer => "referer",
            Field::UserAgent => "user_agent",
            Field::Status => "status",
            Field::Error => "error",
            Field::Latency => "latency",
            Field::LatencyHuman => "latency_human",
            Field::BytesIn => "bytes_in",
            Field::BytesOut => "bytes_out",
            Field::Header(_) => "header",
            Field::Query(_) => "query",
            Field::Form(_) => "form",
            Field::Cookie(_) => "cookie",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Time(layout) => write!(f, "time_{}", layout.name()),
            Field::Header(param) => write!(f, "{}{PARAM_SEPARATOR}{param}", self.name()),
            Field::Query(param) | Field::Form(param) | Field::Cookie(param) => {
                write!(f, "{}{PARAM_SEPARATOR}{param}", self.name())
            }
            _ => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_is_deterministic() {
        let format = r#"{"time":"${time_rfc3339_nano}","ch":"${header:X-Custom-Header}"}"#;
        assert_eq!(
            Template::compile(format).unwrap(),
            Template::compile(format).unwrap()
        );
    }

    #[test]
    fn test_compile_literal_only() {
        let template = Template::compile("plain text, no tags").unwrap();
        assert_eq!(
            template.nodes(),
            &[Node::Literal("plain text, no tags".to_string())]
        );

        assert!(Template::compile("").unwrap().nodes().is_empty());
    }

    #[test]
    fn test_compile_mixed() {
        let template = Template::compile("[${method}]${status}${query:user} done").unwrap();
        assert_eq!(
            template.nodes(),
            &[
                Node::Literal("[".to_string()),
                Node::Field(Field::Method),
                Node::Literal("]".to_string()),
                Node::Field(Field::Status),
                Node::Field(Field::Query("user".to_string())),
                Node::Literal(" done".to_string()),
            ]
        );
    }

    #[test]
    fn test_compile_lookups() {
        let template =
            Template::compile("${header:X-Custom}${form:username}${cookie:session}").unwrap();
        assert_eq!(
            template.nodes(),
            &[
                Node::Field(Field::Header(HeaderName::from_static("x-custom"))),
                Node::Field(Field::Form("username".to_string())),
                Node::Field(Field::Cookie("session".to_string())),
            ]
        );
        assert!(template.uses_form());
        assert!(!Template::compile("${query:username}").unwrap().uses_form());
    }

    #[test]
    fn test_param_is_taken_verbatim() {
        let template = Template::compile("${query:a:B c}").unwrap();
        assert_eq!(
            template.nodes(),
            &[Node::Field(Field::Query("a:B c".to_string()))]
        );
    }

    #[test]
    fn test_time_layouts() {
        let template = Template::compile("${time_rfc3339}${time_unix_milli}${time_custom}").unwrap();
        assert_eq!(
            template.nodes(),
            &[
                Node::Field(Field::Time(TimeLayout::Rfc3339)),
                Node::Field(Field::Time(TimeLayout::UnixMilli)),
                Node::Field(Field::Time(TimeLayout::Custom)),
            ]
        );

        // unknown layouts fall back instead of failing
        let template = Template::compile("${time_kitchen}").unwrap();
        assert_eq!(
            template.nodes(),
            &[Node::Field(Field::Time(TimeLayout::DEFAULT))]
        );
    }

    #[test]
    fn test_compile_errors() {
        assert_eq!(
            Template::compile("${nope}"),
            Err(ConfigError::UnknownField("nope".to_string()))
        );
        assert_eq!(
            Template::compile("${}"),
            Err(ConfigError::UnknownField(String::new()))
        );
        assert_eq!(
            Template::compile("${header}"),
            Err(ConfigError::MissingParam("header".to_string()))
        );
        assert_eq!(
            Template::compile("${cookie:}"),
            Err(ConfigError::MissingParam("cookie".to_string()))
        );
        assert_eq!(
            Template::compile("${status:x}"),
            Err(ConfigError::UnexpectedParam("status".to_string()))
        );
        assert_eq!(
            Template::compile("ok ${method"),
            Err(ConfigError::UnterminatedTag(3))
        );
        assert_eq!(
            Template::compile("${method} ${path"),
            Err(ConfigError::UnterminatedTag(10))
        );
        assert_eq!(
            Template::compile("${header:bad header}"),
            Err(ConfigError::InvalidHeaderName("bad header".to_string()))
        );
    }

    #[test]
    fn test_display_round_trip() {
        let format = "${remote_ip} - ${method} ${uri} ${status} ${header:x-id} ${time_unix}";
        let template: Template = format.parse().unwrap();
        assert_eq!(template.to_string(), format);
        assert_eq!(Template::compile(&template.to_string()).unwrap(), template);
    }
}
