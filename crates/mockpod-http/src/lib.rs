use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single header field as it appeared on the wire. Name comparisons are
/// case-insensitive; wire order is preserved by keeping headers in a `Vec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

pub fn header_value<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.is(name))
        .map(|header| header.value.as_str())
}

pub fn has_header_token(headers: &[HttpHeader], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.is(name))
        .flat_map(|header| header.value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

/// Headers the response composer always removes before re-framing a message:
/// the composer recomputes `Content-Length` from the final body and sets
/// `Connection` explicitly.
pub const FRAMING_HEADERS: [&str; 4] = [
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "connection",
];

pub fn strip_framing_headers(headers: &[HttpHeader]) -> Vec<HttpHeader> {
    headers
        .iter()
        .filter(|header| !FRAMING_HEADERS.iter().any(|name| header.is(name)))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseHead {
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadParseError {
    InvalidUtf8,
    MissingRequestLine,
    InvalidRequestLine,
    UnsupportedHttpVersion,
    InvalidStatusCode,
    MalformedHeaderLine,
    InvalidContentLength,
}

impl HeadParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MissingRequestLine => "missing_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::UnsupportedHttpVersion => "unsupported_http_version",
            Self::InvalidStatusCode => "invalid_status_code",
            Self::MalformedHeaderLine => "malformed_header_line",
            Self::InvalidContentLength => "invalid_content_length",
        }
    }
}

impl fmt::Display for HeadParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl StdError for HeadParseError {}

pub fn parse_request_head(raw: &[u8]) -> Result<HttpRequestHead, HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(HeadParseError::MissingRequestLine)?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HeadParseError::MissingRequestLine)?;
    let target = parts.next().ok_or(HeadParseError::InvalidRequestLine)?;
    let version_text = parts.next().ok_or(HeadParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(HeadParseError::InvalidRequestLine);
    }
    let version = parse_version(version_text)?;

    let headers = parse_header_lines(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(HttpRequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub fn parse_response_head(
    raw: &[u8],
    request_method: &str,
) -> Result<HttpResponseHead, HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or(HeadParseError::MissingRequestLine)?;

    let mut parts = status_line.split_whitespace();
    let version_text = parts.next().ok_or(HeadParseError::InvalidRequestLine)?;
    let status_text = parts.next().ok_or(HeadParseError::InvalidRequestLine)?;
    let reason_phrase = parts.collect::<Vec<_>>().join(" ");
    let version = parse_version(version_text)?;
    let status_code = status_text
        .parse::<u16>()
        .map_err(|_| HeadParseError::InvalidStatusCode)?;

    let headers = parse_header_lines(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status_code)?;
    let mut connection_close = is_connection_close(version, &headers);
    if body_mode == HttpBodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(HttpResponseHead {
        version,
        status_code,
        reason_phrase,
        headers,
        body_mode,
        connection_close,
    })
}

fn parse_version(text: &str) -> Result<HttpVersion, HeadParseError> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(HeadParseError::UnsupportedHttpVersion),
    }
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<HttpHeader>, HeadParseError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HeadParseError::MalformedHeaderLine)?;
        headers.push(HttpHeader::new(name.trim(), value.trim()));
    }
    Ok(headers)
}

fn request_body_mode(headers: &[HttpHeader]) -> Result<HttpBodyMode, HeadParseError> {
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(HttpBodyMode::Chunked);
    }
    if let Some(length) = parse_content_length(headers)? {
        return Ok(if length == 0 {
            HttpBodyMode::None
        } else {
            HttpBodyMode::ContentLength(length)
        });
    }
    Ok(HttpBodyMode::None)
}

fn response_body_mode(
    headers: &[HttpHeader],
    request_method: &str,
    status_code: u16,
) -> Result<HttpBodyMode, HeadParseError> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return Ok(HttpBodyMode::None);
    }

    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(HttpBodyMode::Chunked);
    }
    if let Some(length) = parse_content_length(headers)? {
        return Ok(if length == 0 {
            HttpBodyMode::None
        } else {
            HttpBodyMode::ContentLength(length)
        });
    }

    Ok(HttpBodyMode::CloseDelimited)
}

fn parse_content_length(headers: &[HttpHeader]) -> Result<Option<u64>, HeadParseError> {
    let mut value = None;
    for header in headers {
        if header.is("content-length") {
            let parsed = header
                .value
                .parse::<u64>()
                .map_err(|_| HeadParseError::InvalidContentLength)?;
            value = Some(parsed);
        }
    }
    Ok(value)
}

fn is_connection_close(version: HttpVersion, headers: &[HttpHeader]) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    if version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive") {
        return true;
    }
    false
}

/// Target of a `CONNECT host[:port]` request. The port defaults to 443 when
/// the authority omits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectParseError {
    EmptyRequestLine,
    InvalidRequestLine,
    MethodNotConnect,
    InvalidHttpVersion,
    InvalidAuthority,
    InvalidPort,
}

impl ConnectParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::MethodNotConnect => "method_not_connect",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidAuthority => "invalid_authority",
            Self::InvalidPort => "invalid_port",
        }
    }
}

impl fmt::Display for ConnectParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl StdError for ConnectParseError {}

pub fn parse_connect_request_line(request_line: &str) -> Result<ConnectTarget, ConnectParseError> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ConnectParseError::EmptyRequestLine)?;
    let authority = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;

    if parts.next().is_some() {
        return Err(ConnectParseError::InvalidRequestLine);
    }
    if method != "CONNECT" {
        return Err(ConnectParseError::MethodNotConnect);
    }
    if !version.starts_with("HTTP/") {
        return Err(ConnectParseError::InvalidHttpVersion);
    }

    parse_connect_authority(authority)
}

pub fn parse_connect_authority(authority: &str) -> Result<ConnectTarget, ConnectParseError> {
    if authority.is_empty() {
        return Err(ConnectParseError::InvalidAuthority);
    }

    if authority.starts_with('[') {
        let bracket_close = authority
            .find(']')
            .ok_or(ConnectParseError::InvalidAuthority)?;
        let host = &authority[1..bracket_close];
        if host.is_empty() {
            return Err(ConnectParseError::InvalidAuthority);
        }

        let suffix = &authority[bracket_close + 1..];
        if suffix.is_empty() {
            return Ok(ConnectTarget {
                host: host.to_string(),
                port: 443,
            });
        }
        let port_text = suffix
            .strip_prefix(':')
            .ok_or(ConnectParseError::InvalidAuthority)?;
        let port = port_text
            .parse::<u16>()
            .map_err(|_| ConnectParseError::InvalidPort)?;
        return Ok(ConnectTarget {
            host: host.to_string(),
            port,
        });
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) => {
            if host.is_empty() || host.contains(':') {
                return Err(ConnectParseError::InvalidAuthority);
            }
            let port = port_text
                .parse::<u16>()
                .map_err(|_| ConnectParseError::InvalidPort)?;
            Ok(ConnectTarget {
                host: host.to_string(),
                port,
            })
        }
        None => Ok(ConnectTarget {
            host: authority.to_string(),
            port: 443,
        }),
    }
}

/// Absolute-form request target as used by HTTP proxies:
/// `http://host[:port]/path?query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path_query: String,
}

impl AbsoluteUrl {
    /// Reconstructs the absolute URL, omitting the default port.
    pub fn full(&self) -> String {
        let default_port = default_scheme_port(&self.scheme);
        if Some(self.port) == default_port {
            format!("{}://{}{}", self.scheme, self.host, self.path_query)
        } else {
            format!(
                "{}://{}:{}{}",
                self.scheme, self.host, self.port, self.path_query
            )
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlParseError {
    MissingScheme,
    UnsupportedScheme,
    InvalidAuthority,
    InvalidPort,
}

impl UrlParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingScheme => "missing_scheme",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::InvalidAuthority => "invalid_authority",
            Self::InvalidPort => "invalid_port",
        }
    }
}

impl fmt::Display for UrlParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl StdError for UrlParseError {}

fn default_scheme_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

pub fn parse_absolute_url(target: &str) -> Result<AbsoluteUrl, UrlParseError> {
    let (scheme, rest) = target
        .split_once("://")
        .ok_or(UrlParseError::MissingScheme)?;
    let scheme = scheme.to_ascii_lowercase();
    let default_port = default_scheme_port(&scheme).ok_or(UrlParseError::UnsupportedScheme)?;

    let (authority, path_query) = match rest.find(['/', '?']) {
        Some(split_at) => {
            let (authority, remainder) = rest.split_at(split_at);
            let path_query = if remainder.starts_with('?') {
                format!("/{remainder}")
            } else {
                remainder.to_string()
            };
            (authority, path_query)
        }
        None => (rest, "/".to_string()),
    };

    if authority.is_empty() {
        return Err(UrlParseError::InvalidAuthority);
    }

    let (host, port) = if authority.starts_with('[') {
        let bracket_close = authority.find(']').ok_or(UrlParseError::InvalidAuthority)?;
        let host = &authority[1..bracket_close];
        if host.is_empty() {
            return Err(UrlParseError::InvalidAuthority);
        }
        let suffix = &authority[bracket_close + 1..];
        if suffix.is_empty() {
            (host.to_string(), default_port)
        } else {
            let port_text = suffix
                .strip_prefix(':')
                .ok_or(UrlParseError::InvalidAuthority)?;
            let port = port_text
                .parse::<u16>()
                .map_err(|_| UrlParseError::InvalidPort)?;
            (host.to_string(), port)
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port_text)) => {
                if host.is_empty() || host.contains(':') {
                    return Err(UrlParseError::InvalidAuthority);
                }
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| UrlParseError::InvalidPort)?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), default_port),
        }
    };

    Ok(AbsoluteUrl {
        scheme,
        host,
        port,
        path_query,
    })
}

pub fn default_reason(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        418 => "I'm a teapot",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::{
        has_header_token, header_value, parse_absolute_url, parse_connect_request_line,
        parse_request_head, parse_response_head, strip_framing_headers, ConnectParseError,
        HeadParseError, HttpBodyMode, HttpHeader, HttpVersion, UrlParseError,
    };

    #[test]
    fn parses_request_head_with_headers_and_content_length() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: api.test\r\nContent-Length: 5\r\n\r\n";
        let head = parse_request_head(raw).expect("must parse");
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/submit");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.body_mode, HttpBodyMode::ContentLength(5));
        assert_eq!(header_value(&head.headers, "host"), Some("api.test"));
        assert!(!head.connection_close);
    }

    #[test]
    fn request_with_chunked_transfer_encoding_is_chunked() {
        let raw = b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        let head = parse_request_head(raw).expect("must parse");
        assert_eq!(head.body_mode, HttpBodyMode::Chunked);
    }

    #[test]
    fn rejects_request_line_with_too_many_fields() {
        let raw = b"GET / HTTP/1.1 extra\r\n\r\n";
        let error = parse_request_head(raw).expect_err("must fail");
        assert_eq!(error, HeadParseError::InvalidRequestLine);
    }

    #[test]
    fn http10_request_without_keep_alive_closes() {
        let raw = b"GET / HTTP/1.0\r\nHost: a\r\n\r\n";
        let head = parse_request_head(raw).expect("must parse");
        assert!(head.connection_close);
    }

    #[test]
    fn response_head_for_head_request_has_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let head = parse_response_head(raw, "HEAD").expect("must parse");
        assert_eq!(head.body_mode, HttpBodyMode::None);
    }

    #[test]
    fn response_without_framing_headers_is_close_delimited() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: stub\r\n\r\n";
        let head = parse_response_head(raw, "GET").expect("must parse");
        assert_eq!(head.body_mode, HttpBodyMode::CloseDelimited);
        assert!(head.connection_close);
    }

    #[test]
    fn response_status_and_reason_parse() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let head = parse_response_head(raw, "GET").expect("must parse");
        assert_eq!(head.status_code, 404);
        assert_eq!(head.reason_phrase, "Not Found");
        assert_eq!(head.body_mode, HttpBodyMode::None);
    }

    #[test]
    fn header_token_matching_is_case_insensitive_and_list_aware() {
        let headers = vec![HttpHeader::new("Connection", "Keep-Alive, Upgrade")];
        assert!(has_header_token(&headers, "connection", "keep-alive"));
        assert!(has_header_token(&headers, "CONNECTION", "upgrade"));
        assert!(!has_header_token(&headers, "connection", "close"));
    }

    #[test]
    fn strips_all_framing_headers_case_insensitively() {
        let headers = vec![
            HttpHeader::new("Content-Length", "10"),
            HttpHeader::new("transfer-encoding", "chunked"),
            HttpHeader::new("CONTENT-ENCODING", "gzip"),
            HttpHeader::new("Connection", "close"),
            HttpHeader::new("Set-Cookie", "s=1"),
        ];
        let kept = strip_framing_headers(&headers);
        assert_eq!(kept, vec![HttpHeader::new("Set-Cookie", "s=1")]);
    }

    #[test]
    fn parses_connect_line_with_explicit_port() {
        let target =
            parse_connect_request_line("CONNECT api.test:8443 HTTP/1.1").expect("must parse");
        assert_eq!(target.host, "api.test");
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn connect_port_defaults_to_443() {
        let target = parse_connect_request_line("CONNECT api.test HTTP/1.1").expect("must parse");
        assert_eq!(target.host, "api.test");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn parses_connect_line_with_bracketed_ipv6_authority() {
        let target =
            parse_connect_request_line("CONNECT [2001:db8::1]:8443 HTTP/1.1").expect("must parse");
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn rejects_non_connect_method() {
        let error = parse_connect_request_line("GET / HTTP/1.1").expect_err("must fail");
        assert_eq!(error, ConnectParseError::MethodNotConnect);
    }

    #[test]
    fn rejects_unbracketed_ipv6_authority() {
        let error =
            parse_connect_request_line("CONNECT 2001:db8::1:443 HTTP/1.1").expect_err("must fail");
        assert_eq!(error, ConnectParseError::InvalidAuthority);
    }

    #[test]
    fn parses_absolute_url_with_default_port() {
        let url = parse_absolute_url("http://example.test/a?x=1").expect("must parse");
        assert_eq!(url.scheme, "http");
        assert_eq!(url.host, "example.test");
        assert_eq!(url.port, 80);
        assert_eq!(url.path_query, "/a?x=1");
        assert_eq!(url.full(), "http://example.test/a?x=1");
    }

    #[test]
    fn parses_absolute_url_with_explicit_port_and_bare_authority() {
        let url = parse_absolute_url("https://api.test:8443").expect("must parse");
        assert_eq!(url.port, 8443);
        assert_eq!(url.path_query, "/");
        assert_eq!(url.full(), "https://api.test:8443/");
    }

    #[test]
    fn absolute_url_retains_non_default_port_in_full_form() {
        let url = parse_absolute_url("http://127.0.0.1:8080/a").expect("must parse");
        assert_eq!(url.full(), "http://127.0.0.1:8080/a");
    }

    #[test]
    fn rejects_unsupported_scheme_and_missing_scheme() {
        assert_eq!(
            parse_absolute_url("ftp://example.test/a").expect_err("must fail"),
            UrlParseError::UnsupportedScheme
        );
        assert_eq!(
            parse_absolute_url("/origin-form").expect_err("must fail"),
            UrlParseError::MissingScheme
        );
    }
}
