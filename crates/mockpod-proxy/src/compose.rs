use bytes::Bytes;
use mockpod_http::{
    default_reason, strip_framing_headers, HttpHeader, HttpResponseHead, FRAMING_HEADERS,
};
use mockpod_rules::MockRule;

/// Appended to every response produced from a rule, so clients and tests can
/// tell mocked traffic from live traffic.
pub const RULE_MARKER_HEADER: &str = "X-Mockpod-Rule";

/// Reserved pseudo-host and path serving the root CA certificate download.
pub const CERT_HOST: &str = "mockpod.local";
pub const CERT_PATH: &str = "/mockpod/cert";

const CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";
const CERT_DISPOSITION: &str = "attachment; filename=\"MockpodCA.der\"";

/// A fully decided client-facing response. Headers never contain framing
/// fields; the encoder emits exactly one `Content-Length` and an explicit
/// `Connection`.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedResponse {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<HttpHeader>,
    pub body: Bytes,
}

/// Upstream response forwarded as-is, minus framing headers.
pub fn pass_through(upstream: &HttpResponseHead, upstream_body: Bytes) -> ComposedResponse {
    ComposedResponse {
        status_code: upstream.status_code,
        reason_phrase: upstream.reason_phrase.clone(),
        headers: strip_framing_headers(&upstream.headers),
        body: upstream_body,
    }
}

/// Upstream response as the base, with the mock's status replacing the
/// upstream status, the mock body replacing the upstream body when non-empty,
/// and each mock header replacing-or-adding over the filtered upstream
/// headers.
pub fn overlay(
    upstream: &HttpResponseHead,
    upstream_body: Bytes,
    rule: &MockRule,
) -> ComposedResponse {
    let mut headers = strip_framing_headers(&upstream.headers);
    for mock_header in &rule.response.headers {
        if is_framing_header(mock_header) {
            continue;
        }
        replace_or_add(&mut headers, mock_header.clone());
    }
    headers.push(HttpHeader::new(RULE_MARKER_HEADER, &rule.name));

    let body = if rule.response.body.is_empty() {
        upstream_body
    } else {
        Bytes::from(rule.response.body.clone().into_bytes())
    };

    ComposedResponse {
        status_code: rule.response.status_code,
        reason_phrase: default_reason(rule.response.status_code).to_string(),
        headers,
        body,
    }
}

/// Response built entirely from the mock, without an upstream exchange.
/// `Content-Type: application/json` is defaulted when the mock left the body
/// untyped.
pub fn synthesize(rule: &MockRule) -> ComposedResponse {
    let mut headers = rule
        .response
        .headers
        .iter()
        .filter(|header| !is_framing_header(header))
        .cloned()
        .collect::<Vec<_>>();
    if !headers.iter().any(|header| header.is("content-type")) {
        headers.push(HttpHeader::new("Content-Type", "application/json"));
    }
    headers.push(HttpHeader::new(RULE_MARKER_HEADER, &rule.name));

    ComposedResponse {
        status_code: rule.response.status_code,
        reason_phrase: default_reason(rule.response.status_code).to_string(),
        headers,
        body: Bytes::from(rule.response.body.clone().into_bytes()),
    }
}

pub fn bad_gateway(detail: &str) -> ComposedResponse {
    ComposedResponse {
        status_code: 502,
        reason_phrase: default_reason(502).to_string(),
        headers: vec![HttpHeader::new("Content-Type", "text/plain")],
        body: Bytes::from(detail.as_bytes().to_vec()),
    }
}

/// The root CA download served for the reserved pseudo-host.
pub fn certificate_download(root_ca_der: &[u8]) -> ComposedResponse {
    ComposedResponse {
        status_code: 200,
        reason_phrase: default_reason(200).to_string(),
        headers: vec![
            HttpHeader::new("Content-Type", CERT_CONTENT_TYPE),
            HttpHeader::new("Content-Disposition", CERT_DISPOSITION),
        ],
        body: Bytes::from(root_ca_der.to_vec()),
    }
}

pub fn is_certificate_request(host: &str, path: &str) -> bool {
    host.eq_ignore_ascii_case(CERT_HOST) || path == CERT_PATH
}

/// Serializes the response as a raw HTTP/1.1 message. `Content-Length` is
/// recomputed from the final body; `Connection` is set explicitly.
pub fn encode(response: &ComposedResponse, connection: &str) -> Vec<u8> {
    let reason = if response.reason_phrase.is_empty() {
        default_reason(response.status_code)
    } else {
        &response.reason_phrase
    };
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status_code, reason);
    for header in &response.headers {
        head.push_str(&header.name);
        head.push_str(": ");
        head.push_str(&header.value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str(&format!("Connection: {connection}\r\n\r\n"));

    let mut message = head.into_bytes();
    message.extend_from_slice(&response.body);
    message
}

fn is_framing_header(header: &HttpHeader) -> bool {
    FRAMING_HEADERS.iter().any(|name| header.is(name))
}

fn replace_or_add(headers: &mut Vec<HttpHeader>, header: HttpHeader) {
    match headers.iter_mut().find(|existing| existing.is(&header.name)) {
        Some(existing) => existing.value = header.value,
        None => headers.push(header),
    }
}
