use crate::common::util::{opt_body_serde_base64, StubBytes};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, convert::TryFrom};
use url::Url;

#[cfg(feature = "cookies")]
use headers::{Cookie, HeaderMapExt};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request data: {0}")]
    InvalidRequestData(String),
    #[error("cannot convert request to/from internal structure: {0}")]
    RequestConversionError(String),
    #[error("cookie parser error: {0}")]
    CookieParserError(String),
}

/// The normalized request abstraction the transport layer hands to the
/// serve pipeline. It carries everything the matching engine inspects:
/// scheme, host, port, client IP, URI, method, headers, body bytes and
/// pre-parsed multipart parts. No raw wire bytes are parsed here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HttpStubRequest {
    scheme: String,
    method: String,
    uri: String,
    host: Option<String>,
    port: Option<u16>,
    client_ip: Option<String>,
    headers: Vec<(String, String)>,
    body: StubBytes,
    multipart: Option<Vec<MultipartPart>>,
}

impl HttpStubRequest {
    /// Creates a request with the given method and URI (path plus optional
    /// query string). All other attributes default to empty and can be set
    /// with the `with_*` methods.
    pub fn new<M: Into<String>, U: Into<String>>(method: M, uri: U) -> Self {
        Self {
            scheme: "http".to_string(),
            method: method.into().to_uppercase(),
            uri: uri.into(),
            host: None,
            port: None,
            client_ip: None,
            headers: Vec::new(),
            body: StubBytes::default(),
            multipart: None,
        }
    }

    pub fn with_scheme<S: Into<String>>(mut self, scheme: S) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_client_ip<S: Into<String>>(mut self, ip: S) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body<B: Into<StubBytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_multipart(mut self, parts: Vec<MultipartPart>) -> Self {
        self.multipart = Some(parts);
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn method_str(&self) -> &str {
        &self.method
    }

    /// The full URI of the request (path and query, no authority part).
    pub fn uri_str(&self) -> &str {
        &self.uri
    }

    /// The path component of the URI, without the query string.
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    /// The raw query string, if one is present.
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    /// Returns the host the request was sent to: the explicitly set host
    /// first, the `Host` header otherwise.
    pub fn host(&self) -> Option<String> {
        if let Some(host) = &self.host {
            return Some(host.clone());
        }

        self.header_value("host")
            .and_then(|h| h.split(':').next().map(|s| s.to_string()))
    }

    /// The port the request was sent to. Falls back to 443 (https) or
    /// 80 (http) based on the scheme when no port is known.
    pub fn port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }

        if let Some(host) = self.header_value("host") {
            if let Some(port_str) = host.split(':').nth(1) {
                if let Ok(port) = port_str.parse::<u16>() {
                    return port;
                }
            }
        }

        if self.scheme.eq("https") {
            return 443;
        }

        80
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    pub fn headers_vec(&self) -> &Vec<(String, String)> {
        self.headers.as_ref()
    }

    /// The first value of the header with the given name, compared
    /// case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of the header with the given name, compared
    /// case-insensitively.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn headers(&self) -> http::HeaderMap<http::HeaderValue> {
        let mut header_map = http::HeaderMap::new();
        for (key, value) in &self.headers {
            let name = match http::HeaderName::from_bytes(key.as_bytes()) {
                Ok(n) => n,
                Err(_) => continue,
            };
            let value = match http::HeaderValue::from_str(value) {
                Ok(v) => v,
                Err(_) => continue,
            };
            header_map.append(name, value);
        }

        header_map
    }

    pub fn query_params(&self) -> HashMap<String, String> {
        self.query_params_vec().into_iter().collect()
    }

    pub fn query_params_vec(&self) -> Vec<(String, String)> {
        // There doesn't seem to be a way to just parse a query string with
        // the `url` crate, so we're prefixing a dummy URL for parsing.
        let url = format!("http://dummy?{}", self.query().unwrap_or(""));
        match Url::parse(&url) {
            Ok(url) => url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Decoded `application/x-www-form-urlencoded` body parameters. Empty
    /// when the request does not carry a form body.
    pub fn form_params_vec(&self) -> Vec<(String, String)> {
        let is_form = self
            .header_value("content-type")
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);

        if !is_form {
            return Vec::new();
        }

        form_urlencoded::parse(self.body.as_ref())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[cfg(feature = "cookies")]
    pub fn cookies(&self) -> Result<Vec<(String, String)>, Error> {
        let mut result = Vec::new();

        if let Some(cookie) = self.headers().typed_get::<Cookie>() {
            for (key, value) in cookie.iter() {
                result.push((key.to_string(), value.to_string()));
            }
        }

        Ok(result)
    }

    pub fn body(&self) -> &StubBytes {
        &self.body
    }

    pub fn body_string(&self) -> String {
        self.body.to_string()
    }

    pub fn multipart(&self) -> Option<&Vec<MultipartPart>> {
        self.multipart.as_ref()
    }
}

impl TryFrom<&http::Request<Bytes>> for HttpStubRequest {
    type Error = Error;

    fn try_from(value: &http::Request<Bytes>) -> Result<Self, Self::Error> {
        let mut headers = Vec::with_capacity(value.headers().len());
        for (name, header_value) in value.headers() {
            let value_str = header_value
                .to_str()
                .map_err(|e| Error::RequestConversionError(e.to_string()))?;
            headers.push((name.as_str().to_string(), value_str.to_string()));
        }

        let scheme = value
            .uri()
            .scheme_str()
            .unwrap_or("http")
            .to_string();

        let mut request = HttpStubRequest::new(
            value.method().to_string(),
            value
                .uri()
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| value.uri().path().to_string()),
        )
        .with_scheme(scheme)
        .with_body(StubBytes::from(value.body().clone()));

        request.headers = headers;
        Ok(request)
    }
}

/// One pre-parsed part of a `multipart/form-data` request body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: StubBytes,
}

impl MultipartPart {
    pub fn new<N: Into<String>, B: Into<StubBytes>>(name: N, body: B) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_file_name<S: Into<String>>(mut self, file_name: S) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The response specification attached to a stub mapping, and the shape
/// handed back to the transport layer after transformation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StubResponse {
    pub status: Option<u16>,
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default, with = "opt_body_serde_base64")]
    pub body: Option<StubBytes>,
    /// Reference to a body file resolved by the (external) persistence
    /// layer. This crate treats it as opaque.
    pub body_file: Option<String>,
    pub delay_ms: Option<u64>,
    /// Opaque fault name interpreted by the transport layer.
    pub fault: Option<String>,
    /// Names of response transformers this response opts into.
    pub transformers: Option<Vec<String>>,
    /// Parameters handed to the transformers, keyed by transformer name.
    pub transformer_parameters: Option<Value>,
}

impl StubResponse {
    pub fn new() -> Self {
        Self {
            status: None,
            headers: None,
            body: None,
            body_file: None,
            delay_ms: None,
            fault: None,
            transformers: None,
            transformer_parameters: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    pub fn with_body<B: Into<StubBytes>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_transformer<S: Into<String>>(mut self, name: S) -> Self {
        self.transformers.get_or_insert_with(Vec::new).push(name.into());
        self
    }

    pub fn body_string(&self) -> String {
        self.body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default()
    }
}

impl Default for StubResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&StubResponse> for http::Response<Bytes> {
    type Error = Error;

    fn try_from(value: &StubResponse) -> Result<Self, Self::Error> {
        let mut builder = http::Response::builder().status(value.status.unwrap_or(200));

        if let Some(headers) = &value.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }

        builder
            .body(
                value
                    .body
                    .as_ref()
                    .map(|b| b.to_bytes())
                    .unwrap_or_else(Bytes::new),
            )
            .map_err(|err| Error::RequestConversionError(err.to_string()))
    }
}

// ================================================================================================
// Diagnostic sub-events
// ================================================================================================

pub const SUB_EVENT_REQUEST_NOT_MATCHED: &str = "REQUEST_NOT_MATCHED";
pub const SUB_EVENT_JSON_PARSE_ERROR: &str = "JSON_PARSE_ERROR";
pub const SUB_EVENT_XML_PARSE_ERROR: &str = "XML_PARSE_ERROR";
pub const SUB_EVENT_REGEX_ERROR: &str = "REGEX_ERROR";
pub const SUB_EVENT_TEXT_DIFF: &str = "TEXT_DIFF";
pub const SUB_EVENT_TRANSFORMER_ERROR: &str = "TRANSFORMER_ERROR";
pub const SUB_EVENT_INFO: &str = "INFO";
pub const SUB_EVENT_WARNING: &str = "WARNING";
pub const SUB_EVENT_ERROR: &str = "ERROR";

/// One diagnostic event recorded while matching a request or driving it
/// through the serve pipeline. Standard-typed sub-events are identified by
/// their kind plus data, which makes equal appends idempotent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubEvent {
    pub kind: String,
    pub data: Value,
}

impl SubEvent {
    pub fn new<K: Into<String>>(kind: K, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn info<M: Into<String>>(message: M) -> Self {
        Self::new(SUB_EVENT_INFO, serde_json::json!({ "message": message.into() }))
    }

    pub fn warning<M: Into<String>>(message: M) -> Self {
        Self::new(SUB_EVENT_WARNING, serde_json::json!({ "message": message.into() }))
    }

    pub fn error<M: Into<String>>(message: M) -> Self {
        Self::new(SUB_EVENT_ERROR, serde_json::json!({ "message": message.into() }))
    }

    pub fn json_parse_error<M: Into<String>>(message: M) -> Self {
        Self::new(
            SUB_EVENT_JSON_PARSE_ERROR,
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn xml_parse_error<M: Into<String>>(message: M) -> Self {
        Self::new(
            SUB_EVENT_XML_PARSE_ERROR,
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn regex_error<M: Into<String>>(message: M) -> Self {
        Self::new(
            SUB_EVENT_REGEX_ERROR,
            serde_json::json!({ "message": message.into() }),
        )
    }
}

// ================================================================================================
// Text diffs attached to non-match diagnostics
// ================================================================================================

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub enum Diff {
    Same(String),
    Add(String),
    Rem(String),
}

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone, Copy)]
pub enum Tokenizer {
    Line,
    Word,
    Character,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiffResult {
    pub differences: Vec<Diff>,
    pub ratio: f32,
    pub tokenizer: Tokenizer,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_and_query_are_split() {
        let req = HttpStubRequest::new("GET", "/search?q=metallica&page=2");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query(), Some("q=metallica&page=2"));
        assert_eq!(
            req.query_params_vec(),
            vec![
                ("q".to_string(), "metallica".to_string()),
                ("page".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn port_defaults_follow_scheme() {
        let req = HttpStubRequest::new("GET", "/");
        assert_eq!(req.port(), 80);
        let req = HttpStubRequest::new("GET", "/").with_scheme("https");
        assert_eq!(req.port(), 443);
        let req = HttpStubRequest::new("GET", "/").with_header("Host", "localhost:5000");
        assert_eq!(req.port(), 5000);
    }

    #[test]
    fn form_params_require_form_content_type() {
        let req = HttpStubRequest::new("POST", "/submit").with_body("a=1&b=2");
        assert!(req.form_params_vec().is_empty());

        let req = HttpStubRequest::new("POST", "/submit")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body("a=1&b=%C3%A4");
        assert_eq!(
            req.form_params_vec(),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "ä".to_string())
            ]
        );
    }

    #[cfg(feature = "cookies")]
    #[test]
    fn cookies_are_parsed_from_header() {
        let req = HttpStubRequest::new("GET", "/")
            .with_header("Cookie", "SESSION=abc; theme=dark");
        let cookies = req.cookies().unwrap();
        assert!(cookies.contains(&("SESSION".to_string(), "abc".to_string())));
        assert!(cookies.contains(&("theme".to_string(), "dark".to_string())));
    }

    #[test]
    fn sub_events_compare_structurally() {
        let a = SubEvent::info("hello");
        let b = SubEvent::info("hello");
        let c = SubEvent::warning("hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
