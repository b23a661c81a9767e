//! The composite matcher over a whole HTTP request. Evaluation happens in
//! two passes: a cheap coarse pass over scheme, host, port, client IP, URL
//! and method that short-circuits on failure, and a fine pass over headers,
//! parameters, cookies, body, multipart parts and custom matchers that only
//! runs when the coarse pass matched exactly. Stub sets are scanned per
//! request, so the fine matchers must never run for structurally wrong
//! requests.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock, RwLock},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use path_tree::PathTree;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::{
    common::data::{HttpStubRequest, MultipartPart, SubEvent, Tokenizer},
    server::matchers::{
        diff_str,
        distance::normalized_levenshtein,
        patterns::{compiled_regex, RegexSpec, ValuePattern},
        result::{MatchResult, Weighted},
        CustomMatcher, CustomMatcherRegistry, OperandResolver,
    },
};

// Component weights for the aggregate distance. Tunables: the URL and
// method dominate near-miss ranking, custom matchers count least.
const URL_WEIGHT: f64 = 10.0;
const METHOD_WEIGHT: f64 = 3.0;
const DEFAULT_WEIGHT: f64 = 1.0;
const CUSTOM_MATCHER_WEIGHT: f64 = 1.0;

/// How a request URL is matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub enum UrlPattern {
    /// Any URL is accepted.
    #[default]
    Any,
    /// Full URL (path and query) equality.
    Exact(String),
    /// Regex over path and query.
    Regex(RegexSpec),
    /// Path-only equality, the query string is ignored.
    Path(String),
    /// Regex over the path only.
    PathRegex(RegexSpec),
    /// Path template with named segments, e.g. `/users/{id}/orders`.
    PathTemplate(String),
}

static TEMPLATE_CACHE: OnceLock<RwLock<HashMap<String, Arc<PathTree<()>>>>> = OnceLock::new();

fn template_tree(template: &str) -> Arc<PathTree<()>> {
    let cache = TEMPLATE_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(hit) = cache
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(template)
    {
        return hit.clone();
    }

    // `{name}` segments become the `:name` syntax the router tree expects
    let converted: String = template
        .split('/')
        .map(|segment| {
            if segment.len() > 1 && segment.starts_with('{') && segment.ends_with('}') {
                format!(":{}", &segment[1..segment.len() - 1])
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/");

    let mut tree = PathTree::new();
    let _ = tree.insert(&converted, ());
    let tree = Arc::new(tree);

    cache
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(template.to_string(), tree.clone());

    tree
}

impl UrlPattern {
    pub fn matches(&self, request: &HttpStubRequest) -> MatchResult {
        match self {
            UrlPattern::Any => MatchResult::exact_match(),
            UrlPattern::Exact(expected) => string_equality(expected, request.uri_str()),
            UrlPattern::Regex(spec) => regex_equality(spec, request.uri_str()),
            UrlPattern::Path(expected) => string_equality(expected, request.path()),
            UrlPattern::PathRegex(spec) => regex_equality(spec, request.path()),
            UrlPattern::PathTemplate(template) => {
                if template_tree(template).find(request.path()).is_some() {
                    MatchResult::exact_match()
                } else {
                    MatchResult::partial_match(normalized_levenshtein(template, request.path()))
                }
            }
        }
    }

    /// Named path segments extracted from the request path. `Some` only for
    /// a matching path template.
    pub fn path_parameters(&self, path: &str) -> Option<Vec<(String, String)>> {
        match self {
            UrlPattern::PathTemplate(template) => {
                let tree = template_tree(template);
                let found = tree.find(path)?;
                Some(
                    found
                        .1
                        .params()
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                )
            }
            _ => None,
        }
    }
}

fn string_equality(expected: &str, actual: &str) -> MatchResult {
    if expected == actual {
        MatchResult::exact_match()
    } else {
        MatchResult::partial_match(normalized_levenshtein(expected, actual))
    }
}

fn regex_equality(spec: &RegexSpec, actual: &str) -> MatchResult {
    match compiled_regex(spec.source()) {
        Ok(regex) => {
            if regex.is_match(actual) {
                MatchResult::exact_match()
            } else {
                MatchResult::partial_match(normalized_levenshtein(spec.source(), actual))
            }
        }
        Err(err) => {
            MatchResult::no_match().with_sub_event(SubEvent::regex_error(err.to_string()))
        }
    }
}

/// Credentials matched as an implicit `Authorization` header expectation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasicAuthCredentials {
    pub username: String,
    pub password: String,
}

impl BasicAuthCredentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn as_header_pattern(&self) -> (String, ValuePattern) {
        let token = BASE64.encode(format!("{}:{}", self.username, self.password));
        (
            "authorization".to_string(),
            ValuePattern::equal_to(format!("Basic {}", token)),
        )
    }
}

/// Whether every part or any part has to satisfy a multipart pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MultipartMatchingType {
    All,
    #[default]
    Any,
}

/// Expectations against one (or all) multipart body parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MultipartPattern {
    pub name: Option<String>,
    pub matching_type: MultipartMatchingType,
    pub headers: Option<Vec<(String, ValuePattern)>>,
    pub body_patterns: Option<Vec<ValuePattern>>,
}

impl MultipartPattern {
    fn match_part(&self, part: &MultipartPart, resolver: Option<&dyn OperandResolver>) -> MatchResult {
        let mut results = Vec::new();

        if let Some(name) = &self.name {
            results.push(string_equality(name, &part.name));
        }

        if let Some(headers) = &self.headers {
            for (name, pattern) in headers {
                results.push(pattern.matches_with(part.header_value(name), resolver));
            }
        }

        if let Some(patterns) = &self.body_patterns {
            for pattern in patterns {
                results.push(pattern.matches_body(&part.body, resolver));
            }
        }

        MatchResult::aggregate(results)
    }

    fn matches(
        &self,
        parts: Option<&Vec<MultipartPart>>,
        resolver: Option<&dyn OperandResolver>,
    ) -> MatchResult {
        let parts = match parts {
            Some(parts) if !parts.is_empty() => parts,
            _ => return MatchResult::no_match(),
        };

        match self.matching_type {
            MultipartMatchingType::Any => best_result(
                parts
                    .iter()
                    .map(|part| self.match_part(part, resolver))
                    .collect(),
            ),
            MultipartMatchingType::All => MatchResult::aggregate(
                parts
                    .iter()
                    .map(|part| self.match_part(part, resolver))
                    .collect(),
            ),
        }
    }
}

/// Reference to a custom matcher registered by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomMatcherSpec {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

impl CustomMatcherSpec {
    pub fn new<S: Into<String>>(name: S, parameters: Value) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }
}

/// An unregistered, directly attached custom matcher. Not serialized;
/// compares by identity, since closures have no structural form.
#[derive(Clone)]
pub struct InlineMatcher(pub Arc<dyn CustomMatcher>);

impl fmt::Debug for InlineMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InlineMatcher(..)")
    }
}

impl PartialEq for InlineMatcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// The full set of expectations a stub mapping places on a request.
/// Structural equality over all serializable fields: the stub store
/// deduplicates and removes by this equality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestPattern {
    pub scheme: Option<String>,
    pub host: Option<ValuePattern>,
    pub port: Option<u16>,
    pub client_ip: Option<ValuePattern>,
    pub url: UrlPattern,
    pub method: Option<String>,
    pub headers: Option<Vec<(String, ValuePattern)>>,
    pub query_params: Option<Vec<(String, ValuePattern)>>,
    pub form_params: Option<Vec<(String, ValuePattern)>>,
    pub path_params: Option<Vec<(String, ValuePattern)>>,
    pub cookies: Option<Vec<(String, ValuePattern)>>,
    pub basic_auth: Option<BasicAuthCredentials>,
    pub body_patterns: Option<Vec<ValuePattern>>,
    pub multipart: Option<Vec<MultipartPattern>>,
    pub custom_matcher: Option<CustomMatcherSpec>,
    #[serde(skip)]
    pub inline_custom_matcher: Option<InlineMatcher>,
}

impl RequestPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method<S: Into<String>>(mut self, method: S) -> Self {
        self.method = Some(method.into().to_uppercase());
        self
    }

    pub fn with_url(mut self, url: UrlPattern) -> Self {
        self.url = url;
        self
    }

    pub fn with_path<S: Into<String>>(self, path: S) -> Self {
        self.with_url(UrlPattern::Path(path.into()))
    }

    pub fn with_header<S: Into<String>>(mut self, name: S, pattern: ValuePattern) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push((name.into(), pattern));
        self
    }

    pub fn with_query_param<S: Into<String>>(mut self, name: S, pattern: ValuePattern) -> Self {
        self.query_params
            .get_or_insert_with(Vec::new)
            .push((name.into(), pattern));
        self
    }

    pub fn with_form_param<S: Into<String>>(mut self, name: S, pattern: ValuePattern) -> Self {
        self.form_params
            .get_or_insert_with(Vec::new)
            .push((name.into(), pattern));
        self
    }

    pub fn with_path_param<S: Into<String>>(mut self, name: S, pattern: ValuePattern) -> Self {
        self.path_params
            .get_or_insert_with(Vec::new)
            .push((name.into(), pattern));
        self
    }

    pub fn with_cookie<S: Into<String>>(mut self, name: S, pattern: ValuePattern) -> Self {
        self.cookies
            .get_or_insert_with(Vec::new)
            .push((name.into(), pattern));
        self
    }

    pub fn with_basic_auth(mut self, credentials: BasicAuthCredentials) -> Self {
        self.basic_auth = Some(credentials);
        self
    }

    pub fn with_body_pattern(mut self, pattern: ValuePattern) -> Self {
        self.body_patterns.get_or_insert_with(Vec::new).push(pattern);
        self
    }

    pub fn with_multipart_pattern(mut self, pattern: MultipartPattern) -> Self {
        self.multipart.get_or_insert_with(Vec::new).push(pattern);
        self
    }

    pub fn with_custom_matcher(mut self, spec: CustomMatcherSpec) -> Self {
        self.custom_matcher = Some(spec);
        self
    }

    pub fn with_inline_matcher(mut self, matcher: Arc<dyn CustomMatcher>) -> Self {
        self.inline_custom_matcher = Some(InlineMatcher(matcher));
        self
    }

    pub fn matches(&self, request: &HttpStubRequest) -> MatchResult {
        self.matches_with(request, None, None)
    }

    /// Evaluates the pattern against a request. The result is computed once
    /// and returned as a single value carrying exactness, distance and
    /// diagnostic sub-events, so callers can inspect all three without
    /// re-running the expensive sub-matchers.
    pub fn matches_with(
        &self,
        request: &HttpStubRequest,
        custom_matchers: Option<&CustomMatcherRegistry>,
        resolver: Option<&dyn OperandResolver>,
    ) -> MatchResult {
        let coarse = self.coarse_result(request, resolver);
        if !coarse.is_exact_match() {
            trace!("coarse pass failed, skipping fine matchers");
            return coarse;
        }

        self.fine_result(request, custom_matchers, resolver)
    }

    fn coarse_result(
        &self,
        request: &HttpStubRequest,
        resolver: Option<&dyn OperandResolver>,
    ) -> MatchResult {
        let scheme = match &self.scheme {
            Some(expected) => {
                if expected.eq_ignore_ascii_case(request.scheme()) {
                    MatchResult::exact_match()
                } else {
                    MatchResult::no_match()
                }
            }
            None => MatchResult::exact_match(),
        };

        let host = match &self.host {
            Some(pattern) => pattern.matches_with(request.host().as_deref(), resolver),
            None => MatchResult::exact_match(),
        };

        let port = match self.port {
            Some(expected) => {
                if expected == request.port() {
                    MatchResult::exact_match()
                } else {
                    MatchResult::no_match()
                }
            }
            None => MatchResult::exact_match(),
        };

        let client_ip = match &self.client_ip {
            Some(pattern) => pattern.matches_with(request.client_ip(), resolver),
            None => MatchResult::exact_match(),
        };

        let method = match &self.method {
            Some(expected) => {
                if expected.eq_ignore_ascii_case(request.method_str()) {
                    MatchResult::exact_match()
                } else {
                    MatchResult::no_match()
                }
            }
            None => MatchResult::exact_match(),
        };

        MatchResult::aggregate_weighted(vec![
            Weighted::new(scheme, DEFAULT_WEIGHT),
            Weighted::new(host, DEFAULT_WEIGHT),
            Weighted::new(port, DEFAULT_WEIGHT),
            Weighted::new(client_ip, DEFAULT_WEIGHT),
            Weighted::new(self.url.matches(request), URL_WEIGHT),
            Weighted::new(method, METHOD_WEIGHT),
        ])
    }

    fn fine_result(
        &self,
        request: &HttpStubRequest,
        custom_matchers: Option<&CustomMatcherRegistry>,
        resolver: Option<&dyn OperandResolver>,
    ) -> MatchResult {
        let mut parts: Vec<Weighted> = Vec::new();

        // headers, with basic auth folded in as an implicit expectation
        let mut header_expectations: Vec<(String, ValuePattern)> =
            self.headers.clone().unwrap_or_default();
        if let Some(credentials) = &self.basic_auth {
            header_expectations.push(credentials.as_header_pattern());
        }
        for (name, pattern) in &header_expectations {
            let result = best_candidate(pattern, request.header_values(name), resolver);
            parts.push(Weighted::new(result, DEFAULT_WEIGHT));
        }

        if let Some(expectations) = &self.query_params {
            let actual = request.query_params_vec();
            for (name, pattern) in expectations {
                let result = best_candidate(pattern, values_for(&actual, name), resolver);
                parts.push(Weighted::new(result, DEFAULT_WEIGHT));
            }
        }

        if let Some(expectations) = &self.form_params {
            let actual = request.form_params_vec();
            for (name, pattern) in expectations {
                let result = best_candidate(pattern, values_for(&actual, name), resolver);
                parts.push(Weighted::new(result, DEFAULT_WEIGHT));
            }
        }

        #[cfg(feature = "cookies")]
        if let Some(expectations) = &self.cookies {
            let actual = request.cookies().unwrap_or_default();
            for (name, pattern) in expectations {
                let result = best_candidate(pattern, values_for(&actual, name), resolver);
                parts.push(Weighted::new(result, DEFAULT_WEIGHT));
            }
        }

        if let Some(expectations) = &self.path_params {
            let actual = self
                .url
                .path_parameters(request.path())
                .unwrap_or_default();
            for (name, pattern) in expectations {
                let value = actual
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.as_str());
                parts.push(Weighted::new(
                    pattern.matches_with(value, resolver),
                    DEFAULT_WEIGHT,
                ));
            }
        }

        if let Some(patterns) = &self.body_patterns {
            let body = request.body().to_maybe_lossy_str();
            let candidate = if request.body().is_empty() {
                None
            } else {
                Some(body.as_ref())
            };
            for pattern in patterns {
                let mut result = pattern.matches_body(request.body(), resolver);
                if !result.is_exact_match() {
                    if let Some(event) = body_diff_sub_event(pattern, candidate) {
                        result = result.with_sub_event(event);
                    }
                }
                parts.push(Weighted::new(result, DEFAULT_WEIGHT));
            }
        }

        if let Some(patterns) = &self.multipart {
            for pattern in patterns {
                parts.push(Weighted::new(
                    pattern.matches(request.multipart(), resolver),
                    DEFAULT_WEIGHT,
                ));
            }
        }

        if let Some(spec) = &self.custom_matcher {
            let result = match custom_matchers.and_then(|registry| registry.get(&spec.name)) {
                Some(matcher) => matcher.matches(request, &spec.parameters),
                None => MatchResult::no_match().with_sub_event(SubEvent::warning(format!(
                    "custom matcher {:?} is not registered",
                    spec.name
                ))),
            };
            parts.push(Weighted::new(result, CUSTOM_MATCHER_WEIGHT));
        }

        if let Some(matcher) = &self.inline_custom_matcher {
            parts.push(Weighted::new(
                matcher.0.matches(request, &Value::Null),
                CUSTOM_MATCHER_WEIGHT,
            ));
        }

        MatchResult::aggregate_weighted(parts)
    }
}

fn values_for<'a>(pairs: &'a [(String, String)], name: &str) -> Vec<&'a str> {
    pairs
        .iter()
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .collect()
}

fn best_candidate(
    pattern: &ValuePattern,
    candidates: Vec<&str>,
    resolver: Option<&dyn OperandResolver>,
) -> MatchResult {
    if candidates.is_empty() {
        return pattern.matches_with(None, resolver);
    }

    best_result(
        candidates
            .into_iter()
            .map(|candidate| pattern.matches_with(Some(candidate), resolver))
            .collect(),
    )
}

fn best_result(results: Vec<MatchResult>) -> MatchResult {
    let mut best: Option<MatchResult> = None;
    for result in results {
        if result.is_exact_match() {
            return result;
        }
        let better = match &best {
            Some(current) => result.distance() < current.distance(),
            None => true,
        };
        if better {
            best = Some(result);
        }
    }
    best.unwrap_or_else(MatchResult::no_match)
}

fn body_diff_sub_event(pattern: &ValuePattern, candidate: Option<&str>) -> Option<SubEvent> {
    let actual = candidate?;
    let expected = match pattern {
        ValuePattern::EqualTo { value, .. } => value.clone(),
        ValuePattern::EqualToJson(value) => {
            serde_json::to_string_pretty(value).unwrap_or_default()
        }
        ValuePattern::EqualToXml(value) => value.clone(),
        _ => return None,
    };

    let diff = diff_str(&expected, actual, Tokenizer::Line);
    serde_json::to_value(diff)
        .ok()
        .map(|data| SubEvent::new(crate::common::data::SUB_EVENT_TEXT_DIFF, data))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::data::HttpStubRequest;
    use serde_json::json;

    fn get(path: &str) -> HttpStubRequest {
        HttpStubRequest::new("GET", path)
    }

    #[test]
    fn minimal_pattern_matches_everything() {
        let pattern = RequestPattern::new();
        assert!(pattern.matches(&get("/any/url?x=1")).is_exact_match());
    }

    #[test]
    fn method_and_url_must_both_match() {
        let pattern = RequestPattern::new().with_method("POST").with_path("/things");
        assert!(pattern
            .matches(&HttpStubRequest::new("POST", "/things"))
            .is_exact_match());
        assert!(!pattern.matches(&get("/things")).is_exact_match());
        assert!(!pattern
            .matches(&HttpStubRequest::new("POST", "/other"))
            .is_exact_match());
    }

    #[test]
    fn url_misses_outweigh_method_misses() {
        let pattern = RequestPattern::new().with_method("POST").with_path("/things");

        let wrong_method = pattern.matches(&HttpStubRequest::new("GET", "/things"));
        let wrong_url = pattern.matches(&HttpStubRequest::new("POST", "/completely/elsewhere"));

        assert!(!wrong_method.is_exact_match());
        assert!(!wrong_url.is_exact_match());
        assert!(wrong_url.distance() > wrong_method.distance());
    }

    #[test]
    fn coarse_failure_never_reaches_fine_matchers() {
        let panicking = Arc::new(
            |_req: &HttpStubRequest, _params: &Value| -> MatchResult {
                panic!("fine matcher must not run on a coarse mismatch")
            },
        );

        let pattern = RequestPattern::new()
            .with_method("GET")
            .with_path("/present")
            .with_inline_matcher(panicking);

        // wrong method: coarse pass fails, the panicking matcher stays silent
        let result = pattern.matches(&HttpStubRequest::new("POST", "/present"));
        assert!(!result.is_exact_match());
    }

    #[test]
    fn fine_matchers_run_on_coarse_success() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        let recording = Arc::new(move |_req: &HttpStubRequest, _params: &Value| {
            called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            MatchResult::exact_match()
        });

        let pattern = RequestPattern::new()
            .with_path("/present")
            .with_inline_matcher(recording);

        assert!(pattern.matches(&get("/present")).is_exact_match());
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn headers_match_case_insensitively_by_name() {
        let pattern = RequestPattern::new()
            .with_header("Content-Type", ValuePattern::contains("json"));
        let request = get("/").with_header("content-type", "application/json");
        assert!(pattern.matches(&request).is_exact_match());
    }

    #[test]
    fn absent_header_expectation() {
        let pattern = RequestPattern::new().with_header("X-Debug", ValuePattern::Absent);
        assert!(pattern.matches(&get("/")).is_exact_match());
        assert!(!pattern
            .matches(&get("/").with_header("X-Debug", "1"))
            .is_exact_match());
    }

    #[test]
    fn basic_auth_is_an_implicit_authorization_header() {
        let pattern = RequestPattern::new()
            .with_basic_auth(BasicAuthCredentials::new("user", "secret"));

        // base64("user:secret")
        let request = get("/").with_header("Authorization", "Basic dXNlcjpzZWNyZXQ=");
        assert!(pattern.matches(&request).is_exact_match());
        assert!(!pattern.matches(&get("/")).is_exact_match());
    }

    #[test]
    fn query_params_support_multiple_values() {
        let pattern =
            RequestPattern::new().with_query_param("tag", ValuePattern::equal_to("rust"));
        let request = get("/search?tag=go&tag=rust");
        assert!(pattern.matches(&request).is_exact_match());
    }

    #[test]
    fn form_params_are_matched_from_the_body() {
        let pattern =
            RequestPattern::new().with_form_param("name", ValuePattern::equal_to("alice"));
        let request = HttpStubRequest::new("POST", "/submit")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body("name=alice&age=42");
        assert!(pattern.matches(&request).is_exact_match());
    }

    #[cfg(feature = "cookies")]
    #[test]
    fn cookies_are_matched_by_name() {
        let pattern =
            RequestPattern::new().with_cookie("SESSION", ValuePattern::matching("^[a-f0-9]+$"));
        let request = get("/").with_header("Cookie", "SESSION=deadbeef; theme=dark");
        assert!(pattern.matches(&request).is_exact_match());
    }

    #[test]
    fn path_template_extracts_path_params() {
        let pattern = RequestPattern::new()
            .with_url(UrlPattern::PathTemplate("/users/{id}/orders".to_string()))
            .with_path_param("id", ValuePattern::matching(r"^\d+$"));

        assert!(pattern.matches(&get("/users/42/orders")).is_exact_match());
        assert!(!pattern.matches(&get("/users/abc/orders")).is_exact_match());
        assert!(!pattern.matches(&get("/users/42")).is_exact_match());
    }

    #[test]
    fn body_pattern_misses_carry_a_text_diff() {
        let pattern = RequestPattern::new()
            .with_body_pattern(ValuePattern::equal_to("expected body"));
        let result = pattern.matches(&get("/").with_body("actual body"));

        assert!(!result.is_exact_match());
        assert!(result
            .sub_events()
            .iter()
            .any(|e| e.kind == crate::common::data::SUB_EVENT_TEXT_DIFF));
    }

    #[test]
    fn multipart_any_and_all_semantics() {
        let request = HttpStubRequest::new("POST", "/upload").with_multipart(vec![
            MultipartPart::new("meta", "{}"),
            MultipartPart::new("payload", "123456"),
        ]);

        let any = RequestPattern::new().with_multipart_pattern(MultipartPattern {
            name: Some("payload".to_string()),
            ..Default::default()
        });
        assert!(any.matches(&request).is_exact_match());

        let all = RequestPattern::new().with_multipart_pattern(MultipartPattern {
            matching_type: MultipartMatchingType::All,
            body_patterns: Some(vec![ValuePattern::matching(r"^\d+$")]),
            ..Default::default()
        });
        // the "meta" part body is not numeric
        assert!(!all.matches(&request).is_exact_match());
    }

    #[test]
    fn unregistered_named_matcher_is_a_no_match() {
        let pattern = RequestPattern::new()
            .with_custom_matcher(CustomMatcherSpec::new("missing", json!({})));
        assert!(!pattern.matches(&get("/")).is_exact_match());
    }

    #[test]
    fn named_matcher_is_resolved_from_the_registry() {
        let mut registry = CustomMatcherRegistry::new();
        registry.register(
            "has-session",
            Arc::new(|request: &HttpStubRequest, _params: &Value| {
                if request.header_value("x-session").is_some() {
                    MatchResult::exact_match()
                } else {
                    MatchResult::no_match()
                }
            }),
        );

        let pattern = RequestPattern::new()
            .with_custom_matcher(CustomMatcherSpec::new("has-session", json!({})));

        let with_session = get("/").with_header("X-Session", "abc");
        assert!(pattern
            .matches_with(&with_session, Some(&registry), None)
            .is_exact_match());
        assert!(!pattern
            .matches_with(&get("/"), Some(&registry), None)
            .is_exact_match());
    }

    #[test]
    fn structural_equality_and_serde_round_trip() {
        let pattern = RequestPattern::new()
            .with_method("POST")
            .with_url(UrlPattern::PathTemplate("/users/{id}".to_string()))
            .with_header("Accept", ValuePattern::contains("json"))
            .with_body_pattern(ValuePattern::equal_to_json(json!({"a": 1})))
            .with_basic_auth(BasicAuthCredentials::new("u", "p"));

        let clone = pattern.clone();
        assert_eq!(pattern, clone);

        let serialized = serde_json::to_string(&pattern).unwrap();
        let deserialized: RequestPattern = serde_json::from_str(&serialized).unwrap();
        assert_eq!(pattern, deserialized);
    }
}
