//! The pattern family: a closed sum type over all supported single-value
//! predicates. Every variant produces a graded [`MatchResult`] rather than
//! a plain boolean, and malformed operands or candidates degrade to a
//! no-match with a diagnostic sub-event instead of an error.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, OnceLock, RwLock},
};

use assert_json_diff::{assert_json_matches_no_panic, CompareMode, Config};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    common::{data::SubEvent, util::StubBytes},
    server::matchers::{
        distance::{log_scale_distance, node_fraction, normalized_levenshtein},
        json, result::MatchResult, xml, OperandResolver,
    },
};

/// A regex operand. Holds the pattern source; compilation happens lazily
/// through a process-wide cache keyed by the resolved pattern text, so
/// per-request templated patterns don't recompile on every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegexSpec(String);

impl RegexSpec {
    pub fn new<S: Into<String>>(source: S) -> Self {
        Self(source.into())
    }

    pub fn source(&self) -> &str {
        &self.0
    }
}

impl PartialEq for RegexSpec {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl From<&str> for RegexSpec {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, Arc<Regex>>>> = OnceLock::new();

/// Compiles a regex through the shared cache. Concurrent misses on the same
/// key may compile twice; the duplicate work is wasted but harmless, and
/// both threads end up observing an equivalent compiled form.
pub(crate) fn compiled_regex(source: &str) -> Result<Arc<Regex>, regex::Error> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(hit) = cache
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(source)
    {
        return Ok(hit.clone());
    }

    let compiled = Arc::new(Regex::new(source)?);
    cache
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(source.to_string(), compiled.clone());

    Ok(compiled)
}

fn is_false(value: &bool) -> bool {
    !value
}

/// A single predicate over one string value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ValuePattern {
    /// String equality, optionally case-insensitive.
    EqualTo {
        value: String,
        #[serde(default, skip_serializing_if = "is_false")]
        case_insensitive: bool,
    },
    /// Substring containment.
    Contains(String),
    /// Regex match.
    Matches(RegexSpec),
    /// Negated regex match.
    DoesNotMatch(RegexSpec),
    /// Semantic JSON equality.
    EqualToJson(Value),
    /// Semantic JSON containment: the candidate must include everything the
    /// operand states, extra content is allowed.
    MatchesJson(Value),
    /// Structural XML equality.
    EqualToXml(String),
    /// The value must not be present at all.
    Absent,
    GreaterThan(f64),
    GreaterThanOrEqualTo(f64),
    LessThan(f64),
    LessThanOrEqualTo(f64),
    Between { min: f64, max: f64 },
    And(Vec<ValuePattern>),
    Or(Vec<ValuePattern>),
    Not(Box<ValuePattern>),
}

impl ValuePattern {
    pub fn equal_to<S: Into<String>>(value: S) -> Self {
        ValuePattern::EqualTo {
            value: value.into(),
            case_insensitive: false,
        }
    }

    pub fn equal_to_ignore_case<S: Into<String>>(value: S) -> Self {
        ValuePattern::EqualTo {
            value: value.into(),
            case_insensitive: true,
        }
    }

    pub fn contains<S: Into<String>>(value: S) -> Self {
        ValuePattern::Contains(value.into())
    }

    pub fn matching<S: Into<String>>(source: S) -> Self {
        ValuePattern::Matches(RegexSpec::new(source))
    }

    pub fn not_matching<S: Into<String>>(source: S) -> Self {
        ValuePattern::DoesNotMatch(RegexSpec::new(source))
    }

    pub fn equal_to_json(value: Value) -> Self {
        ValuePattern::EqualToJson(value)
    }

    pub fn matching_json(value: Value) -> Self {
        ValuePattern::MatchesJson(value)
    }

    pub fn equal_to_xml<S: Into<String>>(value: S) -> Self {
        ValuePattern::EqualToXml(value.into())
    }

    /// Applies the pattern to a candidate value. `None` means the value is
    /// not present on the request, which only [`ValuePattern::Absent`]
    /// accepts.
    pub fn matches(&self, candidate: Option<&str>) -> MatchResult {
        self.matches_with(candidate, None)
    }

    /// Applies the pattern to a request or multipart body. Containment
    /// checks operate on the raw bytes so binary bodies stay matchable;
    /// every other pattern kind sees the decoded text.
    pub fn matches_body(
        &self,
        body: &StubBytes,
        resolver: Option<&dyn OperandResolver>,
    ) -> MatchResult {
        if let ValuePattern::Contains(expected) = self {
            let needle = resolve(expected, resolver);
            return if body.contains_str(&needle) {
                MatchResult::exact_match()
            } else {
                MatchResult::partial_match(normalized_levenshtein(
                    &needle,
                    &body.to_maybe_lossy_str(),
                ))
            };
        }

        let text = body.to_maybe_lossy_str();
        let candidate = if body.is_empty() {
            None
        } else {
            Some(text.as_ref())
        };
        self.matches_with(candidate, resolver)
    }

    /// Like [`ValuePattern::matches`], with a render-time resolver applied
    /// to string operands before comparison. Matching is a pure function of
    /// (operand, candidate, resolver output); no shared state is mutated.
    pub fn matches_with(
        &self,
        candidate: Option<&str>,
        resolver: Option<&dyn OperandResolver>,
    ) -> MatchResult {
        match self {
            ValuePattern::Absent => match candidate {
                None => MatchResult::exact_match(),
                Some(_) => MatchResult::no_match(),
            },
            ValuePattern::And(patterns) => MatchResult::aggregate(
                patterns
                    .iter()
                    .map(|p| p.matches_with(candidate, resolver))
                    .collect(),
            ),
            ValuePattern::Or(patterns) => {
                let mut best: Option<MatchResult> = None;
                for pattern in patterns {
                    let result = pattern.matches_with(candidate, resolver);
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
            ValuePattern::Not(inner) => {
                if inner.matches_with(candidate, resolver).is_exact_match() {
                    MatchResult::no_match()
                } else {
                    MatchResult::exact_match()
                }
            }
            _ => match candidate {
                None => MatchResult::no_match(),
                Some(value) => self.matches_present(value, resolver),
            },
        }
    }

    fn matches_present(&self, candidate: &str, resolver: Option<&dyn OperandResolver>) -> MatchResult {
        match self {
            ValuePattern::EqualTo {
                value,
                case_insensitive,
            } => {
                let expected = resolve(value, resolver);
                if *case_insensitive {
                    let expected = expected.to_lowercase();
                    let actual = candidate.to_lowercase();
                    if expected == actual {
                        MatchResult::exact_match()
                    } else {
                        MatchResult::partial_match(normalized_levenshtein(&expected, &actual))
                    }
                } else if expected.as_ref() == candidate {
                    MatchResult::exact_match()
                } else {
                    MatchResult::partial_match(normalized_levenshtein(&expected, candidate))
                }
            }
            ValuePattern::Contains(value) => {
                let expected = resolve(value, resolver);
                if candidate.contains(expected.as_ref()) {
                    MatchResult::exact_match()
                } else {
                    MatchResult::partial_match(normalized_levenshtein(&expected, candidate))
                }
            }
            ValuePattern::Matches(spec) => {
                let source = resolve(spec.source(), resolver);
                match compiled_regex(&source) {
                    Ok(regex) => {
                        if regex.is_match(candidate) {
                            MatchResult::exact_match()
                        } else {
                            MatchResult::partial_match(normalized_levenshtein(&source, candidate))
                        }
                    }
                    Err(err) => regex_failure(&source, err),
                }
            }
            ValuePattern::DoesNotMatch(spec) => {
                match compiled_regex(&resolve(spec.source(), resolver)) {
                    Ok(regex) => {
                        if regex.is_match(candidate) {
                            MatchResult::no_match()
                        } else {
                            MatchResult::exact_match()
                        }
                    }
                    Err(err) => regex_failure(spec.source(), err),
                }
            }
            ValuePattern::EqualToJson(expected) => match serde_json::from_str::<Value>(candidate) {
                Ok(actual) => {
                    let exact = assert_json_matches_no_panic(
                        &actual,
                        expected,
                        Config::new(CompareMode::Strict),
                    )
                    .is_ok();
                    if exact {
                        MatchResult::exact_match()
                    } else {
                        let mismatched = json::mismatched_nodes(expected, &actual);
                        let total = json::node_count(expected).max(json::node_count(&actual));
                        MatchResult::partial_match(node_fraction(mismatched, total))
                    }
                }
                Err(err) => json_failure(err),
            },
            ValuePattern::MatchesJson(expected) => match serde_json::from_str::<Value>(candidate) {
                Ok(actual) => {
                    let exact = assert_json_matches_no_panic(
                        &actual,
                        expected,
                        Config::new(CompareMode::Inclusive),
                    )
                    .is_ok();
                    if exact {
                        MatchResult::exact_match()
                    } else {
                        let missing = json::missing_expected_nodes(expected, &actual);
                        MatchResult::partial_match(node_fraction(
                            missing,
                            json::node_count(expected),
                        ))
                    }
                }
                Err(err) => json_failure(err),
            },
            ValuePattern::EqualToXml(expected) => {
                let expected = resolve(expected, resolver);
                let expected_nodes = match xml::normalize(&expected) {
                    Ok(nodes) => nodes,
                    Err(err) => return xml_failure("pattern operand", &err),
                };
                let actual_nodes = match xml::normalize(candidate) {
                    Ok(nodes) => nodes,
                    Err(err) => return xml_failure("request value", &err),
                };

                let (mismatched, total) = xml::compare(&expected_nodes, &actual_nodes);
                if mismatched == 0 {
                    MatchResult::exact_match()
                } else {
                    MatchResult::partial_match(node_fraction(mismatched, total))
                }
            }
            ValuePattern::GreaterThan(expected) => {
                self.relational(candidate, *expected, |actual, expected| actual > expected)
            }
            ValuePattern::GreaterThanOrEqualTo(expected) => {
                self.relational(candidate, *expected, |actual, expected| actual >= expected)
            }
            ValuePattern::LessThan(expected) => {
                self.relational(candidate, *expected, |actual, expected| actual < expected)
            }
            ValuePattern::LessThanOrEqualTo(expected) => {
                self.relational(candidate, *expected, |actual, expected| actual <= expected)
            }
            ValuePattern::Between { min, max } => match parse_number(candidate) {
                Some(actual) => {
                    if actual >= *min && actual <= *max {
                        MatchResult::exact_match()
                    } else {
                        let to_nearest_bound =
                            log_scale_distance(*min, actual).min(log_scale_distance(*max, actual));
                        MatchResult::partial_match(to_nearest_bound)
                    }
                }
                None => number_failure(candidate),
            },
            // handled in matches_with
            ValuePattern::Absent
            | ValuePattern::And(_)
            | ValuePattern::Or(_)
            | ValuePattern::Not(_) => unreachable!("combinators are dispatched before this point"),
        }
    }

    fn relational(
        &self,
        candidate: &str,
        expected: f64,
        satisfied: fn(f64, f64) -> bool,
    ) -> MatchResult {
        match parse_number(candidate) {
            Some(actual) => {
                if satisfied(actual, expected) {
                    MatchResult::exact_match()
                } else {
                    MatchResult::partial_match(log_scale_distance(expected, actual))
                }
            }
            None => number_failure(candidate),
        }
    }
}

fn resolve<'a>(operand: &'a str, resolver: Option<&dyn OperandResolver>) -> Cow<'a, str> {
    match resolver {
        Some(resolver) => resolver.resolve(operand),
        None => Cow::Borrowed(operand),
    }
}

fn parse_number(candidate: &str) -> Option<f64> {
    candidate.trim().parse::<f64>().ok()
}

fn regex_failure(source: &str, err: regex::Error) -> MatchResult {
    warn!("cannot compile regex pattern {:?}: {}", source, err);
    MatchResult::no_match().with_sub_event(SubEvent::regex_error(err.to_string()))
}

fn json_failure(err: serde_json::Error) -> MatchResult {
    MatchResult::no_match().with_sub_event(SubEvent::json_parse_error(err.to_string()))
}

fn xml_failure(what: &str, err: &str) -> MatchResult {
    MatchResult::no_match()
        .with_sub_event(SubEvent::xml_parse_error(format!("{}: {}", what, err)))
}

fn number_failure(candidate: &str) -> MatchResult {
    MatchResult::no_match().with_sub_event(SubEvent::warning(format!(
        "expected a numeric value but got {:?}",
        candidate
    )))
}
