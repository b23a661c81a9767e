use std::{borrow::Cow, collections::HashMap, sync::Arc};

use serde_json::Value;
use similar::{ChangeTag, TextDiff};

use crate::common::data::{Diff, DiffResult, HttpStubRequest, Tokenizer};

pub mod distance;
pub mod json;
pub mod patterns;
pub mod request;
pub mod result;
pub mod xml;

use result::MatchResult;

/// Render-time hook applied to string operands before comparison. The
/// (external) templating layer implements this to substitute per-request
/// values into pattern operands; matching itself stays a pure function of
/// the resolver's output.
pub trait OperandResolver: Send + Sync {
    fn resolve<'a>(&self, operand: &'a str) -> Cow<'a, str>;
}

/// A request-matcher extension registered by name. The engine only
/// aggregates the returned result; it never introspects the parameters.
pub trait CustomMatcher: Send + Sync {
    fn matches(&self, request: &HttpStubRequest, parameters: &Value) -> MatchResult;
}

impl<F> CustomMatcher for F
where
    F: Fn(&HttpStubRequest, &Value) -> MatchResult + Send + Sync,
{
    fn matches(&self, request: &HttpStubRequest, parameters: &Value) -> MatchResult {
        self(request, parameters)
    }
}

/// Plain name-to-implementation registry for custom matchers, populated at
/// startup and looked up during the fine matching pass.
#[derive(Default, Clone)]
pub struct CustomMatcherRegistry {
    matchers: HashMap<String, Arc<dyn CustomMatcher>>,
}

impl CustomMatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<String>>(&mut self, name: S, matcher: Arc<dyn CustomMatcher>) {
        self.matchers.insert(name.into(), matcher);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomMatcher>> {
        self.matchers.get(name)
    }
}

/// Computes a text diff for non-match diagnostics.
pub fn diff_str(base: &str, edit: &str, tokenizer: Tokenizer) -> DiffResult {
    let changes = match tokenizer {
        Tokenizer::Line => TextDiff::from_lines(base, edit),
        Tokenizer::Word => TextDiff::from_words(base, edit),
        Tokenizer::Character => TextDiff::from_chars(base, edit),
    };

    DiffResult {
        tokenizer,
        ratio: changes.ratio(),
        differences: changes
            .iter_all_changes()
            .map(|change| match change.tag() {
                ChangeTag::Equal => Diff::Same(change.to_string_lossy().to_string()),
                ChangeTag::Insert => Diff::Add(change.to_string_lossy().to_string()),
                ChangeTag::Delete => Diff::Rem(change.to_string_lossy().to_string()),
            })
            .collect(),
    }
}
