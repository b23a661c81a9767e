//! The stub store: an always-consistent, priority- and insertion-ordered
//! view of the registered stub mappings, safe under concurrent read/write.
//!
//! Total order is (priority ascending, insertion index descending): between
//! equal-priority stubs the most recently registered wins, which models the
//! "last registered overrides" semantics stub authors expect.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    common::data::{HttpStubRequest, StubResponse, SubEvent},
    server::{
        matchers::{
            request::RequestPattern, result::MatchResult, CustomMatcherRegistry, OperandResolver,
        },
        serve::PostServeActionDef,
    },
};

pub const DEFAULT_PRIORITY: u32 = 5;

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("no stub mapping found with ID {0}")]
    NotFound(Uuid),
    #[error("no stub mapping matches the given request pattern")]
    NoMatchingPattern,
    #[error("a stub mapping with ID {0} is already registered")]
    DuplicateId(Uuid),
}

/// A registered rule: a request pattern, a response specification, a
/// priority, an optional scenario binding and lifecycle metadata. Mappings
/// are replaced, never merged: an edit produces a new value that keeps the
/// identifier and insertion index of the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubMapping {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    /// Lower values take precedence.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub request: RequestPattern,
    #[serde(default)]
    pub response: StubResponse,
    #[serde(default)]
    pub scenario_name: Option<String>,
    #[serde(default)]
    pub required_scenario_state: Option<String>,
    #[serde(default)]
    pub new_scenario_state: Option<String>,
    /// Whether the (external) persistence layer should keep this mapping.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub post_serve_actions: Option<Vec<PostServeActionDef>>,
    /// Set when the mapping changed since it was last persisted.
    #[serde(skip)]
    dirty: bool,
    /// Assigned by the store, used only as an ordering tiebreak.
    #[serde(skip)]
    insertion_index: u64,
    #[serde(skip)]
    times_served: u64,
}

impl StubMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sentinel mapping served when no registered stub matches a request.
    pub fn not_configured() -> Self {
        let mut mapping = Self::new();
        mapping.id = Uuid::nil();
        mapping.name = Some("not configured".to_string());
        mapping.response = StubResponse::new()
            .with_status(404)
            .with_body("No response could be served as no stub mapping was matched.");
        mapping
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_request(mut self, request: RequestPattern) -> Self {
        self.request = request;
        self
    }

    pub fn with_response(mut self, response: StubResponse) -> Self {
        self.response = response;
        self
    }

    pub fn in_scenario<S: Into<String>>(mut self, name: S) -> Self {
        self.scenario_name = Some(name.into());
        self
    }

    pub fn with_required_scenario_state<S: Into<String>>(mut self, state: S) -> Self {
        self.required_scenario_state = Some(state.into());
        self
    }

    pub fn with_new_scenario_state<S: Into<String>>(mut self, state: S) -> Self {
        self.new_scenario_state = Some(state.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_post_serve_action(mut self, action: PostServeActionDef) -> Self {
        self.post_serve_actions
            .get_or_insert_with(Vec::new)
            .push(action);
        self
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn insertion_index(&self) -> u64 {
        self.insertion_index
    }

    pub fn times_served(&self) -> u64 {
        self.times_served
    }

    fn store_key(&self) -> StoreKey {
        StoreKey {
            priority: self.priority,
            insertion: Reverse(self.insertion_index),
        }
    }
}

impl Default for StubMapping {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            priority: DEFAULT_PRIORITY,
            request: RequestPattern::default(),
            response: StubResponse::default(),
            scenario_name: None,
            required_scenario_state: None,
            new_scenario_state: None,
            persistent: false,
            metadata: None,
            post_serve_actions: None,
            dirty: false,
            insertion_index: 0,
            times_served: 0,
        }
    }
}

// Store-assigned bookkeeping (insertion index, dirty flag, serve counter)
// is excluded: a round-tripped mapping equals its original.
impl PartialEq for StubMapping {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.priority == other.priority
            && self.request == other.request
            && self.response == other.response
            && self.scenario_name == other.scenario_name
            && self.required_scenario_state == other.required_scenario_state
            && self.new_scenario_state == other.new_scenario_state
            && self.persistent == other.persistent
            && self.metadata == other.metadata
            && self.post_serve_actions == other.post_serve_actions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct StoreKey {
    priority: u32,
    insertion: Reverse<u64>,
}

#[derive(Default)]
struct StoreInner {
    by_order: BTreeMap<StoreKey, StubMapping>,
    by_id: HashMap<Uuid, StoreKey>,
    next_insertion_index: u64,
}

/// A stub ranked by how close it came to matching, used to explain why no
/// stub matched a request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearMiss {
    pub stub_id: Uuid,
    pub stub_name: Option<String>,
    pub distance: f64,
}

/// The ordered collection of stub mappings. All mutations are linearizable
/// behind a single reader-writer lock; match queries operate on a snapshot
/// taken under the read lock, so a concurrent request never observes a
/// half-added or half-removed mapping.
#[derive(Default)]
pub struct StubStore {
    inner: RwLock<StoreInner>,
}

impl StubStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mapping, atomically assigning the next insertion index.
    pub fn add(&self, mut mapping: StubMapping) -> Result<StubMapping, Error> {
        let mut inner = self.write();

        if inner.by_id.contains_key(&mapping.id) {
            return Err(Error::DuplicateId(mapping.id));
        }

        mapping.insertion_index = inner.next_insertion_index;
        inner.next_insertion_index += 1;

        debug!(id = %mapping.id, priority = mapping.priority, "adding stub mapping");

        let key = mapping.store_key();
        inner.by_id.insert(mapping.id, key);
        inner.by_order.insert(key, mapping.clone());

        Ok(mapping)
    }

    pub fn get(&self, id: Uuid) -> Option<StubMapping> {
        let inner = self.read();
        let key = inner.by_id.get(&id)?;
        inner.by_order.get(key).cloned()
    }

    /// All mappings in match order: priority ascending, then most recently
    /// inserted first.
    pub fn get_all(&self) -> Vec<StubMapping> {
        self.read().by_order.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().by_order.is_empty()
    }

    /// Removes a mapping by its identifier if the store knows it, falling
    /// back to structural equality of the request pattern. The fallback
    /// supports removal by content when the caller never learned the
    /// identifier.
    pub fn remove(&self, mapping: &StubMapping) -> Result<StubMapping, Error> {
        let mut inner = self.write();

        if let Some(key) = inner.by_id.remove(&mapping.id) {
            let removed = inner
                .by_order
                .remove(&key)
                .unwrap_or_else(|| unreachable!("identifier index out of sync with order index"));
            debug!(id = %removed.id, "removed stub mapping");
            return Ok(removed);
        }

        let key = inner
            .by_order
            .iter()
            .find(|(_, candidate)| candidate.request == mapping.request)
            .map(|(key, _)| *key);

        match key {
            Some(key) => {
                let removed = inner
                    .by_order
                    .remove(&key)
                    .unwrap_or_else(|| unreachable!("identifier index out of sync with order index"));
                inner.by_id.remove(&removed.id);
                debug!(id = %removed.id, "removed stub mapping by request pattern");
                Ok(removed)
            }
            None => Err(Error::NoMatchingPattern),
        }
    }

    pub fn remove_by_id(&self, id: Uuid) -> Result<StubMapping, Error> {
        let mut inner = self.write();

        let key = inner.by_id.remove(&id).ok_or(Error::NotFound(id))?;
        let removed = inner
            .by_order
            .remove(&key)
            .unwrap_or_else(|| unreachable!("identifier index out of sync with order index"));

        debug!(id = %removed.id, "removed stub mapping");
        Ok(removed)
    }

    /// Replaces a mapping with an edited version. The identifier and the
    /// insertion index of the original are preserved, so an edited mapping
    /// keeps its position among equal-priority peers; the replacement is
    /// marked dirty for downstream persistence consumers.
    pub fn replace(&self, old: &StubMapping, mut new: StubMapping) -> Result<StubMapping, Error> {
        let mut inner = self.write();

        let old_key = *inner.by_id.get(&old.id).ok_or(Error::NotFound(old.id))?;
        let existing = inner
            .by_order
            .remove(&old_key)
            .unwrap_or_else(|| unreachable!("identifier index out of sync with order index"));

        new.id = existing.id;
        new.insertion_index = existing.insertion_index;
        new.times_served = existing.times_served;
        new.dirty = true;

        debug!(id = %new.id, "replacing stub mapping");

        let key = new.store_key();
        inner.by_id.insert(new.id, key);
        inner.by_order.insert(key, new.clone());

        Ok(new)
    }

    /// Increments the serve counter of a mapping.
    pub fn mark_served(&self, id: Uuid) -> Option<u64> {
        let mut inner = self.write();

        let key = *inner.by_id.get(&id)?;
        let mapping = inner.by_order.get_mut(&key)?;
        mapping.times_served += 1;
        Some(mapping.times_served)
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.by_order.clear();
        inner.by_id.clear();
        debug!("removed all stub mappings");
    }

    /// Lazily evaluates the stored mappings against a request, in match
    /// order. The iterator yields exactly-matching mappings; diagnostic
    /// sub-events collected from non-matching candidates (parse errors,
    /// malformed operands) are forwarded to `on_sub_event`. The underlying
    /// snapshot is taken once, under the read lock.
    pub fn find_all_matching<'a>(
        &self,
        request: &'a HttpStubRequest,
        custom_matchers: Option<&'a CustomMatcherRegistry>,
        resolver: Option<&'a (dyn OperandResolver + 'a)>,
        on_sub_event: impl FnMut(SubEvent) + 'a,
    ) -> MatchingStubs<'a> {
        MatchingStubs {
            stubs: self.get_all().into_iter(),
            request,
            custom_matchers,
            resolver,
            on_sub_event: Box::new(on_sub_event),
        }
    }

    /// The non-matching stubs that came closest to matching the request,
    /// ordered by ascending distance. Ties keep store order, so rankings
    /// are reproducible.
    pub fn closest_misses(
        &self,
        request: &HttpStubRequest,
        custom_matchers: Option<&CustomMatcherRegistry>,
        resolver: Option<&dyn OperandResolver>,
        limit: usize,
    ) -> Vec<NearMiss> {
        let mut misses: Vec<(StubMapping, MatchResult)> = self
            .get_all()
            .into_iter()
            .map(|stub| {
                let result = stub.request.matches_with(request, custom_matchers, resolver);
                (stub, result)
            })
            .filter(|(_, result)| !result.is_exact_match())
            .collect();

        misses.sort_by(|(_, a), (_, b)| a.distance().total_cmp(&b.distance()));

        misses
            .into_iter()
            .take(limit)
            .map(|(stub, result)| NearMiss {
                stub_id: stub.id,
                stub_name: stub.name,
                distance: result.distance(),
            })
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lazy, best-first sequence of mappings matching one request. See
/// [`StubStore::find_all_matching`].
pub struct MatchingStubs<'a> {
    stubs: std::vec::IntoIter<StubMapping>,
    request: &'a HttpStubRequest,
    custom_matchers: Option<&'a CustomMatcherRegistry>,
    resolver: Option<&'a (dyn OperandResolver + 'a)>,
    on_sub_event: Box<dyn FnMut(SubEvent) + 'a>,
}

impl Iterator for MatchingStubs<'_> {
    type Item = StubMapping;

    fn next(&mut self) -> Option<Self::Item> {
        for stub in self.stubs.by_ref() {
            let result = stub
                .request
                .matches_with(self.request, self.custom_matchers, self.resolver);

            if result.is_exact_match() {
                return Some(stub);
            }

            for event in result.take_sub_events() {
                (self.on_sub_event)(event);
            }
        }

        None
    }
}
