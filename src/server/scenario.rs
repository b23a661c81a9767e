//! Scenario engine: named state machines that gate which stub mappings are
//! eligible and advance as stubs are served. Two implementations compose
//! via delegation: a static engine keyed purely by scenario name, and a
//! dynamic engine keyed by a name prefix plus a value extracted from the
//! request body, so concurrently running sessions can each drive their own
//! instance of the same scenario definition.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, RwLock},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{common::data::HttpStubRequest, server::store::StubMapping};

/// Every scenario begins in this state, and reset returns it there.
pub const STARTED: &str = "Started";

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("scenario {scenario} cannot be set to state {state:?}; legal states are {legal:?}")]
    UndeclaredState {
        scenario: String,
        state: String,
        legal: Vec<String>,
    },
}

/// Snapshot of one scenario (or one dynamic scenario instance).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    pub state: String,
    /// Derived from the member mappings: the union of every required and
    /// new state declared in this scenario, plus the started state.
    pub possible_states: Vec<String>,
}

/// Per-scenario state plus the member declarations the legal-state set is
/// derived from. Gate checks and transitions for one scenario are
/// serialized through the mutex wrapping this entry.
struct ScenarioEntry {
    state: String,
    members: HashMap<Uuid, (Option<String>, Option<String>)>,
}

impl ScenarioEntry {
    fn new() -> Self {
        Self {
            state: STARTED.to_string(),
            members: HashMap::new(),
        }
    }

    fn legal_states(&self) -> Vec<String> {
        let mut states = BTreeSet::new();
        states.insert(STARTED.to_string());
        for (required, new) in self.members.values() {
            if let Some(required) = required {
                states.insert(required.clone());
            }
            if let Some(new) = new {
                states.insert(new.clone());
            }
        }
        states.into_iter().collect()
    }

    fn satisfies(&self, required: Option<&str>) -> bool {
        match required {
            Some(required) => required == self.state,
            None => true,
        }
    }

    /// The only place scenario state ever changes: a served mapping that
    /// declares a new state transitions the scenario iff its required
    /// state is unset or equal to the current state.
    fn apply_transition(&mut self, mapping: &StubMapping) {
        if let Some(new_state) = &mapping.new_scenario_state {
            if self.satisfies(mapping.required_scenario_state.as_deref()) {
                debug!(
                    scenario = mapping.scenario_name.as_deref().unwrap_or(""),
                    from = %self.state,
                    to = %new_state,
                    "scenario transition"
                );
                self.state = new_state.clone();
            }
        }
    }
}

/// The callbacks a scenario implementation reacts to. The engine tries its
/// handlers in order; the first one that reports it handles a mapping wins.
pub trait ScenarioHandler: Send + Sync {
    fn handles(&self, mapping: &StubMapping) -> bool;
    fn on_stub_added(&self, mapping: &StubMapping);
    fn on_stub_updated(&self, old: &StubMapping, new: &StubMapping);
    fn on_stub_removed(&self, mapping: &StubMapping);
    fn on_stub_served(&self, mapping: &StubMapping, request: &HttpStubRequest);
    fn mapping_matches_state(&self, mapping: &StubMapping, request: &HttpStubRequest) -> bool;
    fn reset_all(&self);
    fn reset(&self, name: &str) -> Result<(), Error>;
    fn set_state(&self, name: &str, state: &str) -> Result<(), Error>;
    fn get_state(&self, name: &str) -> Result<String, Error>;
    fn all(&self) -> Vec<Scenario>;
}

// ================================================================================================
// Static scenarios, keyed purely by name
// ================================================================================================

#[derive(Default)]
pub struct StaticScenarios {
    scenarios: RwLock<HashMap<String, Arc<Mutex<ScenarioEntry>>>>,
}

impl StaticScenarios {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Option<Arc<Mutex<ScenarioEntry>>> {
        self.scenarios
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn lock_entry(entry: &Arc<Mutex<ScenarioEntry>>) -> std::sync::MutexGuard<'_, ScenarioEntry> {
        entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ScenarioHandler for StaticScenarios {
    fn handles(&self, mapping: &StubMapping) -> bool {
        mapping.scenario_name.is_some()
    }

    fn on_stub_added(&self, mapping: &StubMapping) {
        let name = match &mapping.scenario_name {
            Some(name) => name,
            None => return,
        };

        let mut scenarios = self
            .scenarios
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = scenarios
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ScenarioEntry::new())));

        Self::lock_entry(entry).members.insert(
            mapping.id,
            (
                mapping.required_scenario_state.clone(),
                mapping.new_scenario_state.clone(),
            ),
        );
    }

    fn on_stub_updated(&self, old: &StubMapping, new: &StubMapping) {
        if old.scenario_name == new.scenario_name {
            // same scenario: refresh the declaration without losing state
            if let Some(name) = &new.scenario_name {
                if let Some(entry) = self.entry(name) {
                    let mut entry = Self::lock_entry(&entry);
                    entry.members.remove(&old.id);
                    entry.members.insert(
                        new.id,
                        (
                            new.required_scenario_state.clone(),
                            new.new_scenario_state.clone(),
                        ),
                    );
                }
            }
            return;
        }

        self.on_stub_removed(old);
        self.on_stub_added(new);
    }

    fn on_stub_removed(&self, mapping: &StubMapping) {
        let name = match &mapping.scenario_name {
            Some(name) => name,
            None => return,
        };

        let mut scenarios = self
            .scenarios
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now_empty = match scenarios.get(name) {
            Some(entry) => {
                let mut entry = Self::lock_entry(entry);
                entry.members.remove(&mapping.id);
                entry.members.is_empty()
            }
            None => false,
        };

        // a scenario dies with its last member mapping
        if now_empty {
            scenarios.remove(name);
            debug!(scenario = %name, "scenario removed with its last mapping");
        }
    }

    fn on_stub_served(&self, mapping: &StubMapping, _request: &HttpStubRequest) {
        if let Some(name) = &mapping.scenario_name {
            if let Some(entry) = self.entry(name) {
                Self::lock_entry(&entry).apply_transition(mapping);
            }
        }
    }

    fn mapping_matches_state(&self, mapping: &StubMapping, _request: &HttpStubRequest) -> bool {
        let required = match &mapping.required_scenario_state {
            Some(required) => required,
            None => return true,
        };
        let name = match &mapping.scenario_name {
            Some(name) => name,
            None => return true,
        };

        match self.entry(name) {
            Some(entry) => Self::lock_entry(&entry).satisfies(Some(required)),
            // unregistered scenario behaves as freshly started
            None => required == STARTED,
        }
    }

    fn reset_all(&self) {
        let scenarios = self
            .scenarios
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in scenarios.values() {
            Self::lock_entry(entry).state = STARTED.to_string();
        }
    }

    fn reset(&self, name: &str) -> Result<(), Error> {
        match self.entry(name) {
            Some(entry) => {
                Self::lock_entry(&entry).state = STARTED.to_string();
                Ok(())
            }
            None => Err(Error::UnknownScenario(name.to_string())),
        }
    }

    fn set_state(&self, name: &str, state: &str) -> Result<(), Error> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownScenario(name.to_string()))?;
        let mut entry = Self::lock_entry(&entry);

        let legal = entry.legal_states();
        if !legal.iter().any(|s| s == state) {
            return Err(Error::UndeclaredState {
                scenario: name.to_string(),
                state: state.to_string(),
                legal,
            });
        }

        entry.state = state.to_string();
        Ok(())
    }

    fn get_state(&self, name: &str) -> Result<String, Error> {
        match self.entry(name) {
            Some(entry) => Ok(Self::lock_entry(&entry).state.clone()),
            None => Err(Error::UnknownScenario(name.to_string())),
        }
    }

    fn all(&self) -> Vec<Scenario> {
        let scenarios = self
            .scenarios
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut result: Vec<Scenario> = scenarios
            .iter()
            .map(|(name, entry)| {
                let entry = Self::lock_entry(entry);
                Scenario {
                    name: name.clone(),
                    state: entry.state.clone(),
                    possible_states: entry.legal_states(),
                }
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }
}

// ================================================================================================
// Dynamic scenarios, keyed by name prefix plus request-derived key
// ================================================================================================

/// Extracts the per-instance key from a request body, e.g. a session ID.
/// Capture group 1 of the regex is used when present, the whole match
/// otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioKeyExtractor {
    #[serde(with = "serde_regex")]
    pattern: Regex,
}

impl ScenarioKeyExtractor {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }

    pub fn from_source(source: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(source)?,
        })
    }

    fn extract(&self, request: &HttpStubRequest) -> Option<String> {
        let body = request.body().to_maybe_lossy_str();
        let captures = self.pattern.captures(&body)?;
        captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str().to_string())
    }
}

impl PartialEq for ScenarioKeyExtractor {
    fn eq(&self, other: &Self) -> bool {
        self.pattern.as_str() == other.pattern.as_str()
    }
}

struct DynamicScenarioDef {
    extractor: Option<ScenarioKeyExtractor>,
    members: HashMap<Uuid, (Option<String>, Option<String>)>,
}

#[derive(Default)]
pub struct DynamicScenarios {
    definitions: RwLock<HashMap<String, DynamicScenarioDef>>,
    instances: RwLock<HashMap<String, Arc<Mutex<ScenarioEntry>>>>,
}

impl DynamicScenarios {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a scenario name prefix as dynamic. Mappings whose scenario
    /// name starts with the prefix are handled here; without an extractor
    /// the engine falls back to "first instance whose current state
    /// satisfies the requirement" semantics.
    pub fn register_prefix<S: Into<String>>(
        &self,
        prefix: S,
        extractor: Option<ScenarioKeyExtractor>,
    ) {
        self.definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                prefix.into(),
                DynamicScenarioDef {
                    extractor,
                    members: HashMap::new(),
                },
            );
    }

    fn prefix_for(&self, scenario_name: &str) -> Option<String> {
        self.definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .filter(|prefix| scenario_name.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())
            .cloned()
    }

    fn instance_name(prefix: &str, key: &str) -> String {
        format!("{}[{}]", prefix, key)
    }

    fn instance(&self, name: &str) -> Option<Arc<Mutex<ScenarioEntry>>> {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn instance_or_create(&self, name: &str) -> Arc<Mutex<ScenarioEntry>> {
        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        instances
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ScenarioEntry::new())))
            .clone()
    }

    fn extractor_key(&self, prefix: &str, request: &HttpStubRequest) -> Option<String> {
        let definitions = self
            .definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        definitions
            .get(prefix)
            .and_then(|def| def.extractor.as_ref())
            .and_then(|extractor| extractor.extract(request))
    }

    /// The first existing instance under the prefix whose current state
    /// satisfies the requirement, in name order for reproducibility.
    fn first_satisfying(&self, prefix: &str, required: Option<&str>) -> Option<String> {
        let instances = self
            .instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut names: Vec<&String> = instances
            .keys()
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();

        for name in names {
            if let Some(entry) = instances.get(name) {
                let entry = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if entry.satisfies(required) {
                    return Some(name.clone());
                }
            }
        }

        None
    }

    fn legal_states_for(&self, prefix: &str) -> Vec<String> {
        let definitions = self
            .definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut states = BTreeSet::new();
        states.insert(STARTED.to_string());
        if let Some(def) = definitions.get(prefix) {
            for (required, new) in def.members.values() {
                if let Some(required) = required {
                    states.insert(required.clone());
                }
                if let Some(new) = new {
                    states.insert(new.clone());
                }
            }
        }
        states.into_iter().collect()
    }

    /// Resolves the instance a request addresses: the extracted key when an
    /// extractor is configured, the first satisfying instance otherwise.
    /// Instances are grouped by the mapping's full scenario name; the
    /// registered prefix only selects the handler and its extractor.
    /// `create` controls whether an absent instance is materialized.
    fn resolve_instance(
        &self,
        prefix: &str,
        mapping: &StubMapping,
        request: &HttpStubRequest,
        create: bool,
    ) -> Option<Arc<Mutex<ScenarioEntry>>> {
        let scenario_name = mapping.scenario_name.as_deref().unwrap_or(prefix);
        let required = mapping.required_scenario_state.as_deref();

        if let Some(key) = self.extractor_key(prefix, request) {
            let name = Self::instance_name(scenario_name, &key);
            return match self.instance(&name) {
                Some(entry) => Some(entry),
                None if create => Some(self.instance_or_create(&name)),
                None => None,
            };
        }

        match self.first_satisfying(scenario_name, required) {
            Some(name) => self.instance(&name),
            None if create => Some(self.instance_or_create(scenario_name)),
            None => None,
        }
    }
}

impl ScenarioHandler for DynamicScenarios {
    fn handles(&self, mapping: &StubMapping) -> bool {
        mapping
            .scenario_name
            .as_deref()
            .and_then(|name| self.prefix_for(name))
            .is_some()
    }

    fn on_stub_added(&self, mapping: &StubMapping) {
        let prefix = match mapping
            .scenario_name
            .as_deref()
            .and_then(|name| self.prefix_for(name))
        {
            Some(prefix) => prefix,
            None => return,
        };

        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(def) = definitions.get_mut(&prefix) {
            def.members.insert(
                mapping.id,
                (
                    mapping.required_scenario_state.clone(),
                    mapping.new_scenario_state.clone(),
                ),
            );
        }
    }

    fn on_stub_updated(&self, old: &StubMapping, new: &StubMapping) {
        self.on_stub_removed(old);
        self.on_stub_added(new);
    }

    fn on_stub_removed(&self, mapping: &StubMapping) {
        let prefix = match mapping
            .scenario_name
            .as_deref()
            .and_then(|name| self.prefix_for(name))
        {
            Some(prefix) => prefix,
            None => return,
        };

        let now_empty = {
            let mut definitions = self
                .definitions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match definitions.get_mut(&prefix) {
                Some(def) => {
                    def.members.remove(&mapping.id);
                    def.members.is_empty()
                }
                None => false,
            }
        };

        // the definition survives, but instances die with the last mapping
        if now_empty {
            self.instances
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .retain(|name, _| !name.starts_with(&prefix));
        }
    }

    fn on_stub_served(&self, mapping: &StubMapping, request: &HttpStubRequest) {
        let prefix = match mapping
            .scenario_name
            .as_deref()
            .and_then(|name| self.prefix_for(name))
        {
            Some(prefix) => prefix,
            None => return,
        };

        if let Some(entry) = self.resolve_instance(&prefix, mapping, request, true) {
            entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .apply_transition(mapping);
        }
    }

    fn mapping_matches_state(&self, mapping: &StubMapping, request: &HttpStubRequest) -> bool {
        let required = match &mapping.required_scenario_state {
            Some(required) => required,
            None => return true,
        };
        let prefix = match mapping
            .scenario_name
            .as_deref()
            .and_then(|name| self.prefix_for(name))
        {
            Some(prefix) => prefix,
            None => return true,
        };

        match self.resolve_instance(&prefix, mapping, request, false) {
            Some(entry) => entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .satisfies(Some(required)),
            // no instance yet: only the started state is satisfiable
            None => required == STARTED,
        }
    }

    fn reset_all(&self) {
        self.instances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn reset(&self, name: &str) -> Result<(), Error> {
        match self.instance(name) {
            Some(entry) => {
                entry
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .state = STARTED.to_string();
                Ok(())
            }
            None => Err(Error::UnknownScenario(name.to_string())),
        }
    }

    fn set_state(&self, name: &str, state: &str) -> Result<(), Error> {
        let entry = self
            .instance(name)
            .ok_or_else(|| Error::UnknownScenario(name.to_string()))?;

        let legal = match self.prefix_for(name) {
            Some(prefix) => self.legal_states_for(&prefix),
            None => vec![STARTED.to_string()],
        };

        if !legal.iter().any(|s| s == state) {
            return Err(Error::UndeclaredState {
                scenario: name.to_string(),
                state: state.to_string(),
                legal,
            });
        }

        entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state = state.to_string();
        Ok(())
    }

    fn get_state(&self, name: &str) -> Result<String, Error> {
        match self.instance(name) {
            Some(entry) => Ok(entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .state
                .clone()),
            None => Err(Error::UnknownScenario(name.to_string())),
        }
    }

    fn all(&self) -> Vec<Scenario> {
        let instances = self
            .instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut result: Vec<Scenario> = instances
            .iter()
            .map(|(name, entry)| {
                let entry = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let possible_states = self
                    .prefix_for(name)
                    .map(|prefix| self.legal_states_for(&prefix))
                    .unwrap_or_else(|| vec![STARTED.to_string()]);
                Scenario {
                    name: name.clone(),
                    state: entry.state.clone(),
                    possible_states,
                }
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }
}

// ================================================================================================
// Delegating engine
// ================================================================================================

/// Composes the dynamic and static implementations. Handlers are tried in
/// order and the first capable one wins, so a mapping bound to a registered
/// dynamic prefix never reaches the static engine.
pub struct ScenarioEngine {
    dynamic: Arc<DynamicScenarios>,
    handlers: Vec<Arc<dyn ScenarioHandler>>,
}

impl ScenarioEngine {
    pub fn new() -> Self {
        let dynamic = Arc::new(DynamicScenarios::new());
        let statics = Arc::new(StaticScenarios::new());
        Self {
            dynamic: dynamic.clone(),
            handlers: vec![dynamic, statics],
        }
    }

    /// Access to the dynamic engine for prefix registration.
    pub fn dynamic(&self) -> &DynamicScenarios {
        &self.dynamic
    }

    fn handler_index(&self, mapping: &StubMapping) -> Option<usize> {
        self.handlers.iter().position(|h| h.handles(mapping))
    }

    pub fn on_stub_added(&self, mapping: &StubMapping) {
        if let Some(i) = self.handler_index(mapping) {
            self.handlers[i].on_stub_added(mapping);
        }
    }

    pub fn on_stub_updated(&self, old: &StubMapping, new: &StubMapping) {
        match (self.handler_index(old), self.handler_index(new)) {
            (Some(a), Some(b)) if a == b => self.handlers[a].on_stub_updated(old, new),
            (old_handler, new_handler) => {
                if let Some(i) = old_handler {
                    self.handlers[i].on_stub_removed(old);
                }
                if let Some(i) = new_handler {
                    self.handlers[i].on_stub_added(new);
                }
            }
        }
    }

    pub fn on_stub_removed(&self, mapping: &StubMapping) {
        if let Some(i) = self.handler_index(mapping) {
            self.handlers[i].on_stub_removed(mapping);
        }
    }

    pub fn on_stub_served(&self, mapping: &StubMapping, request: &HttpStubRequest) {
        if let Some(i) = self.handler_index(mapping) {
            self.handlers[i].on_stub_served(mapping, request);
        }
    }

    /// Whether the scenario gate currently permits the mapping. Mappings
    /// without a scenario binding always pass.
    pub fn mapping_matches_state(&self, mapping: &StubMapping, request: &HttpStubRequest) -> bool {
        match self.handler_index(mapping) {
            Some(i) => self.handlers[i].mapping_matches_state(mapping, request),
            None => true,
        }
    }

    pub fn reset_all(&self) {
        for handler in &self.handlers {
            handler.reset_all();
        }
    }

    pub fn reset(&self, name: &str) -> Result<(), Error> {
        self.first_known(name, |handler| handler.reset(name))
    }

    pub fn set_state(&self, name: &str, state: &str) -> Result<(), Error> {
        self.first_known(name, |handler| handler.set_state(name, state))
    }

    pub fn get_state(&self, name: &str) -> Result<String, Error> {
        self.first_known(name, |handler| handler.get_state(name))
    }

    pub fn all(&self) -> Vec<Scenario> {
        let mut result: Vec<Scenario> =
            self.handlers.iter().flat_map(|h| h.all()).collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    fn first_known<T>(
        &self,
        name: &str,
        operation: impl Fn(&Arc<dyn ScenarioHandler>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        for handler in &self.handlers {
            match operation(handler) {
                Err(Error::UnknownScenario(_)) => continue,
                other => return other,
            }
        }
        Err(Error::UnknownScenario(name.to_string()))
    }
}

impl Default for ScenarioEngine {
    fn default() -> Self {
        Self::new()
    }
}
