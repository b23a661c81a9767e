//! Ties the stub store, the scenario engine and the extension registries
//! together behind one entry point, and keeps the bounded journal of serve
//! events that near-miss diagnostics read from.

use std::{collections::VecDeque, sync::RwLock};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    common::data::HttpStubRequest,
    server::{
        matchers::OperandResolver,
        scenario::{self, Scenario, ScenarioEngine},
        serve::{Extensions, ServeEvent, ServePipeline},
        store::{self, NearMiss, StubMapping, StubStore},
    },
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: request HTTP method GET or HEAD cannot have a body")]
    BodyMethodInvalid,
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error(transparent)]
    Scenario(#[from] scenario::Error),
}

/// Top-level state of the stubbing engine. Cross-request shared state is
/// limited to the store, the scenario engine and the journal; each request
/// is served without any other shared mutable state, so concurrent workers
/// only contend on those.
pub struct StubServerState {
    store: StubStore,
    scenarios: ScenarioEngine,
    extensions: Extensions,
    journal: RwLock<VecDeque<ServeEvent>>,
    journal_limit: usize,
}

impl StubServerState {
    pub fn new(journal_limit: usize) -> Self {
        Self {
            store: StubStore::new(),
            scenarios: ScenarioEngine::new(),
            extensions: Extensions::new(),
            journal: RwLock::new(VecDeque::new()),
            journal_limit,
        }
    }

    pub fn store(&self) -> &StubStore {
        &self.store
    }

    pub fn scenarios(&self) -> &ScenarioEngine {
        &self.scenarios
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable access for startup-time extension registration.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Validates and registers a stub mapping, wiring its scenario binding.
    pub fn register_stub(&self, mapping: StubMapping) -> Result<StubMapping, Error> {
        validate_stub(&mapping)?;

        let stored = self.store.add(mapping)?;
        self.scenarios.on_stub_added(&stored);
        Ok(stored)
    }

    /// Replaces a mapping with an edited version (see
    /// [`StubStore::replace`]), keeping the scenario engine in sync.
    pub fn replace_stub(
        &self,
        old: &StubMapping,
        new: StubMapping,
    ) -> Result<StubMapping, Error> {
        validate_stub(&new)?;

        let stored = self.store.replace(old, new)?;
        self.scenarios.on_stub_updated(old, &stored);
        Ok(stored)
    }

    pub fn remove_stub(&self, mapping: &StubMapping) -> Result<StubMapping, Error> {
        let removed = self.store.remove(mapping)?;
        self.scenarios.on_stub_removed(&removed);
        Ok(removed)
    }

    pub fn remove_stub_by_id(&self, id: Uuid) -> Result<StubMapping, Error> {
        let removed = self.store.remove_by_id(id)?;
        self.scenarios.on_stub_removed(&removed);
        Ok(removed)
    }

    /// Full reset: removes every mapping (letting the scenarios they were
    /// members of die with them) and clears the journal.
    pub fn reset(&self) {
        let all = self.store.get_all();
        self.store.clear();
        for mapping in &all {
            self.scenarios.on_stub_removed(mapping);
        }
        self.scenarios.reset_all();
        self.clear_journal();

        debug!("reset all stubs, scenarios and the request journal");
    }

    pub fn set_scenario_state(&self, name: &str, state: &str) -> Result<(), Error> {
        Ok(self.scenarios.set_state(name, state)?)
    }

    pub fn scenario_state(&self, name: &str) -> Result<String, Error> {
        Ok(self.scenarios.get_state(name)?)
    }

    pub fn reset_scenario(&self, name: &str) -> Result<(), Error> {
        Ok(self.scenarios.reset(name)?)
    }

    pub fn reset_all_scenarios(&self) {
        self.scenarios.reset_all();
    }

    pub fn all_scenarios(&self) -> Vec<Scenario> {
        self.scenarios.all()
    }

    /// Serves one request through the pipeline and journals the resulting
    /// event.
    pub fn serve(&self, request: HttpStubRequest) -> ServeEvent {
        self.serve_with_resolver(request, None)
    }

    pub fn serve_with_resolver(
        &self,
        request: HttpStubRequest,
        resolver: Option<&dyn OperandResolver>,
    ) -> ServeEvent {
        let pipeline = ServePipeline {
            store: &self.store,
            scenarios: &self.scenarios,
            extensions: &self.extensions,
            resolver,
        };

        let event = pipeline.serve(request);
        self.journal_event(event.clone());
        event
    }

    /// The non-matching stubs closest to the given request, for
    /// user-facing "why did nothing match" diagnostics.
    pub fn closest_misses(&self, request: &HttpStubRequest, limit: usize) -> Vec<NearMiss> {
        self.store
            .closest_misses(request, Some(self.extensions.custom_matchers()), None, limit)
    }

    /// All journaled serve events, oldest first.
    pub fn serve_events(&self) -> Vec<ServeEvent> {
        self.journal
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_journal(&self) {
        self.journal
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn journal_event(&self, event: ServeEvent) {
        let mut journal = self
            .journal
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while journal.len() >= self.journal_limit.max(1) {
            journal.pop_front();
        }
        journal.push_back(event);
    }
}

impl Default for StubServerState {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

/// Contains HTTP methods which cannot have a body.
const NON_BODY_METHODS: &[&str] = &["GET", "HEAD"];

fn validate_stub(mapping: &StubMapping) -> Result<(), Error> {
    if let Some(patterns) = &mapping.request.body_patterns {
        if !patterns.is_empty() {
            if let Some(method) = &mapping.request.method {
                if NON_BODY_METHODS.contains(&method.as_str()) {
                    return Err(Error::BodyMethodInvalid);
                }
            }
        }
    }

    if mapping.scenario_name.is_none()
        && (mapping.required_scenario_state.is_some() || mapping.new_scenario_state.is_some())
    {
        return Err(Error::ValidationError(
            "a required or new scenario state needs a scenario name".to_string(),
        ));
    }

    Ok(())
}
