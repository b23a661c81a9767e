//! The serve pipeline: sequences store lookup, scenario gating and the two
//! response-transformer chains for one inbound request, recording
//! diagnostic sub-events throughout. Each stage consumes the previous
//! event value and returns a new one; nothing mutates an earlier stage's
//! snapshot.

use std::{collections::HashMap, sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    common::data::{
        HttpStubRequest, StubResponse, SubEvent, SUB_EVENT_REQUEST_NOT_MATCHED,
        SUB_EVENT_TRANSFORMER_ERROR,
    },
    server::{
        matchers::{CustomMatcher, CustomMatcherRegistry, OperandResolver},
        scenario::ScenarioEngine,
        store::{StubMapping, StubStore},
    },
};

/// Number of near misses attached to a "request not matched" sub-event.
const NEAR_MISS_COUNT: usize = 3;

/// Raised inside a transformer while rendering a response. This is the only
/// failure class the pipeline recovers from; anything else (panics,
/// invariant violations) indicates a programming defect and propagates.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("template rendering failed: {0}")]
    Rendering(String),
}

/// Legacy (V1) transformer contract: receives the accumulated response and
/// returns a complete replacement. Applied in registration order, either
/// globally or when the response declares the transformer by name.
pub trait ResponseTransformer: Send + Sync {
    fn name(&self) -> &str;

    fn apply_globally(&self) -> bool {
        false
    }

    fn transform(
        &self,
        response: StubResponse,
        request: &HttpStubRequest,
        parameters: &Value,
    ) -> Result<StubResponse, TransformError>;
}

/// V2 transformer contract: receives the whole serve event and may replace
/// any part of it, which lets transformers read and rewrite
/// request-derived template context, not just the response.
pub trait ServeEventTransformer: Send + Sync {
    fn name(&self) -> &str;

    fn apply_globally(&self) -> bool {
        false
    }

    fn transform(&self, event: ServeEvent) -> Result<ServeEvent, TransformError>;
}

/// Read-only observer invoked once the match decision is made.
pub trait AfterMatchListener: Send + Sync {
    fn on_match(&self, event: &ServeEvent);
}

/// A post-serve hook declared on a stub mapping, resolved by name against
/// the registered [`PostServeAction`] implementations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostServeActionDef {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

impl PostServeActionDef {
    pub fn new<S: Into<String>>(name: S, parameters: Value) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }
}

pub trait PostServeAction: Send + Sync {
    fn invoke(&self, event: &ServeEvent, parameters: &Value);
}

/// The extension registries the pipeline consults: custom matchers, both
/// transformer generations, after-match listeners and post-serve actions.
/// Plain name-to-implementation maps, populated at startup.
#[derive(Default)]
pub struct Extensions {
    custom_matchers: CustomMatcherRegistry,
    v1_transformers: Vec<Arc<dyn ResponseTransformer>>,
    v2_transformers: Vec<Arc<dyn ServeEventTransformer>>,
    after_match_listeners: Vec<Arc<dyn AfterMatchListener>>,
    post_serve_actions: HashMap<String, Arc<dyn PostServeAction>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_custom_matcher<S: Into<String>>(
        &mut self,
        name: S,
        matcher: Arc<dyn CustomMatcher>,
    ) {
        self.custom_matchers.register(name, matcher);
    }

    pub fn register_v1_transformer(&mut self, transformer: Arc<dyn ResponseTransformer>) {
        self.v1_transformers.push(transformer);
    }

    pub fn register_v2_transformer(&mut self, transformer: Arc<dyn ServeEventTransformer>) {
        self.v2_transformers.push(transformer);
    }

    pub fn register_after_match_listener(&mut self, listener: Arc<dyn AfterMatchListener>) {
        self.after_match_listeners.push(listener);
    }

    pub fn register_post_serve_action<S: Into<String>>(
        &mut self,
        name: S,
        action: Arc<dyn PostServeAction>,
    ) {
        self.post_serve_actions.insert(name.into(), action);
    }

    pub fn custom_matchers(&self) -> &CustomMatcherRegistry {
        &self.custom_matchers
    }
}

/// Pipeline progress of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServeStage {
    Received,
    Matched,
    ScenarioGated,
    V1Transformed,
    V2Transformed,
    Completed,
}

/// The record of one request's journey through matching, gating and
/// transformation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServeEvent {
    pub id: Uuid,
    pub request: HttpStubRequest,
    /// The matched stub, or the "not configured" sentinel.
    pub stub: StubMapping,
    pub was_matched: bool,
    /// The response specification before transformation.
    pub response_definition: StubResponse,
    /// The response as accumulated through the transformer chains.
    pub response: StubResponse,
    pub stage: ServeStage,
    pub processing_time_ms: Option<u64>,
    sub_events: Vec<SubEvent>,
    #[serde(skip)]
    transform_failed: bool,
}

impl ServeEvent {
    pub fn new(request: HttpStubRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            stub: StubMapping::not_configured(),
            was_matched: false,
            response_definition: StubResponse::new(),
            response: StubResponse::new(),
            stage: ServeStage::Received,
            processing_time_ms: None,
            sub_events: Vec::new(),
            transform_failed: false,
        }
    }

    /// Appends a diagnostic sub-event. Appending an equivalent standard
    /// sub-event (same kind and data) twice is a no-op.
    pub fn append_sub_event(&mut self, event: SubEvent) {
        if self.sub_events.contains(&event) {
            return;
        }
        self.sub_events.push(event);
    }

    pub fn sub_events(&self) -> &[SubEvent] {
        &self.sub_events
    }
}

/// Orchestrates one request through
/// `Received → Matched → ScenarioGated → V1Transformed → V2Transformed →
/// Completed`.
pub struct ServePipeline<'a> {
    pub store: &'a StubStore,
    pub scenarios: &'a ScenarioEngine,
    pub extensions: &'a Extensions,
    pub resolver: Option<&'a dyn OperandResolver>,
}

impl ServePipeline<'_> {
    pub fn serve(&self, request: HttpStubRequest) -> ServeEvent {
        let started = Instant::now();

        let event = ServeEvent::new(request);
        let event = self.matched_stage(event);
        let event = self.scenario_stage(event);

        for listener in &self.extensions.after_match_listeners {
            listener.on_match(&event);
        }

        let event = self.v1_stage(event);
        let event = self.v2_stage(event);
        let event = self.completed_stage(event, started);

        trace!(id = %event.id, matched = event.was_matched, "request served");
        event
    }

    /// Queries the store in match order, keeping only mappings whose
    /// scenario gate currently permits them, and takes the first hit. When
    /// nothing matches, the sentinel stub stays in place and the closest
    /// misses are attached as diagnostics.
    fn matched_stage(&self, mut event: ServeEvent) -> ServeEvent {
        let request = event.request.clone();
        let custom_matchers = Some(self.extensions.custom_matchers());

        let mut sub_events = Vec::new();
        let matched = self
            .store
            .find_all_matching(&request, custom_matchers, self.resolver, |e| {
                sub_events.push(e)
            })
            .find(|stub| self.scenarios.mapping_matches_state(stub, &request));

        for sub_event in sub_events {
            event.append_sub_event(sub_event);
        }

        match matched {
            Some(stub) => {
                debug!(stub = %stub.id, "request matched stub mapping");
                event.response_definition = stub.response.clone();
                event.response = stub.response.clone();
                event.stub = stub;
                event.was_matched = true;
            }
            None => {
                debug!("request did not match any stub mapping");
                let near_misses = self.store.closest_misses(
                    &request,
                    custom_matchers,
                    self.resolver,
                    NEAR_MISS_COUNT,
                );
                event.response_definition = event.stub.response.clone();
                event.response = event.stub.response.clone();
                event.append_sub_event(SubEvent::new(
                    SUB_EVENT_REQUEST_NOT_MATCHED,
                    serde_json::json!({ "nearMisses": near_misses }),
                ));
            }
        }

        event.stage = ServeStage::Matched;
        event
    }

    /// Applies the scenario transition for the served mapping and bumps its
    /// serve counter. This is the only point in the pipeline that mutates
    /// shared state.
    fn scenario_stage(&self, mut event: ServeEvent) -> ServeEvent {
        if event.was_matched {
            self.scenarios.on_stub_served(&event.stub, &event.request);
            self.store.mark_served(event.stub.id);
        }

        event.stage = ServeStage::ScenarioGated;
        event
    }

    fn v1_stage(&self, mut event: ServeEvent) -> ServeEvent {
        if !event.was_matched || event.transform_failed {
            event.stage = ServeStage::V1Transformed;
            return event;
        }

        let mut response = event.response.clone();
        for transformer in &self.extensions.v1_transformers {
            if !applies(transformer.apply_globally(), transformer.name(), &response) {
                continue;
            }

            let parameters = parameters_for(&response, transformer.name());
            match transformer.transform(response.clone(), &event.request, &parameters) {
                Ok(transformed) => response = transformed,
                Err(err) => {
                    return self.transform_failure(event, transformer.name(), err);
                }
            }
        }

        event.response = response;
        event.stage = ServeStage::V1Transformed;
        event
    }

    fn v2_stage(&self, mut event: ServeEvent) -> ServeEvent {
        if !event.was_matched || event.transform_failed {
            event.stage = ServeStage::V2Transformed;
            return event;
        }

        for transformer in &self.extensions.v2_transformers {
            if !applies(
                transformer.apply_globally(),
                transformer.name(),
                &event.response,
            ) {
                continue;
            }

            let name = transformer.name().to_string();
            match transformer.transform(event.clone()) {
                Ok(transformed) => event = transformed,
                Err(err) => {
                    return self.transform_failure(event, &name, err);
                }
            }
        }

        event.stage = ServeStage::V2Transformed;
        event
    }

    fn completed_stage(&self, mut event: ServeEvent, started: Instant) -> ServeEvent {
        event.processing_time_ms = Some(started.elapsed().as_millis() as u64);
        event.stage = ServeStage::Completed;

        if let Some(actions) = &event.stub.post_serve_actions {
            for definition in actions {
                match self.extensions.post_serve_actions.get(&definition.name) {
                    Some(action) => action.invoke(&event, &definition.parameters),
                    None => warn!(
                        action = %definition.name,
                        "post-serve action is not registered"
                    ),
                }
            }
        }

        event
    }

    /// One broken rule must not take the service down: rendering failures
    /// become a visible 5xx response plus a diagnostic sub-event, and the
    /// remaining transformers are skipped.
    fn transform_failure(
        &self,
        mut event: ServeEvent,
        transformer: &str,
        err: TransformError,
    ) -> ServeEvent {
        warn!(transformer, error = %err, "response transformer failed");

        let message = sanitize(&err.to_string());
        event.append_sub_event(SubEvent::new(
            SUB_EVENT_TRANSFORMER_ERROR,
            serde_json::json!({ "transformer": transformer, "message": message.clone() }),
        ));
        event.response = StubResponse::new().with_status(500).with_body(message);
        event.transform_failed = true;
        event
    }
}

fn applies(globally: bool, name: &str, response: &StubResponse) -> bool {
    if globally {
        return true;
    }

    response
        .transformers
        .as_ref()
        .map(|names| names.iter().any(|n| n == name))
        .unwrap_or(false)
}

fn parameters_for(response: &StubResponse, name: &str) -> Value {
    response
        .transformer_parameters
        .as_ref()
        .and_then(|parameters| parameters.get(name))
        .cloned()
        .unwrap_or(Value::Null)
}

fn sanitize(message: &str) -> String {
    message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::matchers::{patterns::ValuePattern, request::RequestPattern};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline_parts() -> (StubStore, ScenarioEngine, Extensions) {
        (StubStore::new(), ScenarioEngine::new(), Extensions::new())
    }

    fn serve(
        store: &StubStore,
        scenarios: &ScenarioEngine,
        extensions: &Extensions,
        request: HttpStubRequest,
    ) -> ServeEvent {
        ServePipeline {
            store,
            scenarios,
            extensions,
            resolver: None,
        }
        .serve(request)
    }

    fn stub_for(path: &str, body: &str) -> StubMapping {
        StubMapping::new()
            .with_request(RequestPattern::new().with_method("GET").with_path(path))
            .with_response(StubResponse::new().with_status(200).with_body(body))
    }

    #[test]
    fn unmatched_requests_get_the_not_configured_response() {
        let (store, scenarios, extensions) = pipeline_parts();
        let event = serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/nothing"),
        );

        assert!(!event.was_matched);
        assert_eq!(event.response.status, Some(404));
        assert_eq!(event.stage, ServeStage::Completed);
        assert!(event
            .sub_events()
            .iter()
            .any(|e| e.kind == SUB_EVENT_REQUEST_NOT_MATCHED));
    }

    #[test]
    fn near_miss_distance_is_attached_and_reproducible() {
        let (store, scenarios, extensions) = pipeline_parts();
        store
            .add(
                StubMapping::new().with_request(
                    RequestPattern::new()
                        .with_path("/digits")
                        .with_body_pattern(ValuePattern::matching(r"^\d+$")),
                ),
            )
            .unwrap();

        let request = HttpStubRequest::new("GET", "/digits").with_body("abc");
        let first = serve(&store, &scenarios, &extensions, request.clone());
        let second = serve(&store, &scenarios, &extensions, request);

        let distance_of = |event: &ServeEvent| {
            event
                .sub_events()
                .iter()
                .find(|e| e.kind == SUB_EVENT_REQUEST_NOT_MATCHED)
                .and_then(|e| e.data["nearMisses"][0]["distance"].as_f64())
                .unwrap()
        };

        let d1 = distance_of(&first);
        let d2 = distance_of(&second);
        assert!(d1 > 0.0);
        assert_eq!(d1, d2);
    }

    #[test]
    fn lowest_priority_value_wins() {
        let (store, scenarios, extensions) = pipeline_parts();
        store
            .add(stub_for("/race", "low priority").with_priority(5))
            .unwrap();
        store
            .add(stub_for("/race", "high priority").with_priority(1))
            .unwrap();

        let event = serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/race"),
        );

        assert!(event.was_matched);
        assert_eq!(event.response.body_string(), "high priority");
    }

    #[test]
    fn scenario_gate_sequences_responses() {
        let (store, scenarios, extensions) = pipeline_parts();
        let opener = stub_for("/step", "first")
            .in_scenario("steps")
            .with_new_scenario_state("B");
        let follower = stub_for("/step", "second")
            .in_scenario("steps")
            .with_required_scenario_state("B")
            .with_priority(1);

        let opener = store.add(opener).unwrap();
        scenarios.on_stub_added(&opener);
        let follower = store.add(follower).unwrap();
        scenarios.on_stub_added(&follower);

        let request = HttpStubRequest::new("GET", "/step");

        // follower outranks opener, but its gate is closed on first call
        let first = serve(&store, &scenarios, &extensions, request.clone());
        assert_eq!(first.response.body_string(), "first");

        let second = serve(&store, &scenarios, &extensions, request);
        assert_eq!(second.response.body_string(), "second");
    }

    #[test]
    fn v1_transformers_apply_in_registration_order() {
        let (store, scenarios, mut extensions) = pipeline_parts();

        struct Appender {
            name: &'static str,
            global: bool,
        }
        impl ResponseTransformer for Appender {
            fn name(&self) -> &str {
                self.name
            }
            fn apply_globally(&self) -> bool {
                self.global
            }
            fn transform(
                &self,
                response: StubResponse,
                _request: &HttpStubRequest,
                _parameters: &Value,
            ) -> Result<StubResponse, TransformError> {
                let body = format!("{}+{}", response.body_string(), self.name);
                Ok(response.with_body(body))
            }
        }

        extensions.register_v1_transformer(Arc::new(Appender {
            name: "one",
            global: true,
        }));
        extensions.register_v1_transformer(Arc::new(Appender {
            name: "two",
            global: false,
        }));
        extensions.register_v1_transformer(Arc::new(Appender {
            name: "three",
            global: false,
        }));

        store
            .add(
                StubMapping::new()
                    .with_request(RequestPattern::new().with_path("/t"))
                    .with_response(
                        StubResponse::new()
                            .with_body("base")
                            .with_transformer("three"),
                    ),
            )
            .unwrap();

        let event = serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/t"),
        );

        // "one" applies globally, "two" was not declared, "three" was
        assert_eq!(event.response.body_string(), "base+one+three");
        // the pre-transformation definition is preserved
        assert_eq!(event.response_definition.body_string(), "base");
    }

    #[test]
    fn v2_transformers_can_rewrite_the_whole_event() {
        let (store, scenarios, mut extensions) = pipeline_parts();

        struct PathEcho;
        impl ServeEventTransformer for PathEcho {
            fn name(&self) -> &str {
                "path-echo"
            }
            fn apply_globally(&self) -> bool {
                true
            }
            fn transform(&self, mut event: ServeEvent) -> Result<ServeEvent, TransformError> {
                let path = event.request.path().to_string();
                event.response = event.response.with_body(path);
                Ok(event)
            }
        }

        extensions.register_v2_transformer(Arc::new(PathEcho));
        store.add(stub_for("/echoed", "ignored")).unwrap();

        let event = serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/echoed"),
        );
        assert_eq!(event.response.body_string(), "/echoed");
    }

    #[test]
    fn rendering_failures_become_a_500_not_a_crash() {
        let (store, scenarios, mut extensions) = pipeline_parts();

        struct Exploding;
        impl ResponseTransformer for Exploding {
            fn name(&self) -> &str {
                "exploding"
            }
            fn apply_globally(&self) -> bool {
                true
            }
            fn transform(
                &self,
                _response: StubResponse,
                _request: &HttpStubRequest,
                _parameters: &Value,
            ) -> Result<StubResponse, TransformError> {
                Err(TransformError::Rendering("missing variable 'user'".into()))
            }
        }

        extensions.register_v1_transformer(Arc::new(Exploding));
        store.add(stub_for("/boom", "fine")).unwrap();

        let event = serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/boom"),
        );

        assert_eq!(event.response.status, Some(500));
        assert!(event.response.body_string().contains("missing variable"));
        assert!(event
            .sub_events()
            .iter()
            .any(|e| e.kind == SUB_EVENT_TRANSFORMER_ERROR));
        assert_eq!(event.stage, ServeStage::Completed);
    }

    #[test]
    fn after_match_listeners_observe_every_request() {
        let (store, scenarios, mut extensions) = pipeline_parts();

        struct Counter(Arc<AtomicUsize>);
        impl AfterMatchListener for Counter {
            fn on_match(&self, _event: &ServeEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        extensions.register_after_match_listener(Arc::new(Counter(count.clone())));
        store.add(stub_for("/seen", "ok")).unwrap();

        serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/seen"),
        );
        serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/unseen"),
        );

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn post_serve_actions_fire_after_completion() {
        let (store, scenarios, mut extensions) = pipeline_parts();

        struct Recorder(Arc<AtomicUsize>);
        impl PostServeAction for Recorder {
            fn invoke(&self, event: &ServeEvent, parameters: &Value) {
                assert_eq!(event.stage, ServeStage::Completed);
                assert_eq!(parameters["tag"], "audit");
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        extensions.register_post_serve_action("record", Arc::new(Recorder(count.clone())));

        store
            .add(
                stub_for("/acted", "ok").with_post_serve_action(PostServeActionDef::new(
                    "record",
                    serde_json::json!({"tag": "audit"}),
                )),
            )
            .unwrap();

        serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/acted"),
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn equivalent_sub_events_append_once() {
        let mut event = ServeEvent::new(HttpStubRequest::new("GET", "/"));
        event.append_sub_event(SubEvent::info("only once"));
        event.append_sub_event(SubEvent::info("only once"));
        event.append_sub_event(SubEvent::info("something else"));
        assert_eq!(event.sub_events().len(), 2);
    }

    #[test]
    fn serve_counter_increments_on_match() {
        let (store, scenarios, extensions) = pipeline_parts();
        let stub = store.add(stub_for("/counted", "ok")).unwrap();

        serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/counted"),
        );
        serve(
            &store,
            &scenarios,
            &extensions,
            HttpStubRequest::new("GET", "/counted"),
        );

        assert_eq!(store.get(stub.id).unwrap().times_served(), 2);
    }
}
