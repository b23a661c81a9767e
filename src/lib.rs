//! `stubmock` is a programmable HTTP stubbing engine. Callers register
//! declarative request/response rules ("stub mappings"), and every inbound
//! request is matched against the active rule set to synthesize a
//! response, optionally gated by a per-session state machine ("scenario")
//! and post-processed by a transformer chain.
//!
//! The crate deliberately stops at the in-process contracts: a transport
//! layer hands it a normalized [`HttpStubRequest`] and receives a
//! [`StubResponse`] back; persistence and admin surfaces exchange
//! already-deserialized [`StubMapping`] entities. No wire bytes are parsed
//! here and no files are read.
//!
//! # Getting started
//!
//! ```rust
//! use stubmock::prelude::*;
//!
//! let state = StubServerState::default();
//!
//! state.register_stub(
//!     StubMapping::new()
//!         .with_request(
//!             RequestPattern::new()
//!                 .with_method("GET")
//!                 .with_path("/search")
//!                 .with_query_param("q", ValuePattern::equal_to("metallica")),
//!         )
//!         .with_response(StubResponse::new().with_status(204)),
//! ).unwrap();
//!
//! let event = state.serve(HttpStubRequest::new("GET", "/search?q=metallica"));
//! assert_eq!(event.response.status, Some(204));
//! ```
//!
//! # Matching
//!
//! Matching is graded, not boolean: every pattern produces a
//! [`MatchResult`] carrying an exactness verdict plus a normalized distance
//! in `[0, 1]`, and composite results aggregate with per-component weights.
//! Requests that match nothing receive a "not configured" response, and the
//! closest non-matching stubs are attached to the serve event's
//! diagnostics so callers can explain *why* nothing matched.
//!
//! # Scenarios
//!
//! Stub mappings can join a named scenario and declare the state they
//! require and the state they move the scenario to when served. A dynamic
//! variant keys scenario instances by a value extracted from the request
//! body, giving concurrently running sessions independent state machines.
//!
//! # Logging
//!
//! `stubmock` emits events through the `tracing` crate (with its `log`
//! compatibility feature enabled), so both `tracing` subscribers and
//! `log`-based backends such as `env_logger` pick them up.

pub mod common;
pub mod server;

pub use common::{
    data::{HttpStubRequest, MultipartPart, StubResponse, SubEvent},
    util::StubBytes,
};
pub use server::{
    matchers::{
        patterns::{RegexSpec, ValuePattern},
        request::{
            BasicAuthCredentials, CustomMatcherSpec, MultipartMatchingType, MultipartPattern,
            RequestPattern, UrlPattern,
        },
        result::{MatchResult, Weighted},
        CustomMatcher, CustomMatcherRegistry, OperandResolver,
    },
    scenario::{
        DynamicScenarios, Scenario, ScenarioEngine, ScenarioHandler, ScenarioKeyExtractor,
        StaticScenarios, STARTED,
    },
    serve::{
        AfterMatchListener, Extensions, PostServeAction, PostServeActionDef, ResponseTransformer,
        ServeEvent, ServeEventTransformer, ServePipeline, ServeStage, TransformError,
    },
    state::StubServerState,
    store::{NearMiss, StubMapping, StubStore, DEFAULT_PRIORITY},
};

pub mod prelude {
    pub use crate::{
        HttpStubRequest, MatchResult, RequestPattern, StubMapping, StubResponse, StubServerState,
        UrlPattern, ValuePattern,
    };
}
