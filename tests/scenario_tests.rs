use stubmock::prelude::*;
use stubmock::{ScenarioKeyExtractor, STARTED};

fn scenario_stub(path: &str, body: &str, scenario: &str) -> StubMapping {
    StubMapping::new()
        .with_request(RequestPattern::new().with_method("GET").with_path(path))
        .with_response(StubResponse::new().with_status(200).with_body(body))
        .in_scenario(scenario)
}

#[test]
fn scenario_sequences_two_stubs_on_the_same_url() {
    let state = StubServerState::default();

    state
        .register_stub(
            scenario_stub("/todo", "empty list", "todo").with_new_scenario_state("HasItems"),
        )
        .unwrap();
    state
        .register_stub(
            scenario_stub("/todo", "one item", "todo")
                .with_required_scenario_state("HasItems")
                .with_priority(1),
        )
        .unwrap();

    let first = state.serve(HttpStubRequest::new("GET", "/todo"));
    assert_eq!(first.response.body_string(), "empty list");

    let second = state.serve(HttpStubRequest::new("GET", "/todo"));
    assert_eq!(second.response.body_string(), "one item");
}

#[test]
fn serving_an_ungated_stub_never_moves_a_non_matching_scenario() {
    let state = StubServerState::default();

    state
        .register_stub(
            scenario_stub("/fire", "ok", "strict")
                .with_required_scenario_state("Armed")
                .with_new_scenario_state("Fired"),
        )
        .unwrap();

    // gate is closed, so the request falls through to "not configured"
    let event = state.serve(HttpStubRequest::new("GET", "/fire"));
    assert!(!event.was_matched);
    assert_eq!(state.scenario_state("strict").unwrap(), STARTED);
}

#[test]
fn set_state_round_trips_and_rejects_undeclared_states() {
    let state = StubServerState::default();

    state
        .register_stub(
            scenario_stub("/s", "ok", "managed")
                .with_required_scenario_state("Ready")
                .with_new_scenario_state("Done"),
        )
        .unwrap();

    assert!(state.set_scenario_state("managed", "NotAThing").is_err());

    state.set_scenario_state("managed", "Ready").unwrap();
    assert_eq!(state.scenario_state("managed").unwrap(), "Ready");

    state.reset_scenario("managed").unwrap();
    assert_eq!(state.scenario_state("managed").unwrap(), STARTED);
}

#[test]
fn unknown_scenario_operations_are_not_found() {
    let state = StubServerState::default();
    assert!(state.scenario_state("ghost").is_err());
    assert!(state.set_scenario_state("ghost", STARTED).is_err());
    assert!(state.reset_scenario("ghost").is_err());
}

#[test]
fn dynamic_scenarios_track_sessions_independently() {
    let state = StubServerState::default();
    state.scenarios().dynamic().register_prefix(
        "checkout",
        Some(ScenarioKeyExtractor::from_source(r#""cart":"([a-z0-9]+)""#).unwrap()),
    );

    state
        .register_stub(
            StubMapping::new()
                .with_request(RequestPattern::new().with_method("POST").with_path("/cart"))
                .with_response(StubResponse::new().with_body("created"))
                .in_scenario("checkout")
                .with_new_scenario_state("Open"),
        )
        .unwrap();
    state
        .register_stub(
            StubMapping::new()
                .with_request(RequestPattern::new().with_method("POST").with_path("/cart"))
                .with_response(StubResponse::new().with_body("already open"))
                .in_scenario("checkout")
                .with_required_scenario_state("Open")
                .with_priority(1),
        )
        .unwrap();

    let session_a = HttpStubRequest::new("POST", "/cart").with_body(r#"{"cart":"aaa"}"#);
    let session_b = HttpStubRequest::new("POST", "/cart").with_body(r#"{"cart":"bbb"}"#);

    assert_eq!(
        state.serve(session_a.clone()).response.body_string(),
        "created"
    );
    assert_eq!(
        state.serve(session_a.clone()).response.body_string(),
        "already open"
    );

    // session B starts from scratch even though A has advanced
    assert_eq!(state.serve(session_b).response.body_string(), "created");
    assert_eq!(state.scenario_state("checkout[aaa]").unwrap(), "Open");
}

#[test]
fn scenario_lifecycle_follows_its_member_stubs() {
    let state = StubServerState::default();

    let mapping = state
        .register_stub(scenario_stub("/m", "ok", "member-bound").with_new_scenario_state("X"))
        .unwrap();
    assert!(state.scenario_state("member-bound").is_ok());

    state.remove_stub_by_id(mapping.id).unwrap();
    assert!(state.scenario_state("member-bound").is_err());
}
