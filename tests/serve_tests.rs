use std::sync::Arc;

use serde_json::{json, Value};
use stubmock::prelude::*;
use stubmock::{CustomMatcherSpec, SubEvent};

fn state() -> StubServerState {
    let _ = env_logger::try_init();
    StubServerState::default()
}

#[test]
fn higher_priority_stub_wins_for_the_same_request() {
    let state = state();

    state
        .register_stub(
            StubMapping::new()
                .with_priority(5)
                .with_request(RequestPattern::new().with_method("GET").with_path("/race"))
                .with_response(StubResponse::new().with_status(200).with_body("loser")),
        )
        .unwrap();
    state
        .register_stub(
            StubMapping::new()
                .with_priority(1)
                .with_request(RequestPattern::new().with_method("GET").with_path("/race"))
                .with_response(StubResponse::new().with_status(200).with_body("winner")),
        )
        .unwrap();

    let event = state.serve(HttpStubRequest::new("GET", "/race"));
    assert!(event.was_matched);
    assert_eq!(event.response.body_string(), "winner");
}

#[test]
fn equal_priority_prefers_the_most_recently_registered_stub() {
    let state = state();

    for body in ["first", "second", "third"] {
        state
            .register_stub(
                StubMapping::new()
                    .with_request(RequestPattern::new().with_path("/latest"))
                    .with_response(StubResponse::new().with_body(body)),
            )
            .unwrap();
    }

    let event = state.serve(HttpStubRequest::new("GET", "/latest"));
    assert_eq!(event.response.body_string(), "third");
}

#[test]
fn regex_body_miss_produces_reproducible_near_miss_diagnostics() {
    let state = state();

    state
        .register_stub(
            StubMapping::new().with_request(
                RequestPattern::new()
                    .with_method("POST")
                    .with_path("/numbers")
                    .with_body_pattern(ValuePattern::matching(r"^\d+$")),
            ),
        )
        .unwrap();

    let request = HttpStubRequest::new("POST", "/numbers").with_body("abc");

    let distances: Vec<f64> = (0..3)
        .map(|_| {
            let event = state.serve(request.clone());
            assert!(!event.was_matched);
            assert_eq!(event.response.status, Some(404));
            event
                .sub_events()
                .iter()
                .find(|e| e.kind == "REQUEST_NOT_MATCHED")
                .and_then(|e| e.data["nearMisses"][0]["distance"].as_f64())
                .expect("near miss distance missing from diagnostics")
        })
        .collect();

    assert!(distances[0] > 0.0);
    assert!(distances.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn coarse_mismatch_never_invokes_custom_matchers() {
    let mut state = StubServerState::default();
    state.extensions_mut().register_custom_matcher(
        "exploding",
        Arc::new(|_request: &HttpStubRequest, _params: &Value| -> MatchResult {
            panic!("custom matcher ran for a request that fails the coarse pass")
        }),
    );

    state
        .register_stub(
            StubMapping::new().with_request(
                RequestPattern::new()
                    .with_method("GET")
                    .with_path("/guarded")
                    .with_custom_matcher(CustomMatcherSpec::new("exploding", json!({}))),
            ),
        )
        .unwrap();

    // wrong method and wrong path: must not reach the custom matcher
    let event = state.serve(HttpStubRequest::new("POST", "/elsewhere"));
    assert!(!event.was_matched);
}

#[test]
fn unmatched_traffic_always_gets_a_response() {
    let state = state();

    for uri in ["/", "/a?b=c", "/deeply/nested/path", "/%20odd%20"] {
        for method in ["GET", "POST", "PUT", "DELETE", "PATCH"] {
            let event = state.serve(HttpStubRequest::new(method, uri));
            assert!(!event.was_matched);
            assert_eq!(event.response.status, Some(404));
        }
    }
}

#[test]
fn serve_events_accumulate_in_the_journal() {
    let state = state();
    state
        .register_stub(
            StubMapping::new()
                .with_request(RequestPattern::new().with_path("/logged"))
                .with_response(StubResponse::new().with_status(201)),
        )
        .unwrap();

    state.serve(HttpStubRequest::new("GET", "/logged"));
    state.serve(HttpStubRequest::new("GET", "/not-logged-anywhere"));

    let events = state.serve_events();
    assert_eq!(events.len(), 2);
    assert!(events[0].was_matched);
    assert!(!events[1].was_matched);

    // appending an equivalent standard sub-event twice is a no-op
    let mut event = events[1].clone();
    let before = event.sub_events().len();
    let existing = event.sub_events()[0].clone();
    event.append_sub_event(SubEvent::new(existing.kind.clone(), existing.data.clone()));
    assert_eq!(event.sub_events().len(), before);
}
