//! Semantic JSON comparison. Distance is expressed as the share of
//! mismatched nodes rather than character distance, so `{"a":1,"b":2}`
//! against `{"a":1,"b":3}` scores much closer than against `[1,2,3]`.

use serde_json::Value;

/// Number of nodes in a JSON value: one per container plus its children,
/// one per scalar.
pub(crate) fn node_count(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(node_count).sum::<usize>(),
        Value::Array(items) => 1 + items.iter().map(node_count).sum::<usize>(),
        _ => 1,
    }
}

/// Counts nodes that differ between the two values, comparing objects by
/// key and arrays by index. A type mismatch counts the whole larger
/// subtree as missed.
pub(crate) fn mismatched_nodes(expected: &Value, actual: &Value) -> usize {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => {
            let mut missed = 0;
            for (key, ev) in e {
                match a.get(key) {
                    Some(av) => missed += mismatched_nodes(ev, av),
                    None => missed += node_count(ev),
                }
            }
            for (key, av) in a {
                if !e.contains_key(key) {
                    missed += node_count(av);
                }
            }
            missed
        }
        (Value::Array(e), Value::Array(a)) => {
            let mut missed = 0;
            for i in 0..e.len().max(a.len()) {
                match (e.get(i), a.get(i)) {
                    (Some(ev), Some(av)) => missed += mismatched_nodes(ev, av),
                    (Some(ev), None) => missed += node_count(ev),
                    (None, Some(av)) => missed += node_count(av),
                    (None, None) => unreachable!(),
                }
            }
            missed
        }
        (e, a) if e == a => 0,
        (e, a) if scalar_kind(e) == scalar_kind(a) && scalar_kind(e).is_some() => 1,
        (e, a) => node_count(e).max(node_count(a)),
    }
}

/// Like [`mismatched_nodes`], but only counts requirements the expected
/// value states: extra keys in the actual document are ignored. Used by
/// the containment ("includes") comparison.
pub(crate) fn missing_expected_nodes(expected: &Value, actual: &Value) -> usize {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => e
            .iter()
            .map(|(key, ev)| match a.get(key) {
                Some(av) => missing_expected_nodes(ev, av),
                None => node_count(ev),
            })
            .sum(),
        (Value::Array(e), Value::Array(a)) => (0..e.len())
            .map(|i| match a.get(i) {
                Some(av) => missing_expected_nodes(&e[i], av),
                None => node_count(&e[i]),
            })
            .sum(),
        (e, a) if e == a => 0,
        (e, a) if scalar_kind(e) == scalar_kind(a) && scalar_kind(e).is_some() => 1,
        (e, _) => node_count(e),
    }
}

fn scalar_kind(value: &Value) -> Option<u8> {
    match value {
        Value::Null => Some(0),
        Value::Bool(_) => Some(1),
        Value::Number(_) => Some(2),
        Value::String(_) => Some(3),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_documents_have_no_mismatches() {
        let doc = json!({"a": 1, "b": {"c": [1, 2, 3]}});
        assert_eq!(mismatched_nodes(&doc, &doc.clone()), 0);
    }

    #[test]
    fn single_scalar_difference_counts_one_node() {
        let expected = json!({"a": 1, "b": 2});
        let actual = json!({"a": 1, "b": 3});
        assert_eq!(mismatched_nodes(&expected, &actual), 1);
    }

    #[test]
    fn missing_key_counts_its_subtree() {
        let expected = json!({"a": 1, "b": {"c": 2, "d": 3}});
        let actual = json!({"a": 1});
        // the whole "b" subtree (object node + two scalars) is missing
        assert_eq!(mismatched_nodes(&expected, &actual), 3);
    }

    #[test]
    fn a_small_diff_scores_closer_than_a_type_mismatch() {
        let expected = json!({"a": 1, "b": 2});
        let close = json!({"a": 1, "b": 3});
        let far = json!([1, 2, 3]);
        assert!(mismatched_nodes(&expected, &close) < mismatched_nodes(&expected, &far));
    }

    #[test]
    fn containment_ignores_extra_actual_keys() {
        let expected = json!({"a": 1});
        let actual = json!({"a": 1, "b": 2, "c": 3});
        assert_eq!(missing_expected_nodes(&expected, &actual), 0);
        assert_eq!(mismatched_nodes(&expected, &actual), 2);
    }
}
