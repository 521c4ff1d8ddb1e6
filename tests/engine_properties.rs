mod common;

use chrono::Duration;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use yuanjing_forensics::timeline::RawEvent;
use yuanjing_forensics::{DiffEngine, FingerprintEngine, ForensicPolicy, TimelineBuilder};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000i64..1_000_000).prop_map(|n| json!(n)),
        "[a-z]{3,12}( [a-z]{3,8}){0,3}".prop_map(Value::String),
        Just(Value::Null),
    ]
}

fn nested() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,10}", inner, 0..5)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn document() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z_]{1,10}", nested(), 1..6)
        .prop_map(|m| Value::Object(m.into_iter().collect::<Map<String, Value>>()))
}

proptest! {
    #[test]
    fn fingerprint_is_deterministic(doc in document()) {
        let engine = FingerprintEngine::new(&ForensicPolicy::default());
        let a = engine.fingerprint("doc", &doc).unwrap();
        let b = engine.fingerprint("doc", &doc.clone()).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn similarity_is_reflexive_and_symmetric(a in document(), b in document()) {
        let engine = FingerprintEngine::new(&ForensicPolicy::default());
        let fa = engine.fingerprint("a", &a).unwrap();
        let fb = engine.fingerprint("b", &b).unwrap();

        let self_sim = engine.compare(&fa, &fa);
        prop_assert_eq!(self_sim.overall_similarity, 1.0);
        prop_assert!(self_sim.is_duplicate);

        let ab = engine.compare(&fa, &fb);
        let ba = engine.compare(&fb, &fa);
        prop_assert!((ab.overall_similarity - ba.overall_similarity).abs() < 1e-12);
        prop_assert!((0.0..=1.0).contains(&ab.overall_similarity));
    }

    #[test]
    fn diff_of_identical_documents_is_empty(doc in document()) {
        let engine = DiffEngine::new(&ForensicPolicy::default());
        let result = engine.diff("v1", &doc, "v2", &doc).unwrap();
        prop_assert_eq!(result.total_changes, 0);
        prop_assert_eq!(result.overall_similarity, 1.0);
        prop_assert!(result.suspicious_patterns.is_empty());
    }

    #[test]
    fn timeline_order_ignores_input_order(offsets in prop::collection::btree_set(0i64..10_000, 1..30)) {
        let kinds = ["document_viewed", "document_modified", "verification_passed", "signed"];
        let events: Vec<RawEvent> = offsets
            .iter()
            .enumerate()
            .map(|(i, minute)| RawEvent::new(kinds[i % kinds.len()], "auditor", common::at(*minute)))
            .collect();
        let mut reversed = events.clone();
        reversed.reverse();

        let builder = TimelineBuilder::new(&ForensicPolicy::default());
        let forward = builder.build("artifact", events);
        let backward = builder.build("artifact", reversed);

        let sequence = |t: &yuanjing_forensics::ForensicTimeline| {
            t.events.iter().map(|e| (e.timestamp, e.event_type.clone())).collect::<Vec<_>>()
        };
        prop_assert_eq!(sequence(&forward), sequence(&backward));
        prop_assert!(forward.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        prop_assert_eq!(forward.suspicious_patterns.len(), backward.suspicious_patterns.len());
    }
}

#[test]
fn events_sort_by_timestamp_not_arrival() {
    let builder = TimelineBuilder::new(&ForensicPolicy::default());
    let base = common::at(0);
    let events = vec![
        RawEvent::new("document_modified", "a", base + Duration::seconds(30)),
        RawEvent::new("document_uploaded", "a", base),
    ];
    let timeline = builder.build("artifact", events);
    assert_eq!(timeline.events[0].event_type, "document_uploaded");
}
