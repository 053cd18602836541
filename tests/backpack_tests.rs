/// Integration tests for the backpack state store.
///
/// These tests verify the store end to end: versioning, history,
/// snapshot reconstruction, namespace queries, permissions, and the JSON
/// round trip, plus property tests for the invariants the rest of the
/// framework leans on.
use backpack_flow::prelude::*;
use backpack_flow::{namespace, Backpack, CommitAction};
use proptest::prelude::*;
use serde_json::json;

fn by(node_id: &str) -> PackOptions {
    PackOptions::for_node_id(node_id)
}

fn by_ns(node_id: &str, ns: &str) -> PackOptions {
    PackOptions::for_node(node_id, node_id, ns)
}

#[test]
fn packs_bump_versions_and_record_history() {
    let store = Backpack::new();
    store.pack("counter", json!(1), by("n")).unwrap();
    store.pack("counter", json!(2), by("n")).unwrap();
    store.pack("counter", json!(3), by("n")).unwrap();

    assert_eq!(store.unpack("counter", None).unwrap(), Some(json!(3)));

    let history = store.get_key_history("counter");
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].new_value, json!(3));
    assert_eq!(history[0].previous_value, Some(json!(2)));

    let snapshot = store.snapshot();
    let (_, stored) = snapshot
        .items
        .iter()
        .find(|(key, _)| key == "counter")
        .unwrap();
    assert_eq!(stored.metadata.version, 3);
}

#[test]
fn snapshot_reconstruction_at_first_commit() {
    let store = Backpack::new();
    store.pack("counter", json!(1), by("n")).unwrap();
    let c1 = store.get_history()[0].commit_id.clone();
    store.pack("counter", json!(2), by("n")).unwrap();
    store.pack("counter", json!(3), by("n")).unwrap();

    let snapshot = store.get_snapshot_at_commit(&c1).unwrap();
    assert_eq!(snapshot.unpack("counter", None).unwrap(), Some(json!(1)));
    assert_eq!(snapshot.item_count(), 1);

    // The live store still reports the latest value.
    assert_eq!(store.unpack("counter", None).unwrap(), Some(json!(3)));
    assert!(matches!(
        store.get_snapshot_at_commit("no-such-commit"),
        Err(FlowError::InvalidCommit { .. })
    ));
}

#[test]
fn wildcard_namespace_queries() {
    let store = Backpack::new();
    store.pack("a", json!(1), by_ns("n1", "sales.chat")).unwrap();
    store.pack("b", json!(2), by_ns("n2", "sales.search")).unwrap();
    store
        .pack("c", json!(3), by_ns("n3", "reporting.analytics"))
        .unwrap();

    let sales = store.unpack_by_namespace("sales.*", None);
    assert_eq!(
        sales.iter().map(|(k, v)| (k.as_str(), v.clone())).collect::<Vec<_>>(),
        vec![("a", json!(1)), ("b", json!(2))]
    );

    let chat = store.unpack_by_namespace("*.chat", None);
    assert_eq!(chat.len(), 1);
    assert_eq!(chat["a"], json!(1));

    assert_eq!(
        store.get_namespaces(),
        vec!["reporting.analytics", "sales.chat", "sales.search"]
    );
}

#[test]
fn permission_gated_namespace_query() {
    let store = Backpack::new();
    store.register_permissions(
        "R",
        PermissionEntry::new().with_namespace_read(["public.*"]),
    );
    store.pack("p1", json!("a"), by_ns("w", "public.info")).unwrap();
    store
        .pack("p2", json!("b"), by_ns("w", "private.secrets"))
        .unwrap();

    assert!(store.unpack_by_namespace("private.*", Some("R")).is_empty());
    let visible = store.unpack_by_namespace("public.*", Some("R"));
    assert_eq!(visible.keys().collect::<Vec<_>>(), vec!["p1"]);
}

#[test]
fn json_round_trip_preserves_items_history_permissions() {
    let store = Backpack::new();
    store.register_permissions("N", PermissionEntry::new().with_deny(["secret"]));
    store.pack("a", json!({"deep": [1, 2]}), by_ns("n", "x.y")).unwrap();
    store.pack("a", json!({"deep": [3]}), by_ns("n", "x.y")).unwrap();
    store.pack("b", json!(true), by("m")).unwrap();

    let restored = Backpack::from_json(&store.to_json().unwrap()).unwrap();

    assert_eq!(restored.peek_all(), store.peek_all());
    assert_eq!(restored.get_history().len(), store.get_history().len());
    for (a, b) in restored.get_history().iter().zip(store.get_history().iter()) {
        assert_eq!(a, b);
    }
    // The deny rule survived the round trip.
    store.pack("secret", json!(1), by("w")).unwrap();
    assert_eq!(restored.pack("secret", json!(1), by("N")).unwrap(), None);
}

#[test]
fn replay_from_history_reconstructs_current_items() {
    let store = Backpack::new();
    store.pack("x", json!(1), by("n")).unwrap();
    store.pack("y", json!("a"), by("n")).unwrap();
    store.pack("x", json!(2), by("n")).unwrap();

    let last_commit = store.get_history()[0].commit_id.clone();
    let replayed = store.get_snapshot_at_commit(&last_commit).unwrap();
    assert_eq!(replayed.peek_all(), store.peek_all());
}

#[test]
fn quarantine_commits_are_counted_separately() {
    // The store only writes pack/unpack commits itself; quarantine is an
    // action recorded by external moderation. Verify the action round
    // trips through the snapshot document.
    let store = Backpack::new();
    store.pack("k", json!(1), by("n")).unwrap();
    let mut snapshot = store.snapshot();
    snapshot.history[0].action = CommitAction::Quarantine;
    let doc = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(doc["history"][0]["action"], "quarantine");
}

// ---------------------------------------------------------------------
// Property tests
// ---------------------------------------------------------------------

fn small_key() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["alpha", "beta", "gamma"]).prop_map(String::from)
}

proptest! {
    /// The latest version of a key equals the number of packs targeting
    /// it, and the stored value equals the most recent pack's value.
    #[test]
    fn version_counts_packs(writes in prop::collection::vec((small_key(), any::<i64>()), 1..40)) {
        let store = Backpack::new();
        for (key, value) in &writes {
            store.pack(key.clone(), json!(value), by("n")).unwrap();
        }
        for key in ["alpha", "beta", "gamma"] {
            let packs: Vec<&i64> = writes
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v)
                .collect();
            let history = store.get_key_history(key);
            prop_assert_eq!(history.len(), packs.len());
            match packs.last() {
                Some(last) => {
                    prop_assert_eq!(store.unpack(key, None).unwrap(), Some(json!(last)));
                    let snapshot = store.snapshot();
                    let (_, item) = snapshot.items.iter().find(|(k, _)| k == key).unwrap();
                    prop_assert_eq!(item.metadata.version as usize, packs.len());
                }
                None => prop_assert_eq!(store.unpack(key, None).unwrap(), None),
            }
        }
    }

    /// History is ordered newest-first; ties preserve insertion order.
    #[test]
    fn history_is_newest_first(count in 1usize..30) {
        let store = Backpack::new();
        for i in 0..count {
            store.pack(format!("k{i}"), json!(i), by("n")).unwrap();
        }
        let history = store.get_history();
        prop_assert_eq!(history.len(), count);
        for (offset, commit) in history.iter().enumerate() {
            prop_assert_eq!(&commit.key, &format!("k{}", count - 1 - offset));
        }
        for pair in history.windows(2) {
            prop_assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    /// diff partitions the key spaces of both stores.
    #[test]
    fn diff_partitions_keys(
        left in prop::collection::btree_map(small_key(), any::<i32>(), 0..3),
        right in prop::collection::btree_map(small_key(), any::<i32>(), 0..3),
    ) {
        let a = Backpack::new();
        let b = Backpack::new();
        for (key, value) in &left {
            a.pack(key.clone(), json!(value), by("n")).unwrap();
        }
        for (key, value) in &right {
            b.pack(key.clone(), json!(value), by("n")).unwrap();
        }
        let diff = Backpack::diff(&a, &b);
        let unchanged: Vec<&String> = left
            .iter()
            .filter(|(k, v)| right.get(*k) == Some(v))
            .map(|(k, _)| k)
            .collect();

        let mut from_b: Vec<String> = diff.added.clone();
        from_b.extend(diff.modified.iter().map(|m| m.key.clone()));
        from_b.extend(unchanged.iter().map(|k| (*k).clone()));
        from_b.sort();
        prop_assert_eq!(from_b, right.keys().cloned().collect::<Vec<_>>());

        let mut from_a: Vec<String> = diff.removed.clone();
        from_a.extend(diff.modified.iter().map(|m| m.key.clone()));
        from_a.extend(unchanged.iter().map(|k| (*k).clone()));
        from_a.sort();
        prop_assert_eq!(from_a, left.keys().cloned().collect::<Vec<_>>());
    }

    /// `*` matches exactly one segment: equal lengths match when literals
    /// agree, and any length mismatch fails.
    #[test]
    fn wildcard_matches_exactly_one_segment(
        segments in prop::collection::vec("[a-z]{1,4}", 1..5),
        star_at in any::<prop::sample::Index>(),
    ) {
        let ns = segments.join(".");
        let index = star_at.index(segments.len());
        let mut pattern_segments = segments.clone();
        pattern_segments[index] = "*".to_string();
        let pattern = pattern_segments.join(".");

        prop_assert!(namespace::pattern_matches(&pattern, &ns));
        prop_assert!(namespace::pattern_matches(&ns, &ns));

        // One extra segment on either side breaks the match.
        let ns_with_tail = format!("{}.tail", ns);
        let pattern_with_star = format!("{}.*", pattern);
        prop_assert!(!namespace::pattern_matches(&pattern, &ns_with_tail));
        prop_assert!(!namespace::pattern_matches(&pattern_with_star, &ns));
    }

    /// Mutating a namespace-query result never affects the store.
    #[test]
    fn deep_clone_isolation(value in any::<i64>()) {
        let store = Backpack::new();
        store
            .pack("doc", json!({"nested": {"value": value}}), by_ns("n", "docs.page"))
            .unwrap();
        let mut result = store.unpack_by_namespace("docs.*", None);
        result.get_mut("doc").unwrap()["nested"]["value"] = json!("overwritten");
        let mut items = store.get_items_by_namespace("docs.*", None);
        items[0].value["nested"] = json!(null);

        prop_assert_eq!(
            store.unpack("doc", None).unwrap(),
            Some(json!({"nested": {"value": value}}))
        );
    }

    /// A denied key stays denied no matter which allow rules exist.
    #[test]
    fn deny_always_overrides(
        read_keys in prop::collection::vec("[a-z]{1,6}", 0..4),
        patterns in prop::collection::vec("[a-z]{1,4}\\.\\*", 0..3),
    ) {
        let store = Backpack::with_config(BackpackConfig {
            strict: false,
            ..BackpackConfig::default()
        });
        let mut entry = PermissionEntry::new()
            .with_read(read_keys.clone())
            .with_write(read_keys)
            .with_namespace_read(patterns.clone())
            .with_namespace_write(patterns)
            .with_deny(["forbidden"]);
        entry.read.push("forbidden".to_string());
        entry.write.push("forbidden".to_string());
        store.register_permissions("N", entry);

        store.pack("forbidden", json!(1), by_ns("other", "a.b")).unwrap();
        prop_assert_eq!(store.unpack("forbidden", Some("N")).unwrap(), None);
        prop_assert_eq!(store.pack("forbidden", json!(2), by("N")).unwrap(), None);
        prop_assert_eq!(store.peek("forbidden"), Some(json!(1)));
    }
}
