//! End-to-end coverage of the literal scenarios in spec.md §8, driven
//! entirely through the public [`neurostore::Database`] facade.

use neurostore::{
    AddInput, BranchName, Database, EngineConfig, FieldFilter, FindQuery, Filter, MetadataValue,
    Predicate,
};

fn meta(pairs: &[(&str, &str)]) -> neurostore::MetadataMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), MetadataValue::Str(v.to_string())))
        .collect()
}

/// Scenario 1 + 2: relate creates an edge; a duplicate `(source, target,
/// verb-type)` relate returns the existing id rather than a new one.
#[tokio::test]
async fn relate_then_duplicate_relate_is_idempotent() {
    let db = Database::open(EngineConfig::default()).await.unwrap();
    let a = db
        .add("PERSON", AddInput { vector: vec![1.0, 0.0], data: Some("alpha".into()), ..Default::default() })
        .await
        .unwrap();
    let b = db
        .add("PERSON", AddInput { vector: vec![0.0, 1.0], data: Some("beta".into()), ..Default::default() })
        .await
        .unwrap();

    let r = db
        .relate(a.id, "KNOWS", b.id, 1.0, Default::default())
        .await
        .unwrap();

    let neighbors = db
        .neighbors(a.id, neurostore::Direction::Out)
        .await
        .unwrap();
    assert_eq!(neighbors, vec![b.id]);

    let r2 = db
        .relate(a.id, "KNOWS", b.id, 1.0, Default::default())
        .await
        .unwrap();
    assert_eq!(r, r2);
}

/// Scenario 3: `similar` over two axis-aligned unit vectors returns the
/// other one first, with the spec's closed-form cosine-distance score.
#[tokio::test]
async fn similar_returns_nearest_with_expected_score() {
    let db = Database::open(EngineConfig::default()).await.unwrap();
    let x = db
        .add("THING", AddInput { id: None, vector: vec![1.0, 0.0, 0.0], ..Default::default() })
        .await
        .unwrap();
    let y = db
        .add("THING", AddInput { vector: vec![0.0, 1.0, 0.0], ..Default::default() })
        .await
        .unwrap();

    let hits = db
        .similar(neurostore::SimilarTarget::Id(x.id), None, 1)
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    let (hit, score) = &hits[0];
    assert_eq!(hit.id, y.id);
    // cosine distance between orthogonal unit vectors is 1, so
    // similarity = 1 / (1 + 1) = 0.5.
    assert!((score - 0.5).abs() < 1e-4, "unexpected score {score}");
}

/// Scenario 4: two non-overlapping pages of a filtered scan union back to
/// the full matching set.
#[tokio::test]
async fn pagination_yields_disjoint_pages_covering_the_full_set() {
    let db = Database::open(EngineConfig::default()).await.unwrap();
    for i in 0..20 {
        db.add(
            "PERSON",
            AddInput {
                vector: vec![i as f32, 0.0],
                metadata: meta(&[("cohort", "2026")]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    let filter = Filter::Field(FieldFilter {
        field: "cohort".into(),
        predicate: Predicate::Eq(MetadataValue::Str("2026".into())),
    });

    let page1 = db
        .find(FindQuery { filter: Some(filter.clone()), limit: 10, offset: 0, ..Default::default() })
        .await
        .unwrap();
    let page2 = db
        .find(FindQuery { filter: Some(filter), limit: 10, offset: 10, ..Default::default() })
        .await
        .unwrap();

    assert_eq!(page1.items.len(), 10);
    assert_eq!(page2.items.len(), 10);
    assert_eq!(page1.total, 20);
    assert!(page1.has_more);
    assert!(!page2.has_more);

    let ids1: std::collections::HashSet<_> = page1.items.iter().map(|n| n.id).collect();
    let ids2: std::collections::HashSet<_> = page2.items.iter().map(|n| n.id).collect();
    assert!(ids1.is_disjoint(&ids2));
    assert_eq!(ids1.len() + ids2.len(), 20);
}

/// Scenario 5: forking does not leak writes back into the parent branch.
#[tokio::test]
async fn fork_isolates_writes_from_the_parent_branch() {
    let db = Database::open(EngineConfig::default()).await.unwrap();
    for i in 0..5 {
        db.add("PERSON", AddInput { vector: vec![i as f32, 1.0], ..Default::default() })
            .await
            .unwrap();
    }
    db.commit("tester", "seed", true).await.unwrap();

    let before = db.find(FindQuery { limit: 100, ..Default::default() }).await.unwrap();
    assert_eq!(before.total, 5);

    let exp = db.fork(BranchName::new("exp").unwrap()).await.unwrap();
    exp.add("PERSON", AddInput { vector: vec![9.0, 9.0], ..Default::default() })
        .await
        .unwrap();

    let exp_page = exp.find(FindQuery { limit: 100, ..Default::default() }).await.unwrap();
    assert_eq!(exp_page.total, 6);

    let parent_after = db.find(FindQuery { limit: 100, ..Default::default() }).await.unwrap();
    assert_eq!(parent_after.total, 5, "fork write must not reach the parent branch");
}

/// Scenario 6: a `captureState` commit preserves pre-edit state, reachable
/// from `as_of` after the live branch has since mutated.
#[tokio::test]
async fn as_of_recovers_pre_edit_state_after_deletion() {
    let db = Database::open(EngineConfig::default()).await.unwrap();
    let a = db
        .add("PERSON", AddInput { vector: vec![1.0, 0.0], data: Some("alpha".into()), ..Default::default() })
        .await
        .unwrap();
    let b = db
        .add("PERSON", AddInput { vector: vec![0.0, 1.0], data: Some("beta".into()), ..Default::default() })
        .await
        .unwrap();

    let v1 = db.commit("tester", "v1", true).await.unwrap();

    assert!(db.delete("PERSON", a.id).await.unwrap());
    assert!(db.delete("PERSON", b.id).await.unwrap());
    assert!(db.get("PERSON", a.id).await.unwrap().is_none());

    let snapshot = db.as_of(v1).await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.get(a.id).await.unwrap().is_some());
    assert!(snapshot.get(b.id).await.unwrap().is_some());
}

/// Universal invariant: delete cascades to incident verbs.
#[tokio::test]
async fn delete_cascades_to_incident_verbs() {
    let db = Database::open(EngineConfig::default()).await.unwrap();
    let a = db.add("PERSON", AddInput { vector: vec![1.0, 0.0], ..Default::default() }).await.unwrap();
    let b = db.add("PERSON", AddInput { vector: vec![0.0, 1.0], ..Default::default() }).await.unwrap();
    let verb = db.relate(a.id, "KNOWS", b.id, 1.0, Default::default()).await.unwrap();

    assert!(db.delete("PERSON", b.id).await.unwrap());

    assert!(db.neighbors(a.id, neurostore::Direction::Out).await.unwrap().is_empty());
    assert!(!db.unrelate(verb).await.unwrap());
}
