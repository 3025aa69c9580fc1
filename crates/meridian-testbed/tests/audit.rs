//! End-to-end audit scenarios.

use meridian_testbed::TestPlanet;
use meridian_types::RedundancyScheme;

fn scheme() -> RedundancyScheme {
    RedundancyScheme {
        required: 2,
        repair: 3,
        optimal: 4,
        total: 4,
        share_size: 128,
    }
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

async fn collect_and_audit(planet: &TestPlanet) {
    planet
        .drive(planet.core.audit_chore.run_once())
        .await
        .unwrap();
    assert!(planet.core.audit_queue.size() > 0);
    planet.core.audit_worker.run_once().await.unwrap();
}

#[tokio::test]
async fn honest_holders_earn_audit_successes() {
    let planet = TestPlanet::new(6, TestPlanet::test_config()).await;
    planet
        .upload_segment(scheme(), &test_data(1024), &[0, 1, 2, 3])
        .await;

    collect_and_audit(&planet).await;

    for index in 0..4 {
        let record = planet.core.reputation.get(planet.node_id(index)).await;
        assert_eq!(record.total_audit_count, 1);
        assert_eq!(record.audit_success_count, 1);
    }
    // Bystanders were never audited.
    let record = planet.core.reputation.get(planet.node_id(4)).await;
    assert_eq!(record.total_audit_count, 0);
}

#[tokio::test]
async fn corrupted_share_is_attributed_to_its_holder() {
    let planet = TestPlanet::new(6, TestPlanet::test_config()).await;
    let segment = planet
        .upload_segment(scheme(), &test_data(1024), &[0, 1, 2, 3])
        .await;

    let corrupted = planet.node_id(0);
    planet.nodes[0].corrupt_piece(segment.root_piece_id.derive(corrupted, 0));

    collect_and_audit(&planet).await;

    let bad = planet.core.reputation.get(corrupted).await;
    assert_eq!(bad.total_audit_count, 1);
    assert_eq!(bad.audit_success_count, 0);
    assert!(bad.audit_beta > 0.0);

    for index in 1..4 {
        let record = planet.core.reputation.get(planet.node_id(index)).await;
        assert_eq!(record.audit_success_count, 1);
    }
}

#[tokio::test]
async fn offline_holder_is_scored_offline_not_failed() {
    let planet = TestPlanet::new(6, TestPlanet::test_config()).await;
    planet
        .upload_segment(scheme(), &test_data(1024), &[0, 1, 2, 3])
        .await;

    planet.nodes[0].stop();
    collect_and_audit(&planet).await;

    let record = planet.core.reputation.get(planet.node_id(0)).await;
    assert_eq!(record.total_audit_count, 1);
    assert_eq!(record.audit_success_count, 0);
    // Dial failures touch online history, never the audit beta pair.
    assert_eq!(record.audit_beta, 0.0);
}

#[tokio::test]
async fn contained_node_is_reverified_later() {
    let planet = TestPlanet::new(6, TestPlanet::test_config()).await;
    planet
        .upload_segment(scheme(), &test_data(1024), &[0, 1, 2, 3])
        .await;

    let contained = planet.node_id(0);
    planet.nodes[0].set_contained(true);
    collect_and_audit(&planet).await;

    // The deferred responder has a pending audit, not a score.
    assert!(planet.core.containment.get(contained).await.is_some());
    let record = planet.core.reputation.get(contained).await;
    assert!(record.contained);
    assert_eq!(record.total_audit_count, 0);

    // Once it answers, the reverify settles the debt as a success.
    planet.nodes[0].set_contained(false);
    planet.core.reverify_worker.run_once().await.unwrap();

    assert!(planet.core.containment.get(contained).await.is_none());
    let record = planet.core.reputation.get(contained).await;
    assert!(!record.contained);
    assert_eq!(record.audit_success_count, 1);
}

#[tokio::test]
async fn contained_node_fails_after_reverify_cap() {
    let mut config = TestPlanet::test_config();
    config.audit.max_reverify_count = 2;
    let planet = TestPlanet::new(6, config).await;
    planet
        .upload_segment(scheme(), &test_data(1024), &[0, 1, 2, 3])
        .await;

    let contained = planet.node_id(0);
    planet.nodes[0].set_contained(true);
    collect_and_audit(&planet).await;
    assert_eq!(
        planet
            .core
            .containment
            .get(contained)
            .await
            .unwrap()
            .reverify_count,
        0
    );

    // Still contained: first reverify increments, second hits the cap.
    planet.core.reverify_worker.run_once().await.unwrap();
    assert_eq!(
        planet
            .core
            .containment
            .get(contained)
            .await
            .unwrap()
            .reverify_count,
        1
    );

    planet.core.reverify_worker.run_once().await.unwrap();
    assert!(planet.core.containment.get(contained).await.is_none());
    let record = planet.core.reputation.get(contained).await;
    assert!(record.audit_beta > 0.0);
}

#[tokio::test]
async fn deleted_segment_is_skipped_without_scoring() {
    let planet = TestPlanet::new(6, TestPlanet::test_config()).await;
    let segment = planet
        .upload_segment(scheme(), &test_data(1024), &[0, 1, 2, 3])
        .await;

    planet
        .drive(planet.core.audit_chore.run_once())
        .await
        .unwrap();
    planet
        .core
        .metabase
        .delete_segment(segment.stream_id, segment.position)
        .await;

    planet.core.audit_worker.run_once().await.unwrap();
    for index in 0..4 {
        let record = planet.core.reputation.get(planet.node_id(index)).await;
        assert_eq!(record.total_audit_count, 0);
    }
}
