//! End-to-end repair scenarios.

use std::collections::HashSet;

use chrono::Utc;
use meridian_repair::InjuredSegment;
use meridian_testbed::{SabotageClient, TestPlanet};
use meridian_types::RedundancyScheme;

fn scheme(required: u16, repair: u16, optimal: u16, total: u16) -> RedundancyScheme {
    RedundancyScheme {
        required,
        repair,
        optimal,
        total,
        share_size: 256,
    }
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Minimum-required repair: five of nine holders go down, the four
/// survivors reconstruct, and the segment comes back at optimal.
#[tokio::test]
async fn repair_succeeds_with_minimum_required_pieces() {
    let planet = TestPlanet::new(15, TestPlanet::test_config()).await;
    let rs = scheme(4, 4, 9, 9);
    let data = test_data(8 * 1024);
    let segment = planet
        .upload_segment(rs, &data, &[0, 1, 2, 3, 4, 5, 6, 7, 8])
        .await;

    for index in 0..5 {
        planet.stop_node(index).await;
    }

    planet.drive(planet.core.checker.run_once()).await.unwrap();
    assert_eq!(planet.core.repair_queue.count(), 1);

    planet.core.repairer.run_once().await.unwrap();

    let repaired = planet
        .core
        .metabase
        .get_segment_by_position(segment.stream_id, segment.position)
        .await
        .unwrap();
    assert!(repaired.pieces.len() >= 9);
    assert!(repaired.repaired_at.is_some());

    // None of the stopped nodes kept a piece, and placements are unique.
    let stopped: HashSet<_> = (0..5).map(|i| planet.node_id(i)).collect();
    let nodes: HashSet<_> = repaired.pieces.node_ids().into_iter().collect();
    assert_eq!(nodes.len(), repaired.pieces.len());
    assert!(nodes.is_disjoint(&stopped));

    // The surviving holders earned one audit success each.
    for index in 5..9 {
        let record = planet.core.reputation.get(planet.node_id(index)).await;
        assert_eq!(record.total_audit_count, 1);
        assert_eq!(record.audit_success_count, 1);
        assert!(record.audit_alpha > 20.0);
        assert_eq!(record.audit_beta, 0.0);
    }
    assert_eq!(
        planet
            .core
            .repair_stats
            .repair_success
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

/// One surviving holder returns corrupted bytes: the repair detects it,
/// evicts the corrupt piece, and penalises only that node.
#[tokio::test]
async fn repair_evicts_corrupted_piece() {
    let planet = TestPlanet::new(16, TestPlanet::test_config()).await;
    let rs = scheme(3, 4, 9, 9);
    let data = test_data(6 * 1024);
    let segment = planet
        .upload_segment(rs, &data, &[0, 1, 2, 3, 4, 5, 6, 7, 8])
        .await;

    for index in 0..5 {
        planet.stop_node(index).await;
    }
    // Node 5 holds piece 5; flip its stored bytes.
    let corrupted = planet.node_id(5);
    planet.nodes[5].corrupt_piece(segment.root_piece_id.derive(corrupted, 5));

    planet.drive(planet.core.checker.run_once()).await.unwrap();
    planet.core.repairer.run_once().await.unwrap();

    let repaired = planet
        .core
        .metabase
        .get_segment_by_position(segment.stream_id, segment.position)
        .await
        .unwrap();
    assert!(repaired.pieces.len() >= 9);
    assert!(!repaired.pieces.contains_node(corrupted));

    let corrupt_record = planet.core.reputation.get(corrupted).await;
    assert!(corrupt_record.audit_beta > 0.0);
    assert_eq!(corrupt_record.audit_success_count, 0);

    for index in 6..9 {
        let record = planet.core.reputation.get(planet.node_id(index)).await;
        assert_eq!(record.audit_success_count, 1);
        assert!(record.audit_alpha > 20.0);
    }
}

/// Below `required` retrievable pieces: the segment stays queued and no
/// reputation moves.
#[tokio::test]
async fn irreparable_segment_stays_queued_without_reputation_changes() {
    let planet = TestPlanet::new(8, TestPlanet::test_config()).await;
    let rs = scheme(3, 5, 7, 7);
    let data = test_data(4 * 1024);
    let segment = planet
        .upload_segment(rs, &data, &[0, 1, 2, 3, 4, 5, 6])
        .await;

    for index in 0..3 {
        planet
            .core
            .overlay
            .disqualify_node(
                planet.node_id(index),
                meridian_overlay::DisqualificationReason::AuditFailure,
                Utc::now(),
            )
            .await
            .unwrap();
    }
    for index in 3..7 {
        planet.stop_node(index).await;
    }
    planet.core.reliability_cache.invalidate();

    // The checker refuses to enqueue it...
    planet.drive(planet.core.checker.run_once()).await.unwrap();
    assert_eq!(planet.core.repair_queue.count(), 0);
    assert_eq!(
        planet
            .core
            .checker_stats
            .irreparable
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    // ...and a manually enqueued item survives the repair pass untouched.
    planet.core.repair_queue.insert(InjuredSegment {
        stream_id: segment.stream_id,
        position: segment.position,
        health: 0,
        inserted_at: Utc::now(),
    });
    planet.core.repairer.run_once().await.unwrap();

    assert_eq!(planet.core.repair_queue.count(), 1);
    for index in 0..7 {
        let record = planet.core.reputation.get(planet.node_id(index)).await;
        assert_eq!(record.total_audit_count, 0);
    }
}

/// The segment vanishes between download and commit: the work item is
/// dropped, nothing is scored, the segment stays gone.
#[tokio::test]
async fn segment_deleted_during_repair_is_dropped() {
    let mut armed = None;
    let planet = TestPlanet::with_client(10, TestPlanet::test_config(), |network, metabase| {
        let client = SabotageClient::new(network.clone(), metabase.clone());
        armed = Some(client.clone());
        client
    })
    .await;
    let saboteur = armed.expect("sabotage client installed");

    let rs = scheme(3, 4, 5, 6);
    let data = test_data(3 * 1024);
    let segment = planet
        .upload_segment(rs, &data, &[0, 1, 2, 3, 4, 5])
        .await;

    for index in 0..3 {
        planet.stop_node(index).await;
    }

    planet.drive(planet.core.checker.run_once()).await.unwrap();
    assert_eq!(planet.core.repair_queue.count(), 1);

    // The first repair download deletes the segment out from under us.
    saboteur.arm(segment.stream_id, segment.position);
    planet.core.repairer.run_once().await.unwrap();

    assert_eq!(planet.core.repair_queue.count(), 0);
    assert!(
        planet
            .core
            .metabase
            .get_segment_by_position(segment.stream_id, segment.position)
            .await
            .is_err()
    );
    for index in 0..6 {
        let record = planet.core.reputation.get(planet.node_id(index)).await;
        assert_eq!(record.total_audit_count, 0);
    }
    assert_eq!(
        planet
            .core
            .repair_stats
            .dropped
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}
