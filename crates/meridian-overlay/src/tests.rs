use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use meridian_types::{CountryCode, NodeId};

use crate::cache::ReliabilityCache;
use crate::config::OverlayConfig;
use crate::error::OverlayError;
use crate::node::{CheckInInfo, DisqualificationReason, ExitStatusRequest};
use crate::service::{NodeSelectionRequest, Overlay, subnet_of};

async fn check_in(overlay: &Overlay, address: &str, country: Option<&str>) -> NodeId {
    let id = NodeId::generate();
    overlay
        .update_check_in(
            CheckInInfo {
                id,
                address: address.to_string(),
                country: country.map(CountryCode::new),
                verifying_key: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    id
}

async fn populate(overlay: &Overlay, count: usize, vetted: bool) -> Vec<NodeId> {
    let mut ids = Vec::new();
    for i in 0..count {
        let id = check_in(overlay, &format!("10.0.{i}.1:7777"), None).await;
        if vetted {
            overlay.set_vetted(id, Utc::now()).await.unwrap();
        }
        ids.push(id);
    }
    ids
}

#[tokio::test]
async fn check_in_creates_and_refreshes_record() {
    let overlay = Overlay::new(OverlayConfig::default());
    let id = check_in(&overlay, "10.1.2.3:7777", Some("de")).await;

    let record = overlay.get(id).await.unwrap();
    assert_eq!(record.address, "10.1.2.3:7777");
    assert_eq!(record.last_net, "10.1.2");
    assert_eq!(record.country.as_ref().unwrap().as_str(), "DE");
    assert!(!record.is_vetted());

    // A later check-in moves the address but keeps the record.
    overlay
        .update_check_in(
            CheckInInfo {
                id,
                address: "10.9.9.9:7777".to_string(),
                country: None,
                verifying_key: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    let record = overlay.get(id).await.unwrap();
    assert_eq!(record.last_net, "10.9.9");
    assert_eq!(record.country.as_ref().unwrap().as_str(), "DE");
}

#[tokio::test]
async fn reliability_requires_recent_contact_and_clean_status() {
    let overlay = Overlay::new(OverlayConfig::default());
    let now = Utc::now();

    let fresh = check_in(&overlay, "10.0.0.1:7777", None).await;
    let stale = check_in(&overlay, "10.0.1.1:7777", None).await;
    let disqualified = check_in(&overlay, "10.0.2.1:7777", None).await;
    let suspended = check_in(&overlay, "10.0.3.1:7777", None).await;

    // Simulate an old last contact by checking reliability far in the future.
    let record = overlay.get(stale).await.unwrap();
    assert!(record.is_reliable(now, Duration::hours(4)));
    assert!(!record.is_reliable(now + Duration::hours(5), Duration::hours(4)));

    overlay
        .disqualify_node(disqualified, DisqualificationReason::AuditFailure, now)
        .await
        .unwrap();
    overlay
        .set_offline_suspension(suspended, Some(now))
        .await
        .unwrap();

    let (reliable, _) = overlay.reliability_sets(now).await.unwrap();
    assert!(reliable.contains(&fresh));
    assert!(!reliable.contains(&disqualified));
    assert!(!reliable.contains(&suspended));
}

#[tokio::test]
async fn known_reliable_returns_subset() {
    let overlay = Overlay::new(OverlayConfig::default());
    let now = Utc::now();
    let good = check_in(&overlay, "10.0.0.1:7777", None).await;
    let bad = check_in(&overlay, "10.0.1.1:7777", None).await;
    overlay
        .disqualify_node(bad, DisqualificationReason::AuditFailure, now)
        .await
        .unwrap();

    let reliable = overlay
        .known_reliable(&[good, bad, NodeId::generate()], now)
        .await;
    assert_eq!(reliable.len(), 1);
    assert_eq!(reliable[0].id, good);
}

#[tokio::test]
async fn selection_respects_exclusions_and_count() {
    let overlay = Overlay::new(OverlayConfig {
        new_node_fraction: 0.0,
        ..OverlayConfig::default()
    });
    let ids = populate(&overlay, 6, true).await;

    let picked = overlay
        .find_storage_nodes_for_upload(
            &NodeSelectionRequest {
                requested_count: 4,
                excluded: vec![ids[0], ids[1]],
            },
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(picked.len(), 4);
    assert!(picked.iter().all(|node| node.id != ids[0] && node.id != ids[1]));
}

#[tokio::test]
async fn selection_enforces_distinct_subnets() {
    let overlay = Overlay::new(OverlayConfig {
        new_node_fraction: 0.0,
        ..OverlayConfig::default()
    });
    // Two nodes share 10.0.0.x; one sits alone in 10.0.1.x.
    check_in(&overlay, "10.0.0.1:7777", None).await;
    check_in(&overlay, "10.0.0.2:7777", None).await;
    check_in(&overlay, "10.0.1.1:7777", None).await;
    let (reliable, _) = overlay.reliability_sets(Utc::now()).await.unwrap();
    for id in reliable {
        overlay.set_vetted(id, Utc::now()).await.unwrap();
    }

    let picked = overlay
        .find_storage_nodes_for_upload(
            &NodeSelectionRequest {
                requested_count: 2,
                excluded: vec![],
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(picked.len(), 2);

    let err = overlay
        .find_storage_nodes_for_upload(
            &NodeSelectionRequest {
                requested_count: 3,
                excluded: vec![],
            },
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::NotEnoughNodes { available: 2, .. }));
}

#[tokio::test]
async fn selection_excludes_exiting_and_excluded_countries() {
    let overlay = Overlay::new(OverlayConfig {
        new_node_fraction: 0.0,
        excluded_countries: vec!["RU".to_string()],
        ..OverlayConfig::default()
    });
    let exiting = check_in(&overlay, "10.0.0.1:7777", None).await;
    let embargoed = check_in(&overlay, "10.0.1.1:7777", Some("ru")).await;
    let good = check_in(&overlay, "10.0.2.1:7777", None).await;
    let now = Utc::now();
    for id in [exiting, embargoed, good] {
        overlay.set_vetted(id, now).await.unwrap();
    }
    overlay
        .update_exit_status(ExitStatusRequest {
            initiated_at: Some(now),
            ..ExitStatusRequest::new(exiting)
        })
        .await
        .unwrap();

    let picked = overlay
        .find_storage_nodes_for_upload(
            &NodeSelectionRequest {
                requested_count: 1,
                excluded: vec![],
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(picked[0].id, good);
}

#[tokio::test]
async fn selection_mixes_new_nodes_by_fraction() {
    let overlay = Overlay::new(OverlayConfig {
        new_node_fraction: 0.5,
        distinct_subnets: false,
        ..OverlayConfig::default()
    });
    let vetted = populate(&overlay, 4, true).await;
    let unvetted = populate(&overlay, 4, false).await;

    let picked = overlay
        .find_storage_nodes_for_upload(
            &NodeSelectionRequest {
                requested_count: 4,
                excluded: vec![],
            },
            Utc::now(),
        )
        .await
        .unwrap();

    let new_picked = picked
        .iter()
        .filter(|node| unvetted.contains(&node.id))
        .count();
    let vetted_picked = picked
        .iter()
        .filter(|node| vetted.contains(&node.id))
        .count();
    assert_eq!(new_picked, 2);
    assert_eq!(vetted_picked, 2);
}

#[tokio::test]
async fn disqualification_is_absorbing_and_spares_exited_nodes() {
    let overlay = Overlay::new(OverlayConfig::default());
    let now = Utc::now();

    let exited = check_in(&overlay, "10.0.0.1:7777", None).await;
    overlay
        .update_exit_status(ExitStatusRequest {
            initiated_at: Some(now),
            finished_at: Some(now),
            success: Some(true),
            ..ExitStatusRequest::new(exited)
        })
        .await
        .unwrap();
    overlay
        .disqualify_node(exited, DisqualificationReason::AuditFailure, now)
        .await
        .unwrap();
    assert!(!overlay.get(exited).await.unwrap().is_disqualified());

    let node = check_in(&overlay, "10.0.1.1:7777", None).await;
    overlay
        .disqualify_node(node, DisqualificationReason::AuditFailure, now)
        .await
        .unwrap();
    overlay
        .disqualify_node(node, DisqualificationReason::Offline, now + Duration::hours(1))
        .await
        .unwrap();
    let record = overlay.get(node).await.unwrap();
    assert_eq!(record.disqualified_at, Some(now));
    assert_eq!(
        record.disqualification_reason,
        Some(DisqualificationReason::AuditFailure)
    );
}

#[tokio::test]
async fn exiting_nodes_tracks_lifecycle() {
    let overlay = Overlay::new(OverlayConfig::default());
    let now = Utc::now();
    let node = check_in(&overlay, "10.0.0.1:7777", None).await;
    assert!(overlay.exiting_nodes().await.is_empty());

    overlay
        .update_exit_status(ExitStatusRequest {
            initiated_at: Some(now),
            ..ExitStatusRequest::new(node)
        })
        .await
        .unwrap();
    assert_eq!(overlay.exiting_nodes().await.len(), 1);

    overlay
        .update_exit_status(ExitStatusRequest {
            finished_at: Some(now),
            success: Some(true),
            ..ExitStatusRequest::new(node)
        })
        .await
        .unwrap();
    assert!(overlay.exiting_nodes().await.is_empty());
    assert!(overlay.get(node).await.unwrap().has_exited());
}

#[tokio::test]
async fn reliable_pieces_in_excluded_countries_filters_by_country() {
    let overlay = Overlay::new(OverlayConfig {
        excluded_countries: vec!["KP".to_string()],
        ..OverlayConfig::default()
    });
    let now = Utc::now();
    let embargoed = check_in(&overlay, "10.0.0.1:7777", Some("kp")).await;
    let clean = check_in(&overlay, "10.0.1.1:7777", Some("de")).await;

    let excluded = overlay
        .reliable_pieces_in_excluded_countries(&[embargoed, clean], now)
        .await;
    assert_eq!(excluded, vec![embargoed]);
}

#[tokio::test]
async fn cache_refreshes_once_then_serves_snapshots() {
    let overlay = Arc::new(Overlay::new(OverlayConfig {
        cache_staleness: StdDuration::from_secs(3600),
        ..OverlayConfig::default()
    }));
    let node = check_in(&overlay, "10.0.0.1:7777", None).await;
    let cache = ReliabilityCache::new(overlay.clone());

    let snapshot = cache.snapshot(None).await.unwrap();
    assert!(snapshot.is_reliable(node));
    assert_eq!(snapshot.reliable_count(), 1);

    // A node added after the snapshot stays invisible until invalidation.
    let late = check_in(&overlay, "10.0.1.1:7777", None).await;
    let snapshot = cache.snapshot(None).await.unwrap();
    assert!(!snapshot.is_reliable(late));

    cache.invalidate();
    let snapshot = cache.snapshot(None).await.unwrap();
    assert!(snapshot.is_reliable(late));
}

#[tokio::test]
async fn cache_honours_valid_up_to() {
    let overlay = Arc::new(Overlay::new(OverlayConfig {
        cache_staleness: StdDuration::from_secs(3600),
        ..OverlayConfig::default()
    }));
    check_in(&overlay, "10.0.0.1:7777", None).await;
    let cache = ReliabilityCache::new(overlay.clone());

    let first = cache.snapshot(None).await.unwrap();
    let newer = check_in(&overlay, "10.0.1.1:7777", None).await;

    let refreshed = cache
        .snapshot(Some(first.created_at() + Duration::milliseconds(1)))
        .await
        .unwrap();
    assert!(refreshed.is_reliable(newer));
}

#[test]
fn subnet_of_handles_ipv4_and_hostnames() {
    assert_eq!(subnet_of("192.168.3.7:7777").unwrap(), "192.168.3");
    assert_eq!(subnet_of("node.example.com:7777").unwrap(), "node.example.com");
    assert!(subnet_of(":7777").is_err());
}
