//! The in-process planet.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meridian_config::SatelliteConfig;
use meridian_erasure::Strategy;
use meridian_metabase::{Metabase, Segment};
use meridian_orders::SatelliteIdentity;
use meridian_overlay::CheckInInfo;
use meridian_piecestore::NodeClient;
use meridian_satellite::Core;
use meridian_types::{NodeId, Piece, PieceId, Pieces, RedundancyScheme, SegmentPosition, StreamId};

use crate::network::{TestNetwork, TestNode};

/// A full durability core plus a set of fake storage nodes.
pub struct TestPlanet {
    pub core: Arc<Core>,
    pub network: Arc<TestNetwork>,
    pub nodes: Vec<Arc<TestNode>>,
    addresses: Vec<String>,
}

impl TestPlanet {
    /// Configuration with short timeouts and no selection randomness,
    /// suitable for scenario tests.
    pub fn test_config() -> SatelliteConfig {
        let mut config = SatelliteConfig::default();
        config.overlay.cache_staleness = Duration::ZERO;
        config.overlay.new_node_fraction = 0.0;
        config.segment_loop.coalesce = Duration::from_millis(1);
        config.audit.share_timeout = Duration::from_secs(5);
        config.repair.download_timeout = Duration::from_secs(5);
        config.repair.upload_timeout = Duration::from_secs(5);
        config.exit.node_min_age = Duration::ZERO;
        config.exit.recv_timeout = Duration::from_secs(2);
        config
    }

    /// Builds a planet with `node_count` vetted nodes.
    pub async fn new(node_count: usize, config: SatelliteConfig) -> Self {
        Self::with_client(node_count, config, |network, _metabase| network.clone()).await
    }

    /// Builds a planet whose core dials through a custom client.
    pub async fn with_client(
        node_count: usize,
        config: SatelliteConfig,
        client: impl FnOnce(&Arc<TestNetwork>, &Arc<Metabase>) -> Arc<dyn NodeClient>,
    ) -> Self {
        let identity = SatelliteIdentity::generate();
        let network = TestNetwork::new(identity.verifying_key());
        let metabase = Arc::new(Metabase::new());
        let client = client(&network, &metabase);
        let core = Arc::new(Core::new(config, identity, metabase, client));

        let mut nodes = Vec::with_capacity(node_count);
        let mut addresses = Vec::with_capacity(node_count);
        let now = Utc::now();
        for i in 0..node_count {
            let node = TestNode::new();
            let address = format!("10.{}.{}.1:7777", i / 250, i % 250);
            network.add_node(node.clone());
            core.overlay
                .update_check_in(
                    CheckInInfo {
                        id: node.id(),
                        address: address.clone(),
                        country: None,
                        verifying_key: Some(node.verifying_key()),
                    },
                    now,
                )
                .await
                .expect("check-in succeeds");
            core.overlay
                .set_vetted(node.id(), now)
                .await
                .expect("node exists");
            nodes.push(node);
            addresses.push(address);
        }

        Self {
            core,
            network,
            nodes,
            addresses,
        }
    }

    pub fn node_id(&self, index: usize) -> NodeId {
        self.nodes[index].id()
    }

    /// Erasure-codes `data` and places piece `i` on `holders[i]`.
    pub async fn upload_segment(
        &self,
        redundancy: RedundancyScheme,
        data: &[u8],
        holders: &[usize],
    ) -> Segment {
        let strategy = Strategy::new(redundancy).expect("valid scheme");
        let shares = strategy.encode(data).expect("encode");
        let root_piece_id = PieceId::generate();
        let now = Utc::now();

        let mut pieces = Vec::with_capacity(holders.len());
        for (number, &holder) in holders.iter().enumerate() {
            let node = &self.nodes[holder];
            let piece_id = root_piece_id.derive(node.id(), number as u16);
            node.store_piece(piece_id, shares[number].clone(), now);
            pieces.push(Piece {
                number: number as u16,
                node: node.id(),
            });
        }

        let segment = Segment {
            stream_id: StreamId::generate(),
            position: SegmentPosition::new(0, 0),
            redundancy,
            root_piece_id,
            ancestor_stream_id: None,
            encrypted_size: data.len() as u64,
            pieces: Pieces::new(pieces),
            created_at: now,
            repaired_at: None,
            expires_at: None,
        };
        self.core
            .metabase
            .insert_segment(segment.clone())
            .await
            .expect("segment inserts");
        segment
    }

    /// Stops a node's process and ages its last contact out of the
    /// online window, so the overlay sees it offline too.
    pub async fn stop_node(&self, index: usize) {
        let node = &self.nodes[index];
        node.stop();
        let window = chrono::Duration::from_std(self.core.config.overlay.online_window)
            .unwrap_or_else(|_| chrono::Duration::hours(4));
        let past = Utc::now() - window - chrono::Duration::hours(1);
        self.core
            .overlay
            .update_check_in(
                CheckInInfo {
                    id: node.id(),
                    address: self.addresses[index].clone(),
                    country: None,
                    verifying_key: Some(node.verifying_key()),
                },
                past,
            )
            .await
            .expect("check-in succeeds");
        self.core.reliability_cache.invalidate();
    }

    /// Awaits `task` while driving segment-loop passes, so services that
    /// join the loop make progress.
    pub async fn drive<T>(&self, task: impl Future<Output = T>) -> T {
        tokio::pin!(task);
        loop {
            tokio::select! {
                out = &mut task => return out,
                () = tokio::time::sleep(Duration::from_millis(2)) => {
                    self.core.segment_loop.run_once().await;
                }
            }
        }
    }
}
