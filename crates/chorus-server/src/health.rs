use std::time::Duration;

use chorus_contracts::PeerStatusRecord;
use chrono::Utc;

use crate::AppState;

/// Periodic self-reporting plus the stale-assignment sweep. Runs on its
/// own timer, never touches the lock table, and never blocks routing;
/// a failed write is logged and retried on the next tick.
pub struct HealthMonitor {
    state: AppState,
}

impl HealthMonitor {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.state.ctx.settings.tick_interval_ms,
        ));
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        let ctx = &self.state.ctx;
        let now = Utc::now();
        for peer in &ctx.peers {
            let (status, load) = ctx.live_status(&peer.id);
            let record = PeerStatusRecord {
                peer_id: peer.id.clone(),
                status,
                load,
                last_heartbeat: now.to_rfc3339(),
            };
            let mut store = ctx.store.lock().await;
            if let Err(e) = store.upsert_peer_status(&record) {
                tracing::warn!(
                    error = %e,
                    peer_id = %peer.id,
                    "peer status write failed; will retry next tick"
                );
            }
        }

        let threshold =
            chrono::Duration::milliseconds(ctx.settings.inactivity_threshold_ms as i64);
        let mut store = ctx.store.lock().await;
        match store.release_stale(threshold, now) {
            Ok(0) => {}
            Ok(swept) => tracing::info!(swept, "deactivated stale assignments"),
            Err(e) => tracing::warn!(error = %e, "stale assignment sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InProcessEngine, InProcessGateway, MediaEngine};
    use chorus_config::{Balancer, Cluster, Config, Coordination, Health, PeerEntry, Server, Store};
    use chorus_contracts::{AssignReason, PeerHealth};
    use chorus_kernel::parse_rfc3339;
    use std::sync::Arc;

    fn test_state() -> (AppState, Arc<InProcessGateway>, Arc<InProcessEngine>) {
        let gateway = Arc::new(InProcessGateway::default());
        let engine = Arc::new(InProcessEngine::default());
        let cfg = Config {
            server: Server {
                listen_addr: "127.0.0.1:0".to_string(),
            },
            store: Store {
                kind: "memory".to_string(),
                sqlite_path: None,
            },
            cluster: Cluster {
                peers: vec![
                    PeerEntry {
                        id: "p1".to_string(),
                        name: "alpha".to_string(),
                        external_id: "x1".to_string(),
                        primary: true,
                    },
                    PeerEntry {
                        id: "p2".to_string(),
                        name: "beta".to_string(),
                        external_id: "x2".to_string(),
                        primary: false,
                    },
                ],
            },
            coordination: Coordination::default(),
            health: Health::default(),
            balancer: Balancer::default(),
        };
        let state = AppState::new(cfg, gateway.clone(), engine.clone()).expect("state");
        (state, gateway, engine)
    }

    #[tokio::test]
    async fn tick_persists_live_statuses() {
        let (state, gateway, engine) = test_state();
        engine.create_session("p1", "g1", "c1").unwrap();
        gateway.set_ready("p2", false);

        HealthMonitor::new(state.clone()).tick().await;

        let statuses = {
            let store = state.ctx.store.lock().await;
            store.peer_statuses().unwrap()
        };
        let by_id = |id: &str| {
            statuses
                .iter()
                .find(|r| r.peer_id == id)
                .cloned()
                .expect("status row")
        };
        let p1 = by_id("p1");
        assert_eq!(p1.status, PeerHealth::Available);
        assert_eq!(p1.load, 1);
        assert!(parse_rfc3339(&p1.last_heartbeat).is_some());
        assert_eq!(by_id("p2").status, PeerHealth::Offline);
    }

    #[tokio::test]
    async fn tick_reports_in_use_at_capacity() {
        let (state, _gateway, engine) = test_state();
        let max = state.ctx.settings.max_sessions_per_peer as usize;
        for i in 0..max {
            engine.create_session("p2", &format!("g{i}"), "c1").unwrap();
        }

        HealthMonitor::new(state.clone()).tick().await;

        let statuses = {
            let store = state.ctx.store.lock().await;
            store.peer_statuses().unwrap()
        };
        let p2 = statuses.iter().find(|r| r.peer_id == "p2").unwrap();
        assert_eq!(p2.status, PeerHealth::InUse);
    }

    #[tokio::test]
    async fn tick_sweeps_stale_assignments() {
        let (state, _gateway, _engine) = test_state();
        let old = parse_rfc3339("2026-08-01T10:00:00Z").unwrap();
        {
            let mut store = state.ctx.store.lock().await;
            store
                .get_or_create_assignment("g1", "p1", "x1", AssignReason::Auto, old)
                .unwrap();
            store.activate("g1", "c1", old).unwrap();
        }

        HealthMonitor::new(state.clone()).tick().await;

        let record = {
            let store = state.ctx.store.lock().await;
            store.get_assignment("g1").unwrap().unwrap()
        };
        assert!(!record.active);
        assert_eq!(record.owner_peer_id, "p1");
    }
}
