use chorus_contracts::{AssignReason, AssignmentRecord, ForceAssignRequest, CONTRACT_VERSION};
use chorus_kernel::{select_peer, SelectorConfig};
use chrono::{DateTime, Utc};

use crate::{ClusterContext, PeerDef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceAssignError {
    Validation(String),
    UnknownPeer(String),
    PeerUnreachable(String),
    Store(String),
}

fn reassign_reason(target: &PeerDef) -> AssignReason {
    if target.primary {
        AssignReason::Priority
    } else {
        AssignReason::Failover
    }
}

impl ClusterContext {
    /// Obtains or confirms ownership of a guild for the peer the router
    /// elected. A live, reachable owner keeps the guild (sticky, no
    /// selection); a routing override transfers ownership to the
    /// handler; anything else selects a fresh owner. Returns `None`
    /// when no peer is selectable.
    pub(crate) async fn assign_guild(
        &self,
        guild_id: &str,
        handled_by: &PeerDef,
        now: DateTime<Utc>,
    ) -> Result<Option<AssignmentRecord>, String> {
        let existing = {
            let store = self.store.lock().await;
            match store.get_assignment(guild_id) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, guild_id, "assignment read failed; treating as absent");
                    None
                }
            }
        };
        let snapshots = self.peer_snapshots(now).await;
        let reachable =
            |id: &str| snapshots.iter().any(|s| s.id == id && s.health.is_reachable());

        if let Some(record) = &existing {
            if record.active && reachable(&record.owner_peer_id) {
                if record.owner_peer_id == handled_by.id {
                    let mut store = self.store.lock().await;
                    store.touch(guild_id, now)?;
                    return store.get_assignment(guild_id);
                }
                // The routing ladder elected a different peer (failover
                // or continuity); ownership follows the handler and the
                // old session drains on its own.
                let reason = reassign_reason(handled_by);
                tracing::info!(
                    guild_id,
                    from = %record.owner_peer_id,
                    to = %handled_by.id,
                    reason = reason.as_str(),
                    "assignment ownership transferred"
                );
                let mut store = self.store.lock().await;
                return store
                    .reassign(guild_id, &handled_by.id, &handled_by.external_id, reason, now)
                    .map(Some);
            }
        }

        let selector = SelectorConfig {
            max_sessions_per_peer: self.settings.max_sessions_per_peer,
        };
        let Some(picked) = select_peer(self.settings.strategy, &snapshots, &selector) else {
            return Ok(None);
        };
        let picked = match self.peer(&picked.id) {
            Some(def) => def,
            None => return Err(format!("selected peer {} is not configured", picked.id)),
        };
        let mut store = self.store.lock().await;
        let record = match existing {
            None => store.get_or_create_assignment(
                guild_id,
                &picked.id,
                &picked.external_id,
                AssignReason::Auto,
                now,
            )?,
            Some(prev) if prev.owner_peer_id == picked.id => {
                store.touch(guild_id, now)?;
                store.get_assignment(guild_id)?.unwrap_or(prev)
            }
            Some(_) => store.reassign(
                guild_id,
                &picked.id,
                &picked.external_id,
                reassign_reason(picked),
                now,
            )?,
        };
        Ok(Some(record))
    }

    /// Marks the session ended; the row survives for history and reuse.
    pub(crate) async fn release_guild(&self, guild_id: &str) -> Result<(), String> {
        let mut store = self.store.lock().await;
        store.deactivate(guild_id)
    }

    /// Administrative override. The target must exist and be reachable;
    /// a session still running on the previous owner drains naturally.
    pub async fn force_assign(
        &self,
        input: &ForceAssignRequest,
    ) -> Result<AssignmentRecord, ForceAssignError> {
        if input.v != CONTRACT_VERSION {
            return Err(ForceAssignError::Validation("v must be 1".to_string()));
        }
        if input.guild_id.is_empty() || input.peer_id.is_empty() {
            return Err(ForceAssignError::Validation(
                "guild_id and peer_id are required".to_string(),
            ));
        }
        let peer = self
            .peer(&input.peer_id)
            .ok_or_else(|| ForceAssignError::UnknownPeer(input.peer_id.clone()))?;
        let now = Utc::now();
        let snapshots = self.peer_snapshots(now).await;
        let healthy = snapshots
            .iter()
            .any(|s| s.id == peer.id && s.health.is_reachable());
        if !healthy {
            return Err(ForceAssignError::PeerUnreachable(peer.id.clone()));
        }
        tracing::info!(guild_id = %input.guild_id, peer_id = %peer.id, "manual assignment override");
        let mut store = self.store.lock().await;
        store
            .reassign(
                &input.guild_id,
                &peer.id,
                &peer.external_id,
                AssignReason::Manual,
                now,
            )
            .map_err(ForceAssignError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InProcessEngine, InProcessGateway};
    use chorus_config::{Balancer, Cluster, Config, Coordination, Health, PeerEntry, Server, Store};
    use std::sync::Arc;

    fn peer_entry(id: &str, primary: bool) -> PeerEntry {
        PeerEntry {
            id: id.to_string(),
            name: format!("{id}-name"),
            external_id: format!("ext-{id}"),
            primary,
        }
    }

    fn test_context() -> (ClusterContext, Arc<InProcessGateway>, Arc<InProcessEngine>) {
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
                    peer_entry("p1", true),
                    peer_entry("p2", false),
                    peer_entry("p3", false),
                ],
            },
            coordination: Coordination::default(),
            health: Health::default(),
            balancer: Balancer::default(),
        };
        let ctx = ClusterContext::from_config(
            &cfg,
            gateway.clone() as Arc<dyn crate::ChatGateway>,
            engine.clone() as Arc<dyn crate::MediaEngine>,
        )
        .expect("context");
        (ctx, gateway, engine)
    }

    fn peer_def(ctx: &ClusterContext, id: &str) -> PeerDef {
        ctx.peer(id).expect("configured peer").clone()
    }

    #[tokio::test]
    async fn new_guild_assignment_prefers_primary() {
        let (ctx, _gateway, _engine) = test_context();
        let handler = peer_def(&ctx, "p1");
        let record = ctx
            .assign_guild("g1", &handler, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.owner_peer_id, "p1");
        assert_eq!(record.reason, AssignReason::Auto);
        assert!(record.previous_owner_peer_id.is_none());
    }

    #[tokio::test]
    async fn active_healthy_owner_sticks_without_selection() {
        let (ctx, _gateway, _engine) = test_context();
        let now = Utc::now();
        {
            let mut store = ctx.store.lock().await;
            store
                .get_or_create_assignment("g1", "p2", "ext-p2", AssignReason::Auto, now)
                .unwrap();
            store.activate("g1", "c1", now).unwrap();
        }
        // Priority selection would return p1; stickiness must win.
        let handler = peer_def(&ctx, "p2");
        let record = ctx
            .assign_guild("g1", &handler, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.owner_peer_id, "p2");
        assert_eq!(record.reason, AssignReason::Auto);
    }

    #[tokio::test]
    async fn routing_override_transfers_ownership_to_handler() {
        let (ctx, _gateway, _engine) = test_context();
        let now = Utc::now();
        {
            let mut store = ctx.store.lock().await;
            store
                .get_or_create_assignment("g1", "p1", "ext-p1", AssignReason::Auto, now)
                .unwrap();
            store.activate("g1", "c1", now).unwrap();
        }
        let handler = peer_def(&ctx, "p2");
        let record = ctx
            .assign_guild("g1", &handler, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.owner_peer_id, "p2");
        assert_eq!(record.reason, AssignReason::Failover);
        assert_eq!(record.previous_owner_peer_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn inactive_owner_yields_fresh_selection() {
        let (ctx, _gateway, _engine) = test_context();
        let now = Utc::now();
        {
            let mut store = ctx.store.lock().await;
            store
                .get_or_create_assignment("g1", "p3", "ext-p3", AssignReason::Auto, now)
                .unwrap();
        }
        // Row exists but inactive: priority selection hands the guild to
        // the primary and records the transfer.
        let handler = peer_def(&ctx, "p1");
        let record = ctx
            .assign_guild("g1", &handler, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.owner_peer_id, "p1");
        assert_eq!(record.reason, AssignReason::Priority);
        assert_eq!(record.previous_owner_peer_id.as_deref(), Some("p3"));
    }

    #[tokio::test]
    async fn no_reachable_peer_yields_no_assignment() {
        let (ctx, gateway, _engine) = test_context();
        for id in ["p1", "p2", "p3"] {
            gateway.set_ready(id, false);
        }
        let handler = peer_def(&ctx, "p1");
        let record = ctx.assign_guild("g1", &handler, Utc::now()).await.unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn force_assign_rejects_unknown_and_unreachable_peers() {
        let (ctx, gateway, _engine) = test_context();
        let unknown = ForceAssignRequest {
            v: CONTRACT_VERSION,
            guild_id: "g1".to_string(),
            peer_id: "p9".to_string(),
        };
        assert!(matches!(
            ctx.force_assign(&unknown).await,
            Err(ForceAssignError::UnknownPeer(_))
        ));

        gateway.set_ready("p2", false);
        let unreachable = ForceAssignRequest {
            v: CONTRACT_VERSION,
            guild_id: "g1".to_string(),
            peer_id: "p2".to_string(),
        };
        assert!(matches!(
            ctx.force_assign(&unreachable).await,
            Err(ForceAssignError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn force_assign_records_manual_reason() {
        let (ctx, _gateway, _engine) = test_context();
        let request = ForceAssignRequest {
            v: CONTRACT_VERSION,
            guild_id: "g1".to_string(),
            peer_id: "p3".to_string(),
        };
        let record = ctx.force_assign(&request).await.unwrap();
        assert_eq!(record.owner_peer_id, "p3");
        assert_eq!(record.reason, AssignReason::Manual);
    }
}
