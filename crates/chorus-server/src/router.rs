use chorus_contracts::{
    AssignmentRecord, CommandClass, CommandEnvelope, CommandOutcome, PeerDecision,
    CONTRACT_VERSION,
};
use chorus_kernel::{decide_route, AssignmentView, RouteContext, RouteDecision, SecondaryView};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{ClusterContext, PeerDef};

/// Session-class ops that end a session instead of ensuring one.
const TEARDOWN_OPS: &[&str] = &["stop", "disconnect"];

fn validate_command(envelope: &CommandEnvelope) -> Result<(), String> {
    if envelope.v != CONTRACT_VERSION {
        return Err("v must be 1".to_string());
    }
    if envelope.command_id.is_empty() || envelope.guild_id.is_empty() || envelope.op.is_empty() {
        return Err("command_id, guild_id, op are required".to_string());
    }
    Ok(())
}

impl ClusterContext {
    /// Broadcast evaluation: every peer runs the routing ladder against
    /// the same advisory snapshot, exactly as the gateway delivers the
    /// command to each of them. At most one peer proceeds; the lock
    /// table is the only authoritative arbiter.
    pub async fn process_command(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<CommandOutcome, String> {
        validate_command(&envelope)?;
        let now = Utc::now();
        let trace_id = format!("route_{}", Uuid::new_v4().as_simple());
        let session_command = envelope.class == CommandClass::Session;
        let guild_id = envelope.guild_id.clone();

        let assignment_view = {
            let store = self.store.lock().await;
            match store.get_assignment(&guild_id) {
                Ok(record) => record.map(|r| AssignmentView {
                    owner_peer_id: r.owner_peer_id,
                    active: r.active,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, %guild_id, %trace_id, "assignment read failed; routing without it");
                    None
                }
            }
        };
        let primary_session = self
            .primary_peer()
            .and_then(|p| self.engine.session_channel(&p.id, &guild_id));
        let secondaries: Vec<SecondaryView> = self
            .peers
            .iter()
            .filter(|p| !p.primary)
            .map(|p| SecondaryView {
                id: p.id.clone(),
                session_channel: self.engine.session_channel(&p.id, &guild_id),
            })
            .collect();

        let mut decisions = Vec::with_capacity(self.peers.len());
        let mut handler: Option<&PeerDef> = None;
        for peer in &self.peers {
            let route_ctx = RouteContext {
                self_id: peer.id.clone(),
                self_primary: peer.primary,
                session_command,
                requester_channel: envelope.requester_channel.clone(),
                own_session_channel: self.engine.session_channel(&peer.id, &guild_id),
                primary_session_channel: primary_session.clone(),
                lock_held_by_other: self.locks.held_by_other(&guild_id, &peer.id),
                assignment: assignment_view.clone(),
                secondaries: secondaries.clone(),
            };
            let outcome = decide_route(&route_ctx);
            let (proceeds, reason_code) = match outcome.decision {
                RouteDecision::Handle => (true, "ok"),
                RouteDecision::HandleLockOptional => {
                    // Best effort: the primary proceeds either way.
                    let won = self.locks.acquire(&guild_id, &peer.id);
                    (true, if won { "ok" } else { "lock_unavailable" })
                }
                RouteDecision::HandleLockRequired => {
                    if self.locks.acquire(&guild_id, &peer.id) {
                        (true, "ok")
                    } else {
                        (false, "lock_race_lost")
                    }
                }
                RouteDecision::Defer(reason) => (false, reason.as_str()),
            };
            tracing::debug!(
                %trace_id,
                %guild_id,
                peer_id = %peer.id,
                rule = outcome.rule,
                proceeds,
                reason_code,
                "routing decision"
            );
            if proceeds && handler.is_none() {
                handler = Some(peer);
            }
            let outcome_label = if proceeds { "handled" } else { "deferred" };
            decisions.push(PeerDecision {
                peer_id: peer.id.clone(),
                rule: outcome.rule.to_string(),
                outcome: outcome_label.to_string(),
                reason_code: reason_code.to_string(),
            });
        }

        let Some(peer) = handler else {
            if session_command {
                // Intentional degraded behavior: every failover peer is
                // busy in some other channel, nobody acts on this event.
                tracing::warn!(
                    %trace_id,
                    %guild_id,
                    command_id = %envelope.command_id,
                    "no peer available for session command; dropping"
                );
            }
            return Ok(CommandOutcome {
                command_id: envelope.command_id,
                guild_id,
                trace_id,
                handled_by: None,
                reason_code: "no_peer_available".to_string(),
                assignment: None,
                decisions,
            });
        };

        let (reason_code, assignment) = if !session_command {
            ("handled".to_string(), None)
        } else if TEARDOWN_OPS.contains(&envelope.op.as_str()) {
            let record = self.teardown_session(peer, &guild_id).await;
            ("session_released".to_string(), record)
        } else {
            self.ensure_session(peer, &envelope, now).await
        };

        Ok(CommandOutcome {
            command_id: envelope.command_id,
            guild_id,
            trace_id,
            handled_by: Some(peer.id.clone()),
            reason_code,
            assignment,
            decisions,
        })
    }

    /// Confirms ownership, then positions the owner's session in the
    /// requester's channel. A failed create unwinds before returning so
    /// no active record points at a session that never came up.
    async fn ensure_session(
        &self,
        handler: &PeerDef,
        envelope: &CommandEnvelope,
        now: DateTime<Utc>,
    ) -> (String, Option<AssignmentRecord>) {
        let guild_id = envelope.guild_id.as_str();
        let assignment = match self.assign_guild(guild_id, handler, now).await {
            Ok(Some(record)) => record,
            Ok(None) => return ("no_capacity".to_string(), None),
            Err(e) => {
                tracing::warn!(error = %e, guild_id, "assignment write failed; command not applied");
                return ("store_error".to_string(), None);
            }
        };
        let owner = assignment.owner_peer_id.clone();

        let Some(channel) = envelope.requester_channel.as_deref() else {
            // Nothing to position against; an existing session keeps
            // playing wherever it is.
            if self.engine.session_channel(&owner, guild_id).is_some() {
                return ("handled".to_string(), Some(assignment));
            }
            return ("no_requester_channel".to_string(), Some(assignment));
        };

        if self.engine.session_channel(&owner, guild_id).as_deref() == Some(channel) {
            return ("handled".to_string(), Some(assignment));
        }

        if let Err(e) = self.engine.create_session(&owner, guild_id, channel) {
            tracing::warn!(error = %e, guild_id, peer_id = %owner, "session create failed; unwinding");
            self.engine.destroy_session(&owner, guild_id);
            if let Err(e) = self.release_guild(guild_id).await {
                tracing::warn!(error = %e, guild_id, "assignment deactivate failed during unwind");
            }
            return ("session_create_failed".to_string(), None);
        }

        let record = {
            let mut store = self.store.lock().await;
            if let Err(e) = store.activate(guild_id, channel, now) {
                tracing::warn!(error = %e, guild_id, "assignment activate failed; retrying on next command");
            }
            store.get_assignment(guild_id).ok().flatten()
        };
        ("handled".to_string(), record.or(Some(assignment)))
    }

    /// One scoped teardown: every step runs even when an earlier one
    /// fails, so a dead session never leaves an active record or a held
    /// lock behind.
    async fn teardown_session(
        &self,
        handler: &PeerDef,
        guild_id: &str,
    ) -> Option<AssignmentRecord> {
        let owner = {
            let store = self.store.lock().await;
            match store.get_assignment(guild_id) {
                Ok(Some(record)) => record.owner_peer_id,
                Ok(None) => handler.id.clone(),
                Err(e) => {
                    tracing::warn!(error = %e, guild_id, "assignment read failed during teardown");
                    handler.id.clone()
                }
            }
        };
        self.engine.destroy_session(&owner, guild_id);
        if owner != handler.id {
            self.engine.destroy_session(&handler.id, guild_id);
        }
        if let Err(e) = self.release_guild(guild_id).await {
            tracing::warn!(error = %e, guild_id, "assignment deactivate failed during teardown");
        }
        self.locks.release(guild_id, &handler.id);
        if owner != handler.id {
            self.locks.release(guild_id, &owner);
        }
        let store = self.store.lock().await;
        store.get_assignment(guild_id).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(op: &str, class: CommandClass) -> CommandEnvelope {
        CommandEnvelope {
            v: CONTRACT_VERSION,
            command_id: "cmd-1".to_string(),
            guild_id: "g1".to_string(),
            op: op.to_string(),
            class,
            requester_channel: None,
        }
    }

    #[test]
    fn validate_command_rejects_bad_version_and_missing_fields() {
        let mut bad_version = envelope("play", CommandClass::Session);
        bad_version.v = 2;
        assert!(validate_command(&bad_version).is_err());

        let mut empty_guild = envelope("play", CommandClass::Session);
        empty_guild.guild_id.clear();
        assert!(validate_command(&empty_guild).is_err());

        assert!(validate_command(&envelope("play", CommandClass::Session)).is_ok());
    }

    #[test]
    fn teardown_ops_cover_stop_and_disconnect() {
        assert!(TEARDOWN_OPS.contains(&"stop"));
        assert!(TEARDOWN_OPS.contains(&"disconnect"));
        assert!(!TEARDOWN_OPS.contains(&"play"));
    }
}
