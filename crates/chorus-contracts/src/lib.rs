use serde::{Deserialize, Serialize};

pub const CONTRACT_VERSION: u32 = 1;

/// Self-reported status of one worker peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeerHealth {
    Available,
    InUse,
    Offline,
    Starting,
    Error,
}

impl PeerHealth {
    /// A reachable peer may own assignments and receive new sessions.
    /// `InUse` stays reachable: capacity is a soft limit, selection
    /// degrades to the least-loaded peer instead of refusing service.
    pub fn is_reachable(self) -> bool {
        matches!(self, PeerHealth::Available | PeerHealth::InUse)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerHealth::Available => "available",
            PeerHealth::InUse => "in_use",
            PeerHealth::Offline => "offline",
            PeerHealth::Starting => "starting",
            PeerHealth::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "available" => Some(PeerHealth::Available),
            "in_use" => Some(PeerHealth::InUse),
            "offline" => Some(PeerHealth::Offline),
            "starting" => Some(PeerHealth::Starting),
            "error" => Some(PeerHealth::Error),
            _ => None,
        }
    }
}

/// Why an assignment row points at its current owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignReason {
    Auto,
    Manual,
    Failover,
    Priority,
}

impl AssignReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignReason::Auto => "auto",
            AssignReason::Manual => "manual",
            AssignReason::Failover => "failover",
            AssignReason::Priority => "priority",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "auto" => Some(AssignReason::Auto),
            "manual" => Some(AssignReason::Manual),
            "failover" => Some(AssignReason::Failover),
            "priority" => Some(AssignReason::Priority),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    /// Requires session ownership; subject to the full routing ladder.
    Session,
    /// Answered by the primary peer unconditionally.
    General,
}

/// One inbound command as extracted from the raw gateway event. The
/// gateway delivers every command to every peer; the envelope carries
/// just the fields routing needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEnvelope {
    pub v: u32,
    pub command_id: String,
    pub guild_id: String,
    pub op: String,
    pub class: CommandClass,
    /// Voice channel the requester currently sits in, if any.
    #[serde(default)]
    pub requester_channel: Option<String>,
}

/// Durable record of which peer owns a guild. Never hard-deleted, only
/// deactivated, so failover history and row reuse survive session churn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentRecord {
    pub guild_id: String,
    pub owner_peer_id: String,
    pub owner_external_id: String,
    pub active: bool,
    #[serde(default)]
    pub session_channel: Option<String>,
    /// RFC3339 timestamp of the last activity touch.
    pub last_activity: String,
    pub reason: AssignReason,
    #[serde(default)]
    pub previous_owner_peer_id: Option<String>,
}

/// Heartbeat row persisted by the health monitor each tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerStatusRecord {
    pub peer_id: String,
    pub status: PeerHealth,
    pub load: u32,
    /// RFC3339 timestamp of the last successful heartbeat write.
    pub last_heartbeat: String,
}

/// Per-peer routing verdict for one command, reported for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDecision {
    pub peer_id: String,
    pub rule: String,
    pub outcome: String,
    pub reason_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command_id: String,
    pub guild_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub handled_by: Option<String>,
    pub reason_code: String,
    #[serde(default)]
    pub assignment: Option<AssignmentRecord>,
    pub decisions: Vec<PeerDecision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForceAssignRequest {
    pub v: u32,
    pub guild_id: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatsRow {
    pub peer_id: String,
    pub name: String,
    pub primary: bool,
    pub status: PeerHealth,
    pub load: u32,
}

/// Aggregate counts exposed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub peers_total: usize,
    pub peers_available: usize,
    pub peers_offline: usize,
    pub active_sessions: usize,
    pub active_assignments: usize,
    pub tracked_guilds: usize,
    pub peers: Vec<PeerStatsRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_envelope_defaults_optional_fields() {
        let envelope: CommandEnvelope = serde_json::from_value(json!({
            "v": 1,
            "command_id": "cmd-1",
            "guild_id": "guild-1",
            "op": "queue",
            "class": "general"
        }))
        .unwrap();
        assert_eq!(envelope.class, CommandClass::General);
        assert!(envelope.requester_channel.is_none());
    }

    #[test]
    fn command_envelope_rejects_unknown_fields() {
        let result: Result<CommandEnvelope, _> = serde_json::from_value(json!({
            "v": 1,
            "command_id": "cmd-1",
            "guild_id": "guild-1",
            "op": "play",
            "class": "session",
            "shard": 3
        }));
        assert!(result.is_err());
    }

    #[test]
    fn peer_health_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(PeerHealth::InUse).unwrap(),
            json!("in_use")
        );
        assert_eq!(PeerHealth::from_name("in_use"), Some(PeerHealth::InUse));
    }

    #[test]
    fn reachable_covers_available_and_in_use_only() {
        assert!(PeerHealth::Available.is_reachable());
        assert!(PeerHealth::InUse.is_reachable());
        assert!(!PeerHealth::Offline.is_reachable());
        assert!(!PeerHealth::Starting.is_reachable());
        assert!(!PeerHealth::Error.is_reachable());
    }

    #[test]
    fn assign_reason_round_trips_by_name() {
        for reason in [
            AssignReason::Auto,
            AssignReason::Manual,
            AssignReason::Failover,
            AssignReason::Priority,
        ] {
            assert_eq!(AssignReason::from_name(reason.as_str()), Some(reason));
        }
        assert_eq!(AssignReason::from_name("sticky"), None);
    }
}
