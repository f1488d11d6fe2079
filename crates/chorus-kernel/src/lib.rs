//! Pure decision logic: the per-command routing ladder, peer selection,
//! and health staleness. No I/O, no clocks; every function works on a
//! snapshot the caller assembled, so each rule is testable in isolation
//! and every peer evaluating the same snapshot reaches the same verdict.

use chorus_contracts::PeerHealth;
use chrono::{DateTime, Duration, Utc};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

/// A heartbeat older than `stale_after` means the reporter may be hung.
pub fn is_stale(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    now - last_heartbeat > stale_after
}

/// Status as readers must treat it: a stale heartbeat forces `Offline`
/// no matter what the peer last reported about itself.
pub fn effective_health(
    reported: PeerHealth,
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> PeerHealth {
    match last_heartbeat {
        Some(ts) if is_stale(ts, now, stale_after) => PeerHealth::Offline,
        _ => reported,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Primary first, then ascending load; first peer under capacity.
    Priority,
    /// Ascending load only. Evens load out instead of rotating strictly.
    LeastLoaded,
}

impl Strategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "priority" => Some(Strategy::Priority),
            "least_loaded" => Some(Strategy::LeastLoaded),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Priority => "priority",
            Strategy::LeastLoaded => "least_loaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: String,
    pub name: String,
    pub primary: bool,
    pub health: PeerHealth,
    pub load: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    pub max_sessions_per_peer: u32,
}

/// Picks the peer that should own a fresh assignment, or `None` when no
/// peer is reachable. Ties break on ascending peer id so independent
/// evaluations agree.
pub fn select_peer<'a>(
    strategy: Strategy,
    peers: &'a [PeerSnapshot],
    cfg: &SelectorConfig,
) -> Option<&'a PeerSnapshot> {
    let mut reachable: Vec<&PeerSnapshot> =
        peers.iter().filter(|p| p.health.is_reachable()).collect();
    if reachable.is_empty() {
        return None;
    }
    match strategy {
        Strategy::Priority => {
            reachable.sort_by(|a, b| {
                b.primary
                    .cmp(&a.primary)
                    .then(a.load.cmp(&b.load))
                    .then(a.id.cmp(&b.id))
            });
            if let Some(p) = reachable
                .iter()
                .copied()
                .find(|p| p.load < cfg.max_sessions_per_peer)
            {
                return Some(p);
            }
            // Every reachable peer is at capacity: availability beats
            // strict capacity enforcement, hand out the least-loaded one.
            reachable
                .into_iter()
                .min_by(|a, b| a.load.cmp(&b.load).then(a.id.cmp(&b.id)))
        }
        Strategy::LeastLoaded => {
            reachable.sort_by(|a, b| a.load.cmp(&b.load).then(a.id.cmp(&b.id)));
            reachable.first().copied()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    GeneralNotPrimary,
    BusyElsewhere,
    OwnedByOtherPeer,
    LockHeldByOther,
    PrimaryCanHandle,
    AnotherPeerPreferred,
    NoPeerAvailable,
    NoUsableSignal,
}

impl DeferReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeferReason::GeneralNotPrimary => "general_not_primary",
            DeferReason::BusyElsewhere => "busy_elsewhere",
            DeferReason::OwnedByOtherPeer => "owned_by_other_peer",
            DeferReason::LockHeldByOther => "lock_held_by_other",
            DeferReason::PrimaryCanHandle => "primary_can_handle",
            DeferReason::AnotherPeerPreferred => "another_peer_preferred",
            DeferReason::NoPeerAvailable => "no_peer_available",
            DeferReason::NoUsableSignal => "no_usable_signal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Proceed without touching the lock table.
    Handle,
    /// Claim the guild lock best-effort; proceed either way.
    HandleLockOptional,
    /// Proceed only after winning the guild lock; losing the race defers.
    HandleLockRequired,
    Defer(DeferReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentView {
    pub owner_peer_id: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryView {
    pub id: String,
    /// This secondary's session channel for the guild, if it runs one.
    pub session_channel: Option<String>,
}

/// Everything one peer knows when it decides whether to act on a
/// command. Assignment and session reads are advisory; only the lock
/// acquisition that may follow the decision is authoritative.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub self_id: String,
    pub self_primary: bool,
    pub session_command: bool,
    pub requester_channel: Option<String>,
    /// This peer's own session channel for the guild, if any.
    pub own_session_channel: Option<String>,
    /// The primary peer's session channel for the guild, if any.
    pub primary_session_channel: Option<String>,
    pub lock_held_by_other: bool,
    pub assignment: Option<AssignmentView>,
    /// All non-primary peers in ascending id order.
    pub secondaries: Vec<SecondaryView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    pub rule: &'static str,
    pub decision: RouteDecision,
}

fn session_elsewhere(session: Option<&str>, requester: Option<&str>) -> bool {
    match session {
        Some(channel) => requester != Some(channel),
        None => false,
    }
}

fn available_for(requester: &str, session: Option<&str>) -> bool {
    match session {
        None => true,
        Some(channel) => channel == requester,
    }
}

fn primary_general(ctx: &RouteContext) -> Option<RouteDecision> {
    if ctx.self_primary && !ctx.session_command {
        return Some(RouteDecision::Handle);
    }
    None
}

fn primary_busy_elsewhere(ctx: &RouteContext) -> Option<RouteDecision> {
    if ctx.self_primary
        && ctx.session_command
        && session_elsewhere(
            ctx.own_session_channel.as_deref(),
            ctx.requester_channel.as_deref(),
        )
    {
        return Some(RouteDecision::Defer(DeferReason::BusyElsewhere));
    }
    None
}

fn primary_defers_to_owner(ctx: &RouteContext) -> Option<RouteDecision> {
    if ctx.self_primary && ctx.session_command {
        if let Some(assignment) = &ctx.assignment {
            if assignment.active && assignment.owner_peer_id != ctx.self_id {
                return Some(RouteDecision::Defer(DeferReason::OwnedByOtherPeer));
            }
        }
    }
    None
}

fn primary_session_fallback(ctx: &RouteContext) -> Option<RouteDecision> {
    if ctx.self_primary && ctx.session_command {
        return Some(RouteDecision::HandleLockOptional);
    }
    None
}

fn secondary_ignores_general(ctx: &RouteContext) -> Option<RouteDecision> {
    if !ctx.self_primary && !ctx.session_command {
        return Some(RouteDecision::Defer(DeferReason::GeneralNotPrimary));
    }
    None
}

fn lock_held_elsewhere(ctx: &RouteContext) -> Option<RouteDecision> {
    if !ctx.self_primary && ctx.session_command && ctx.lock_held_by_other {
        return Some(RouteDecision::Defer(DeferReason::LockHeldByOther));
    }
    None
}

fn own_session_continuity(ctx: &RouteContext) -> Option<RouteDecision> {
    if !ctx.self_primary && ctx.session_command {
        if let (Some(own), Some(requester)) =
            (&ctx.own_session_channel, &ctx.requester_channel)
        {
            if own == requester {
                return Some(RouteDecision::HandleLockRequired);
            }
        }
    }
    None
}

fn owned_by_self(ctx: &RouteContext) -> Option<RouteDecision> {
    if !ctx.self_primary && ctx.session_command {
        if let Some(assignment) = &ctx.assignment {
            if assignment.active && assignment.owner_peer_id == ctx.self_id {
                return Some(RouteDecision::HandleLockRequired);
            }
        }
    }
    None
}

fn no_requester_signal(ctx: &RouteContext) -> Option<RouteDecision> {
    if !ctx.self_primary && ctx.session_command && ctx.requester_channel.is_none() {
        return Some(RouteDecision::Defer(DeferReason::NoUsableSignal));
    }
    None
}

fn failover_election(ctx: &RouteContext) -> Option<RouteDecision> {
    if ctx.self_primary || !ctx.session_command {
        return None;
    }
    let requester = ctx.requester_channel.as_deref()?;
    if !session_elsewhere(ctx.primary_session_channel.as_deref(), Some(requester)) {
        return Some(RouteDecision::Defer(DeferReason::PrimaryCanHandle));
    }
    match ctx
        .secondaries
        .iter()
        .find(|s| available_for(requester, s.session_channel.as_deref()))
    {
        Some(first) if first.id == ctx.self_id => Some(RouteDecision::HandleLockRequired),
        Some(_) => Some(RouteDecision::Defer(DeferReason::AnotherPeerPreferred)),
        None => Some(RouteDecision::Defer(DeferReason::NoPeerAvailable)),
    }
}

struct Rule {
    name: &'static str,
    eval: fn(&RouteContext) -> Option<RouteDecision>,
}

// Order matters: each rule assumes the ones before it did not match.
const RULES: &[Rule] = &[
    Rule {
        name: "primary_general",
        eval: primary_general,
    },
    Rule {
        name: "primary_busy_elsewhere",
        eval: primary_busy_elsewhere,
    },
    Rule {
        name: "primary_defers_to_owner",
        eval: primary_defers_to_owner,
    },
    Rule {
        name: "primary_session_fallback",
        eval: primary_session_fallback,
    },
    Rule {
        name: "secondary_ignores_general",
        eval: secondary_ignores_general,
    },
    Rule {
        name: "lock_held_elsewhere",
        eval: lock_held_elsewhere,
    },
    Rule {
        name: "own_session_continuity",
        eval: own_session_continuity,
    },
    Rule {
        name: "owned_by_self",
        eval: owned_by_self,
    },
    Rule {
        name: "no_requester_signal",
        eval: no_requester_signal,
    },
    Rule {
        name: "failover_election",
        eval: failover_election,
    },
];

/// Walks the rule ladder; the first matching rule wins.
pub fn decide_route(ctx: &RouteContext) -> RouteOutcome {
    for rule in RULES {
        if let Some(decision) = (rule.eval)(ctx) {
            return RouteOutcome {
                rule: rule.name,
                decision,
            };
        }
    }
    RouteOutcome {
        rule: "unroutable",
        decision: RouteDecision::Defer(DeferReason::NoUsableSignal),
    }
}
