mod balancer;
mod engine;
mod health;
mod locks;
mod router;
mod store;

pub use balancer::ForceAssignError;
pub use engine::{ChatGateway, InProcessEngine, InProcessGateway, MediaEngine};
pub use health::HealthMonitor;
pub use locks::{GuildLocks, MemoryLockTable};
pub use store::{MemoryStore, SqliteStore, StoreBackend};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chorus_config::Config;
use chorus_contracts::{
    AssignmentRecord, ClusterStats, CommandEnvelope, CommandOutcome, ErrorBody, ErrorResponse,
    ForceAssignRequest, PeerHealth, PeerStatsRow,
};
use chorus_kernel::{effective_health, parse_rfc3339, PeerSnapshot, Strategy};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let state = AppState::new(
        cfg,
        Arc::new(InProcessGateway::default()),
        Arc::new(InProcessEngine::default()),
    )?;
    tokio::spawn(HealthMonitor::new(state.clone()).run());
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(listen_addr = %addr, "chorus coordinator serving");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

/// App without the health-monitor timer, for driving requests directly.
pub async fn build_app(cfg: Config) -> Result<Router, String> {
    build_app_with(
        cfg,
        Arc::new(InProcessGateway::default()),
        Arc::new(InProcessEngine::default()),
    )
    .await
}

pub async fn build_app_with(
    cfg: Config,
    gateway: Arc<dyn ChatGateway>,
    engine: Arc<dyn MediaEngine>,
) -> Result<Router, String> {
    Ok(app_router(AppState::new(cfg, gateway, engine)?))
}

fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/commands", post(commands))
        .route("/v1/assignments/force", post(force_assign))
        .route("/v1/stats", get(stats))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<ClusterContext>,
}

impl AppState {
    pub fn new(
        cfg: Config,
        gateway: Arc<dyn ChatGateway>,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<Self, String> {
        Ok(Self {
            ctx: Arc::new(ClusterContext::from_config(&cfg, gateway, engine)?),
        })
    }
}

/// One configured worker peer.
#[derive(Debug, Clone)]
pub struct PeerDef {
    pub id: String,
    pub name: String,
    pub external_id: String,
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub lock_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub inactivity_threshold_ms: u64,
    pub max_sessions_per_peer: u32,
    pub strategy: Strategy,
}

/// Everything the components share, built once at startup and passed
/// around explicitly so tests can stand up isolated clusters.
pub struct ClusterContext {
    /// Ascending peer id; the order failover election relies on.
    pub(crate) peers: Vec<PeerDef>,
    pub(crate) locks: Arc<dyn GuildLocks>,
    pub(crate) store: Mutex<StoreBackend>,
    pub(crate) gateway: Arc<dyn ChatGateway>,
    pub(crate) engine: Arc<dyn MediaEngine>,
    pub(crate) settings: RuntimeSettings,
}

impl ClusterContext {
    pub fn from_config(
        cfg: &Config,
        gateway: Arc<dyn ChatGateway>,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };

        let mut peers: Vec<PeerDef> = cfg
            .cluster
            .peers
            .iter()
            .map(|p| PeerDef {
                id: p.id.clone(),
                name: p.name.clone(),
                external_id: p.external_id.clone(),
                primary: p.primary,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        if peers.is_empty() {
            return Err("cluster.peers must list at least one peer".to_string());
        }
        if peers.iter().filter(|p| p.primary).count() != 1 {
            return Err("cluster.peers must designate exactly one primary peer".to_string());
        }

        let strategy = Strategy::from_name(&cfg.balancer.strategy)
            .ok_or_else(|| format!("unsupported balancer.strategy {}", cfg.balancer.strategy))?;

        let settings = RuntimeSettings {
            lock_timeout_ms: cfg.coordination.lock_timeout_ms,
            tick_interval_ms: cfg.health.tick_interval_ms,
            stale_threshold_ms: cfg.health.stale_threshold_ms,
            inactivity_threshold_ms: cfg.balancer.inactivity_threshold_ms,
            max_sessions_per_peer: cfg.balancer.max_sessions_per_peer,
            strategy,
        };

        Ok(Self {
            peers,
            locks: Arc::new(MemoryLockTable::new(std::time::Duration::from_millis(
                settings.lock_timeout_ms,
            ))),
            store: Mutex::new(store),
            gateway,
            engine,
            settings,
        })
    }

    pub(crate) fn primary_peer(&self) -> Option<&PeerDef> {
        self.peers.iter().find(|p| p.primary)
    }

    pub(crate) fn peer(&self, peer_id: &str) -> Option<&PeerDef> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    /// Status and load from live signals: gateway readiness and the
    /// engine's session count for the peer.
    pub(crate) fn live_status(&self, peer_id: &str) -> (PeerHealth, u32) {
        let load = self.engine.session_count(peer_id) as u32;
        let status = if !self.gateway.is_ready(peer_id) {
            PeerHealth::Offline
        } else if load >= self.settings.max_sessions_per_peer {
            PeerHealth::InUse
        } else {
            PeerHealth::Available
        };
        (status, load)
    }

    /// Advisory view of every peer. Live signals are combined with the
    /// persisted heartbeat: a peer whose last heartbeat write is stale
    /// reads as `Offline` no matter what the live signals claim.
    pub(crate) async fn peer_snapshots(&self, now: DateTime<Utc>) -> Vec<PeerSnapshot> {
        let heartbeats = {
            let store = self.store.lock().await;
            match store.peer_statuses() {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(error = %e, "peer status read failed; using live signals only");
                    Vec::new()
                }
            }
        };
        let stale_after = chrono::Duration::milliseconds(self.settings.stale_threshold_ms as i64);
        self.peers
            .iter()
            .map(|peer| {
                let (status, load) = self.live_status(&peer.id);
                let heartbeat = heartbeats
                    .iter()
                    .find(|r| r.peer_id == peer.id)
                    .and_then(|r| parse_rfc3339(&r.last_heartbeat));
                PeerSnapshot {
                    id: peer.id.clone(),
                    name: peer.name.clone(),
                    primary: peer.primary,
                    health: effective_health(status, heartbeat, now, stale_after),
                    load,
                }
            })
            .collect()
    }

    pub async fn cluster_stats(&self) -> Result<ClusterStats, String> {
        let snapshots = self.peer_snapshots(Utc::now()).await;
        let (active_assignments, tracked_guilds) = {
            let store = self.store.lock().await;
            (
                store.active_assignment_count()?,
                store.assignment_count()?,
            )
        };
        let peers: Vec<PeerStatsRow> = snapshots
            .iter()
            .map(|s| PeerStatsRow {
                peer_id: s.id.clone(),
                name: s.name.clone(),
                primary: s.primary,
                status: s.health,
                load: s.load,
            })
            .collect();
        Ok(ClusterStats {
            peers_total: snapshots.len(),
            peers_available: snapshots
                .iter()
                .filter(|s| s.health == PeerHealth::Available)
                .count(),
            peers_offline: snapshots
                .iter()
                .filter(|s| s.health == PeerHealth::Offline)
                .count(),
            active_sessions: snapshots.iter().map(|s| s.load as usize).sum(),
            active_assignments,
            tracked_guilds,
            peers,
        })
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

fn error_body(code: &str, message: String) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: ErrorBody {
            code: code.to_string(),
            message,
        },
    })
}

async fn commands(
    State(state): State<AppState>,
    Json(envelope): Json<CommandEnvelope>,
) -> Result<Json<CommandOutcome>, (StatusCode, Json<ErrorResponse>)> {
    state
        .ctx
        .process_command(envelope)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, error_body("validation_error", e)))
}

async fn force_assign(
    State(state): State<AppState>,
    Json(input): Json<ForceAssignRequest>,
) -> Result<Json<AssignmentRecord>, (StatusCode, Json<ErrorResponse>)> {
    match state.ctx.force_assign(&input).await {
        Ok(record) => Ok(Json(record)),
        Err(ForceAssignError::Validation(message)) => Err((
            StatusCode::BAD_REQUEST,
            error_body("validation_error", message),
        )),
        Err(ForceAssignError::UnknownPeer(peer_id)) => Err((
            StatusCode::NOT_FOUND,
            error_body(
                "unknown_peer",
                format!("peer {peer_id} is not part of the cluster"),
            ),
        )),
        Err(ForceAssignError::PeerUnreachable(peer_id)) => Err((
            StatusCode::CONFLICT,
            error_body("peer_unreachable", format!("peer {peer_id} is not healthy")),
        )),
        Err(ForceAssignError::Store(message)) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("store_error", message),
        )),
    }
}

async fn stats(
    State(state): State<AppState>,
) -> Result<Json<ClusterStats>, (StatusCode, Json<ErrorResponse>)> {
    state
        .ctx
        .cluster_stats()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, error_body("store_error", e)))
}
