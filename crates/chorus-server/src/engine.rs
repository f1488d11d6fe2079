use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

/// Chat-platform connection facts the coordinator needs about a peer.
pub trait ChatGateway: Send + Sync {
    fn is_ready(&self, peer_id: &str) -> bool;
}

/// Voice-session lifecycle bookkeeping. Media decoding and streaming
/// live behind this boundary; the coordinator only tracks which peer
/// sits in which channel for which guild.
pub trait MediaEngine: Send + Sync {
    fn create_session(&self, peer_id: &str, guild_id: &str, channel: &str) -> Result<(), String>;
    fn destroy_session(&self, peer_id: &str, guild_id: &str);
    fn session_channel(&self, peer_id: &str, guild_id: &str) -> Option<String>;
    /// Active-session count for the peer across all guilds.
    fn session_count(&self, peer_id: &str) -> usize;
}

/// Every peer is ready unless explicitly marked otherwise. Production
/// wiring flips readiness from gateway connection events; tests flip it
/// directly.
#[derive(Default)]
pub struct InProcessGateway {
    not_ready: Mutex<HashSet<String>>,
}

impl InProcessGateway {
    pub fn set_ready(&self, peer_id: &str, ready: bool) {
        let mut not_ready = self
            .not_ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if ready {
            not_ready.remove(peer_id);
        } else {
            not_ready.insert(peer_id.to_string());
        }
    }
}

impl ChatGateway for InProcessGateway {
    fn is_ready(&self, peer_id: &str) -> bool {
        !self
            .not_ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer_id)
    }
}

/// Session table keyed by (peer, guild). One session per guild per peer;
/// creating again moves the session to the new channel.
#[derive(Default)]
pub struct InProcessEngine {
    sessions: Mutex<HashMap<(String, String), String>>,
    fail_creates: Mutex<bool>,
}

impl InProcessEngine {
    /// Makes subsequent `create_session` calls fail, for driving the
    /// unwind path in tests.
    pub fn set_fail_creates(&self, fail: bool) {
        *self
            .fail_creates
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = fail;
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), String>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MediaEngine for InProcessEngine {
    fn create_session(&self, peer_id: &str, guild_id: &str, channel: &str) -> Result<(), String> {
        if *self
            .fail_creates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err("voice connect refused".to_string());
        }
        self.sessions().insert(
            (peer_id.to_string(), guild_id.to_string()),
            channel.to_string(),
        );
        Ok(())
    }

    fn destroy_session(&self, peer_id: &str, guild_id: &str) {
        self.sessions()
            .remove(&(peer_id.to_string(), guild_id.to_string()));
    }

    fn session_channel(&self, peer_id: &str, guild_id: &str) -> Option<String> {
        self.sessions()
            .get(&(peer_id.to_string(), guild_id.to_string()))
            .cloned()
    }

    fn session_count(&self, peer_id: &str) -> usize {
        self.sessions()
            .keys()
            .filter(|(peer, _)| peer == peer_id)
            .count()
    }
}
