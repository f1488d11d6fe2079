use chorus_contracts::{AssignReason, AssignmentRecord, PeerHealth, PeerStatusRecord};
use chorus_kernel::parse_rfc3339;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

/// Durable records behind the coordinator: one assignment row per guild
/// plus the per-peer heartbeat rows. Every mutation targets a single
/// row, so any transactional store satisfies the contract; the bundled
/// backends are an in-memory map and sqlite.
pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
pub struct MemoryStore {
    assignments: HashMap<String, AssignmentRecord>,
    peer_status: HashMap<String, PeerStatusRecord>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl StoreBackend {
    pub fn get_assignment(&self, guild_id: &str) -> Result<Option<AssignmentRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.assignments.get(guild_id).cloned()),
            StoreBackend::Sqlite(store) => store.get_assignment(guild_id),
        }
    }

    /// Idempotent: an existing row is returned unchanged, so `reason`
    /// only sticks at creation time.
    pub fn get_or_create_assignment(
        &mut self,
        guild_id: &str,
        peer_id: &str,
        external_id: &str,
        reason: AssignReason,
        now: DateTime<Utc>,
    ) -> Result<AssignmentRecord, String> {
        if let Some(existing) = self.get_assignment(guild_id)? {
            return Ok(existing);
        }
        let record = AssignmentRecord {
            guild_id: guild_id.to_string(),
            owner_peer_id: peer_id.to_string(),
            owner_external_id: external_id.to_string(),
            active: false,
            session_channel: None,
            last_activity: now.to_rfc3339(),
            reason,
            previous_owner_peer_id: None,
        };
        match self {
            StoreBackend::Memory(store) => {
                store
                    .assignments
                    .insert(guild_id.to_string(), record.clone());
                Ok(record)
            }
            StoreBackend::Sqlite(store) => {
                store.insert_assignment(&record)?;
                Ok(record)
            }
        }
    }

    /// The only path that changes ownership of an existing row. Always
    /// succeeds; the prior owner lands in `previous_owner_peer_id`. The
    /// active flag and channel are left alone so an old session keeps
    /// draining while new commands route to the new owner.
    pub fn reassign(
        &mut self,
        guild_id: &str,
        new_peer_id: &str,
        external_id: &str,
        reason: AssignReason,
        now: DateTime<Utc>,
    ) -> Result<AssignmentRecord, String> {
        let record = match self.get_assignment(guild_id)? {
            Some(prev) => AssignmentRecord {
                guild_id: guild_id.to_string(),
                owner_peer_id: new_peer_id.to_string(),
                owner_external_id: external_id.to_string(),
                active: prev.active,
                session_channel: prev.session_channel.clone(),
                last_activity: now.to_rfc3339(),
                reason,
                previous_owner_peer_id: Some(prev.owner_peer_id),
            },
            None => AssignmentRecord {
                guild_id: guild_id.to_string(),
                owner_peer_id: new_peer_id.to_string(),
                owner_external_id: external_id.to_string(),
                active: false,
                session_channel: None,
                last_activity: now.to_rfc3339(),
                reason,
                previous_owner_peer_id: None,
            },
        };
        match self {
            StoreBackend::Memory(store) => {
                store
                    .assignments
                    .insert(guild_id.to_string(), record.clone());
                Ok(record)
            }
            StoreBackend::Sqlite(store) => {
                store.upsert_assignment(&record)?;
                Ok(record)
            }
        }
    }

    pub fn activate(
        &mut self,
        guild_id: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                if let Some(record) = store.assignments.get_mut(guild_id) {
                    record.active = true;
                    record.session_channel = Some(channel.to_string());
                    record.last_activity = now.to_rfc3339();
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.activate(guild_id, channel, now),
        }
    }

    pub fn deactivate(&mut self, guild_id: &str) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                if let Some(record) = store.assignments.get_mut(guild_id) {
                    record.active = false;
                    record.session_channel = None;
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.deactivate(guild_id),
        }
    }

    /// Refreshes `last_activity` and nothing else; keeps a live
    /// assignment out of the stale sweep.
    pub fn touch(&mut self, guild_id: &str, now: DateTime<Utc>) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                if let Some(record) = store.assignments.get_mut(guild_id) {
                    record.last_activity = now.to_rfc3339();
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.touch(guild_id, now),
        }
    }

    /// Deactivates active rows whose last activity is older than
    /// `threshold`. Ownership and row history stay untouched, so a fresh
    /// selection can happen on the next command. Idempotent.
    pub fn release_stale(
        &mut self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, String> {
        match self {
            StoreBackend::Memory(store) => {
                let mut swept = 0;
                for record in store.assignments.values_mut() {
                    if record.active && activity_is_stale(&record.last_activity, threshold, now) {
                        record.active = false;
                        record.session_channel = None;
                        swept += 1;
                    }
                }
                Ok(swept)
            }
            StoreBackend::Sqlite(store) => store.release_stale(threshold, now),
        }
    }

    pub fn upsert_peer_status(&mut self, record: &PeerStatusRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .peer_status
                    .insert(record.peer_id.clone(), record.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.upsert_peer_status(record),
        }
    }

    pub fn peer_statuses(&self) -> Result<Vec<PeerStatusRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.peer_status.values().cloned().collect()),
            StoreBackend::Sqlite(store) => store.peer_statuses(),
        }
    }

    pub fn assignment_count(&self) -> Result<usize, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.assignments.len()),
            StoreBackend::Sqlite(store) => store.count_assignments(false),
        }
    }

    pub fn active_assignment_count(&self) -> Result<usize, String> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.assignments.values().filter(|a| a.active).count())
            }
            StoreBackend::Sqlite(store) => store.count_assignments(true),
        }
    }
}

/// Unparseable timestamps count as stale: a row we cannot date must not
/// hold a guild active forever.
fn activity_is_stale(last_activity: &str, threshold: Duration, now: DateTime<Utc>) -> bool {
    match parse_rfc3339(last_activity) {
        Some(ts) => now - ts > threshold,
        None => true,
    }
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS assignments (
                guild_id TEXT PRIMARY KEY,
                owner_peer_id TEXT NOT NULL,
                owner_external_id TEXT NOT NULL,
                active INTEGER NOT NULL,
                session_channel TEXT,
                last_activity TEXT NOT NULL,
                reason TEXT NOT NULL,
                previous_owner_peer_id TEXT
            );
            CREATE TABLE IF NOT EXISTS peer_status (
                peer_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                load INTEGER NOT NULL,
                last_heartbeat TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn get_assignment(&self, guild_id: &str) -> Result<Option<AssignmentRecord>, String> {
        self.conn
            .query_row(
                "SELECT guild_id, owner_peer_id, owner_external_id, active, session_channel,
                        last_activity, reason, previous_owner_peer_id
                 FROM assignments WHERE guild_id = ?1",
                params![guild_id],
                |row| {
                    let active: i64 = row.get(3)?;
                    let reason: String = row.get(6)?;
                    Ok(AssignmentRecord {
                        guild_id: row.get(0)?,
                        owner_peer_id: row.get(1)?,
                        owner_external_id: row.get(2)?,
                        active: active != 0,
                        session_channel: row.get(4)?,
                        last_activity: row.get(5)?,
                        reason: AssignReason::from_name(&reason).unwrap_or(AssignReason::Auto),
                        previous_owner_peer_id: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn insert_assignment(&mut self, record: &AssignmentRecord) -> Result<(), String> {
        self.conn
            .execute(
                "INSERT INTO assignments
                 (guild_id, owner_peer_id, owner_external_id, active, session_channel,
                  last_activity, reason, previous_owner_peer_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.guild_id,
                    record.owner_peer_id,
                    record.owner_external_id,
                    record.active as i64,
                    record.session_channel,
                    record.last_activity,
                    record.reason.as_str(),
                    record.previous_owner_peer_id,
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn upsert_assignment(&mut self, record: &AssignmentRecord) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT INTO assignments
                (guild_id, owner_peer_id, owner_external_id, active, session_channel,
                 last_activity, reason, previous_owner_peer_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(guild_id) DO UPDATE SET
                    owner_peer_id=excluded.owner_peer_id,
                    owner_external_id=excluded.owner_external_id,
                    active=excluded.active,
                    session_channel=excluded.session_channel,
                    last_activity=excluded.last_activity,
                    reason=excluded.reason,
                    previous_owner_peer_id=excluded.previous_owner_peer_id
                ",
                params![
                    record.guild_id,
                    record.owner_peer_id,
                    record.owner_external_id,
                    record.active as i64,
                    record.session_channel,
                    record.last_activity,
                    record.reason.as_str(),
                    record.previous_owner_peer_id,
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn activate(&mut self, guild_id: &str, channel: &str, now: DateTime<Utc>) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE assignments SET active = 1, session_channel = ?2, last_activity = ?3
                 WHERE guild_id = ?1",
                params![guild_id, channel, now.to_rfc3339()],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn deactivate(&mut self, guild_id: &str) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE assignments SET active = 0, session_channel = NULL WHERE guild_id = ?1",
                params![guild_id],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn touch(&mut self, guild_id: &str, now: DateTime<Utc>) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE assignments SET last_activity = ?2 WHERE guild_id = ?1",
                params![guild_id, now.to_rfc3339()],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn release_stale(&mut self, threshold: Duration, now: DateTime<Utc>) -> Result<usize, String> {
        let mut stmt = self
            .conn
            .prepare("SELECT guild_id, last_activity FROM assignments WHERE active = 1")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| e.to_string())?;
        let mut stale = Vec::new();
        for row in rows {
            let (guild_id, last_activity) = row.map_err(|e| e.to_string())?;
            if activity_is_stale(&last_activity, threshold, now) {
                stale.push(guild_id);
            }
        }
        drop(stmt);
        for guild_id in &stale {
            self.conn
                .execute(
                    "UPDATE assignments SET active = 0, session_channel = NULL WHERE guild_id = ?1",
                    params![guild_id],
                )
                .map_err(|e| e.to_string())?;
        }
        Ok(stale.len())
    }

    fn upsert_peer_status(&mut self, record: &PeerStatusRecord) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT INTO peer_status (peer_id, status, load, last_heartbeat)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(peer_id) DO UPDATE SET
                    status=excluded.status,
                    load=excluded.load,
                    last_heartbeat=excluded.last_heartbeat
                ",
                params![
                    record.peer_id,
                    record.status.as_str(),
                    record.load as i64,
                    record.last_heartbeat,
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn peer_statuses(&self) -> Result<Vec<PeerStatusRecord>, String> {
        let mut stmt = self
            .conn
            .prepare("SELECT peer_id, status, load, last_heartbeat FROM peer_status")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(1)?;
                let load: i64 = row.get(2)?;
                Ok(PeerStatusRecord {
                    peer_id: row.get(0)?,
                    status: PeerHealth::from_name(&status).unwrap_or(PeerHealth::Offline),
                    load: load as u32,
                    last_heartbeat: row.get(3)?,
                })
            })
            .map_err(|e| e.to_string())?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| e.to_string())?);
        }
        Ok(records)
    }

    fn count_assignments(&self, active_only: bool) -> Result<usize, String> {
        let sql = if active_only {
            "SELECT COUNT(*) FROM assignments WHERE active = 1"
        } else {
            "SELECT COUNT(*) FROM assignments"
        };
        let count: i64 = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .map_err(|e| e.to_string())?;
        Ok(count as usize)
    }
}
