//! SQLite-backed session store.
//!
//! One writer connection behind a mutex; WAL journal mode and a busy
//! timeout so concurrent readers survive write contention. Snapshots are
//! stored relationally: one session row, one row per recent turn, one row
//! per hot fact.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::context::RollingSummary;
use crate::error::{Error, Result};
use crate::session::snapshot::{HotFact, SessionSnapshot};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5_000))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
    }
    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            turn_number INTEGER NOT NULL,
            summary_text TEXT NOT NULL DEFAULT '',
            summary_through_turn INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS recent_turns (
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            turn INTEGER NOT NULL,
            record TEXT NOT NULL,
            PRIMARY KEY (session_id, turn)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS hot_facts (
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            fact TEXT NOT NULL,
            origin TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY (session_id, position)
        )",
        [],
    )?;
    Ok(())
}

/// SQLite-backed store for session snapshots.
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn =
            Connection::open(path).map_err(|e| Error::SessionStorage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::SessionStorage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::SessionStorage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::SessionStorage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&mut conn).map_err(|e| Error::SessionStorage(e.to_string()))
    }

    /// Persist a snapshot, replacing any prior state for the session.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        snapshot.validate()?;
        let turns: Vec<(u64, String)> = snapshot
            .recent_turns
            .iter()
            .map(|t| Ok((t.turn, serde_json::to_string(t)?)))
            .collect::<Result<_>>()?;
        let facts: Vec<(String, String, f64)> = snapshot
            .hot_facts
            .iter()
            .map(|h| {
                Ok((
                    serde_json::to_string(&h.fact)?,
                    serde_json::to_string(&h.origin)?,
                    h.score,
                ))
            })
            .collect::<Result<_>>()?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO sessions (id, turn_number, summary_text, summary_through_turn, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                    turn_number = excluded.turn_number,
                    summary_text = excluded.summary_text,
                    summary_through_turn = excluded.summary_through_turn,
                    updated_at = excluded.updated_at",
                params![
                    snapshot.session_id,
                    snapshot.turn_number as i64,
                    snapshot.rolling_summary.text,
                    snapshot.rolling_summary.through_turn as i64,
                ],
            )?;
            tx.execute(
                "DELETE FROM recent_turns WHERE session_id = ?1",
                params![snapshot.session_id],
            )?;
            for (turn, record) in &turns {
                tx.execute(
                    "INSERT INTO recent_turns (session_id, turn, record) VALUES (?1, ?2, ?3)",
                    params![snapshot.session_id, *turn as i64, record],
                )?;
            }
            tx.execute(
                "DELETE FROM hot_facts WHERE session_id = ?1",
                params![snapshot.session_id],
            )?;
            for (position, (fact, origin, score)) in facts.iter().enumerate() {
                tx.execute(
                    "INSERT INTO hot_facts (session_id, position, fact, origin, score)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![snapshot.session_id, position as i64, fact, origin, score],
                )?;
            }
            tx.commit()
        })
    }

    /// Load a snapshot. `None` when the session is unknown.
    pub fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let header: Option<(i64, String, i64)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT turn_number, summary_text, summary_through_turn
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;
        let Some((turn_number, summary_text, summary_through)) = header else {
            return Ok(None);
        };

        let turn_rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM recent_turns WHERE session_id = ?1 ORDER BY turn ASC",
            )?;
            let rows = stmt.query_map(params![session_id], |row| row.get(0))?;
            rows.collect()
        })?;
        let fact_rows: Vec<(String, String, f64)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT fact, origin, score FROM hot_facts
                 WHERE session_id = ?1 ORDER BY position ASC",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })?;

        let recent_turns = turn_rows
            .iter()
            .map(|r| serde_json::from_str(r).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        let hot_facts = fact_rows
            .iter()
            .map(|(fact, origin, score)| {
                Ok(HotFact {
                    fact: serde_json::from_str(fact)?,
                    origin: serde_json::from_str(origin)?,
                    score: *score,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let snapshot = SessionSnapshot {
            session_id: session_id.to_string(),
            turn_number: turn_number as u64,
            rolling_summary: RollingSummary {
                text: summary_text,
                through_turn: summary_through as u64,
            },
            recent_turns,
            hot_facts,
        };
        snapshot.validate()?;
        Ok(Some(snapshot))
    }

    /// Session ids, most recently updated first.
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM sessions ORDER BY updated_at DESC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Delete a session and its dependents.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM sessions WHERE id = ?1",
                params![session_id],
            )?;
            Ok(rows > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CompressedTurn;
    use crate::datalog::{Const, Fact, Origin};
    use uuid::Uuid;

    fn snapshot(id: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: id.to_string(),
            turn_number: 7,
            rolling_summary: RollingSummary {
                text: "refactored the parser".into(),
                through_turn: 2,
            },
            recent_turns: vec![CompressedTurn::new(6), CompressedTurn::new(7)],
            hot_facts: vec![
                HotFact {
                    fact: Fact::new(
                        "focus_resolution",
                        vec![
                            Const::string("the parser"),
                            Const::string("src/parser.rs"),
                            Const::string("parse"),
                            Const::Float(0.92),
                        ],
                    ),
                    origin: Origin::User { turn: 6 },
                    score: 120.0,
                },
                HotFact {
                    fact: Fact::new("marker", vec![Const::Bytes(vec![1, 2, 3])]),
                    origin: Origin::System,
                    score: 50.0,
                },
            ],
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = SessionStore::in_memory().unwrap();
        let id = Uuid::new_v4().to_string();
        let snap = snapshot(&id);
        store.save(&snap).unwrap();

        let loaded = store.load(&id).unwrap().expect("session exists");
        assert_eq!(loaded, snap);
        // Type tags survived: name stayed name, float stayed float.
        assert_eq!(loaded.hot_facts[0].fact.args[3], Const::Float(0.92));
        assert_eq!(loaded.hot_facts[1].fact.args[0], Const::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_save_is_replacing() {
        let store = SessionStore::in_memory().unwrap();
        let id = Uuid::new_v4().to_string();
        store.save(&snapshot(&id)).unwrap();

        let mut updated = snapshot(&id);
        updated.turn_number = 8;
        updated.hot_facts.truncate(1);
        store.save(&updated).unwrap();

        let loaded = store.load(&id).unwrap().unwrap();
        assert_eq!(loaded.turn_number, 8);
        assert_eq!(loaded.hot_facts.len(), 1);
    }

    #[test]
    fn test_unknown_session_is_none() {
        let store = SessionStore::in_memory().unwrap();
        assert!(store.load("no-such-session").unwrap().is_none());
    }

    #[test]
    fn test_list_and_delete() {
        let store = SessionStore::in_memory().unwrap();
        let id = Uuid::new_v4().to_string();
        store.save(&snapshot(&id)).unwrap();
        assert_eq!(store.list_sessions().unwrap(), vec![id.clone()]);
        assert!(store.delete(&id).unwrap());
        assert!(store.list_sessions().unwrap().is_empty());
    }
}
