//! SQLite persistence: pane read-offsets, stage states, approval tokens,
//! agent-session records, and bus reader offsets.
//!
//! The store is the only shared mutable resource in the system. Both loops
//! coordinate exclusively through it (and the bus journals); each loop opens
//! its own connection and WAL keeps the writers serialized.

use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Result, params};
use serde_json::Value;

pub type JsonMap = serde_json::Map<String, Value>;

pub(crate) fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Lifecycle of one pipeline stage on one pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Idle,
    WaitingTrigger,
    WaitingApproval,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::WaitingTrigger => "WAITING_TRIGGER",
            Self::WaitingApproval => "WAITING_APPROVAL",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IDLE" => Some(Self::Idle),
            "WAITING_TRIGGER" => Some(Self::WaitingTrigger),
            "WAITING_APPROVAL" => Some(Self::WaitingApproval),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Persisted state of one (host, pane, pipeline, stage) row.
#[derive(Debug, Clone)]
pub struct StageState {
    pub host: String,
    pub pane_id: String,
    pub pipeline: String,
    pub stage: String,
    pub status: StageStatus,
    pub retries: u32,
    /// Free-form bag: timestamps, the `action_sent` flag, failure reasons.
    pub data: JsonMap,
    pub updated_at: i64,
}

impl StageState {
    pub fn new(host: &str, pane_id: &str, pipeline: &str, stage: &str) -> Self {
        Self {
            host: host.to_string(),
            pane_id: pane_id.to_string(),
            pipeline: pipeline.to_string(),
            stage: stage.to_string(),
            status: StageStatus::Idle,
            retries: 0,
            data: JsonMap::new(),
            updated_at: 0,
        }
    }
}

/// One agent-session record, keyed by branch.
#[derive(Debug, Clone)]
pub struct AgentSessionRow {
    pub branch: String,
    pub worktree_path: String,
    pub session_name: String,
    pub model: Option<String>,
    pub template: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub log_path: Option<String>,
    pub last_output: Option<String>,
    pub last_output_at: Option<i64>,
    pub metadata: JsonMap,
    pub created_at: i64,
    pub updated_at: i64,
}

/// SQLite-backed store. All methods are single serialized operations.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (or create) the database and run migrations. WAL is enabled so
    /// the supervisor and orchestrator connections interleave safely.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            // Connection::open fails with a less useful error otherwise.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pane_offsets (
                host       TEXT NOT NULL,
                pane_id    TEXT NOT NULL,
                offset     INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (host, pane_id)
            );

            CREATE TABLE IF NOT EXISTS stage_state (
                host       TEXT NOT NULL,
                pane_id    TEXT NOT NULL,
                pipeline   TEXT NOT NULL,
                stage      TEXT NOT NULL,
                status     TEXT NOT NULL,
                retries    INTEGER NOT NULL DEFAULT 0,
                data       TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (host, pane_id, pipeline, stage)
            );

            CREATE TABLE IF NOT EXISTS approval_tokens (
                host       TEXT NOT NULL,
                pane_id    TEXT NOT NULL,
                stage      TEXT NOT NULL,
                token      TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (host, pane_id, stage)
            );

            CREATE TABLE IF NOT EXISTS agent_sessions (
                branch         TEXT PRIMARY KEY,
                worktree_path  TEXT NOT NULL,
                session_name   TEXT NOT NULL,
                model          TEXT,
                template       TEXT,
                description    TEXT,
                status         TEXT,
                log_path       TEXT,
                last_output    TEXT,
                last_output_at INTEGER,
                metadata       TEXT,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bus_offsets (
                name       TEXT PRIMARY KEY,
                offset     INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
    }

    // Pane offsets -----------------------------------------------------

    pub fn get_offset(&self, host: &str, pane_id: &str) -> Result<u64> {
        let offset: Option<i64> = self
            .conn
            .query_row(
                "SELECT offset FROM pane_offsets WHERE host = ?1 AND pane_id = ?2",
                params![host, pane_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.unwrap_or(0).max(0) as u64)
    }

    pub fn set_offset(&self, host: &str, pane_id: &str, offset: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pane_offsets (host, pane_id, offset, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(host, pane_id) DO UPDATE SET
                 offset = excluded.offset,
                 updated_at = excluded.updated_at",
            params![host, pane_id, offset as i64, now_ts()],
        )?;
        Ok(())
    }

    // Bus offsets ------------------------------------------------------

    pub fn get_bus_offset(&self, name: &str) -> Result<u64> {
        let offset: Option<i64> = self
            .conn
            .query_row(
                "SELECT offset FROM bus_offsets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.unwrap_or(0).max(0) as u64)
    }

    pub fn set_bus_offset(&self, name: &str, offset: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO bus_offsets (name, offset, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                 offset = excluded.offset,
                 updated_at = excluded.updated_at",
            params![name, offset as i64, now_ts()],
        )?;
        Ok(())
    }

    // Stage state ------------------------------------------------------

    /// Load a stage row, or a fresh IDLE row when none is persisted yet.
    pub fn load_stage_state(
        &self,
        host: &str,
        pane_id: &str,
        pipeline: &str,
        stage: &str,
    ) -> Result<StageState> {
        let row = self
            .conn
            .query_row(
                "SELECT status, retries, data, updated_at FROM stage_state
                 WHERE host = ?1 AND pane_id = ?2 AND pipeline = ?3 AND stage = ?4",
                params![host, pane_id, pipeline, stage],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, retries, data_json, updated_at)) = row else {
            return Ok(StageState::new(host, pane_id, pipeline, stage));
        };

        let data = data_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        Ok(StageState {
            host: host.to_string(),
            pane_id: pane_id.to_string(),
            pipeline: pipeline.to_string(),
            stage: stage.to_string(),
            status: StageStatus::parse(&status).unwrap_or(StageStatus::Idle),
            retries,
            data,
            updated_at,
        })
    }

    pub fn save_stage_state(&self, state: &StageState) -> Result<()> {
        let data = serde_json::to_string(&state.data).unwrap_or_else(|_| "{}".to_string());
        self.conn.execute(
            "INSERT INTO stage_state (host, pane_id, pipeline, stage, status, retries, data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(host, pane_id, pipeline, stage) DO UPDATE SET
                 status = excluded.status,
                 retries = excluded.retries,
                 data = excluded.data,
                 updated_at = excluded.updated_at",
            params![
                state.host,
                state.pane_id,
                state.pipeline,
                state.stage,
                state.status.as_str(),
                state.retries,
                data,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    /// External recovery path: wipe one pipeline's rows so a FAILED pipeline
    /// can run again from IDLE.
    pub fn reset_pipeline(&self, host: &str, pane_id: &str, pipeline: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM stage_state WHERE host = ?1 AND pane_id = ?2 AND pipeline = ?3",
            params![host, pane_id, pipeline],
        )?;
        Ok(())
    }

    pub fn list_stage_states(&self) -> Result<Vec<StageState>> {
        let mut stmt = self.conn.prepare(
            "SELECT host, pane_id, pipeline, stage, status, retries, data, updated_at
             FROM stage_state ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut states = Vec::new();
        for row in rows {
            let (host, pane_id, pipeline, stage, status, retries, data_json, updated_at) = row?;
            let data = data_json
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .and_then(|value| match value {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .unwrap_or_default();
            states.push(StageState {
                host,
                pane_id,
                pipeline,
                stage,
                status: StageStatus::parse(&status).unwrap_or(StageStatus::Idle),
                retries,
                data,
                updated_at,
            });
        }
        Ok(states)
    }

    // Approval tokens --------------------------------------------------

    pub fn upsert_approval_token(
        &self,
        host: &str,
        pane_id: &str,
        stage: &str,
        token: &str,
        expires_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO approval_tokens (host, pane_id, stage, token, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(host, pane_id, stage) DO UPDATE SET
                 token = excluded.token,
                 expires_at = excluded.expires_at",
            params![host, pane_id, stage, token, expires_at],
        )?;
        Ok(())
    }

    /// Fetch the live token for a key. Expired rows are purged on read.
    pub fn get_approval_token(
        &self,
        host: &str,
        pane_id: &str,
        stage: &str,
    ) -> Result<Option<(String, i64)>> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT token, expires_at FROM approval_tokens
                 WHERE host = ?1 AND pane_id = ?2 AND stage = ?3",
                params![host, pane_id, stage],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((_, expires_at)) if expires_at < now_ts() => {
                self.delete_approval_token(host, pane_id, stage)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn delete_approval_token(&self, host: &str, pane_id: &str, stage: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM approval_tokens WHERE host = ?1 AND pane_id = ?2 AND stage = ?3",
            params![host, pane_id, stage],
        )?;
        Ok(())
    }

    pub fn expire_tokens(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM approval_tokens WHERE expires_at < ?1",
            params![now_ts()],
        )?;
        Ok(())
    }

    // Agent sessions ---------------------------------------------------

    pub fn upsert_agent_session(&self, row: &AgentSessionRow) -> Result<()> {
        let now = now_ts();
        let metadata = serde_json::to_string(&row.metadata).unwrap_or_else(|_| "{}".to_string());
        self.conn.execute(
            "INSERT INTO agent_sessions (
                branch, worktree_path, session_name, model, template, description,
                status, log_path, last_output, last_output_at, metadata,
                created_at, updated_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(branch) DO UPDATE SET
                 worktree_path = excluded.worktree_path,
                 session_name = excluded.session_name,
                 model = excluded.model,
                 template = excluded.template,
                 description = excluded.description,
                 status = excluded.status,
                 log_path = excluded.log_path,
                 last_output = excluded.last_output,
                 last_output_at = excluded.last_output_at,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at",
            params![
                row.branch,
                row.worktree_path,
                row.session_name,
                row.model,
                row.template,
                row.description,
                row.status,
                row.log_path,
                row.last_output,
                row.last_output_at,
                metadata,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent_session(&self, branch: &str) -> Result<Option<AgentSessionRow>> {
        self.agent_session_where("branch = ?1", params![branch])
    }

    pub fn find_agent_by_session(&self, session_name: &str) -> Result<Option<AgentSessionRow>> {
        self.agent_session_where("session_name = ?1", params![session_name])
    }

    fn agent_session_where(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<AgentSessionRow>> {
        let sql = format!(
            "SELECT branch, worktree_path, session_name, model, template, description,
                    status, log_path, last_output, last_output_at, metadata,
                    created_at, updated_at
             FROM agent_sessions WHERE {clause}"
        );
        self.conn
            .query_row(&sql, args, row_to_agent_session)
            .optional()
    }

    pub fn list_agent_sessions(&self) -> Result<Vec<AgentSessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT branch, worktree_path, session_name, model, template, description,
                    status, log_path, last_output, last_output_at, metadata,
                    created_at, updated_at
             FROM agent_sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_agent_session)?;
        rows.collect()
    }

    pub fn delete_agent_session(&self, branch: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM agent_sessions WHERE branch = ?1",
            params![branch],
        )?;
        Ok(())
    }

    /// Merge runtime fields into an existing record. Missing branches are a
    /// no-op: the record may have been killed between ticks.
    pub fn update_agent_runtime(
        &self,
        branch: &str,
        status: Option<&str>,
        last_output: Option<&str>,
        metadata: &JsonMap,
    ) -> Result<()> {
        let Some(mut row) = self.get_agent_session(branch)? else {
            return Ok(());
        };
        for (key, value) in metadata {
            row.metadata.insert(key.clone(), value.clone());
        }
        if let Some(status) = status {
            row.status = status.to_string();
        }
        if let Some(output) = last_output {
            row.last_output = Some(output.to_string());
            row.last_output_at = Some(now_ts());
        }
        self.upsert_agent_session(&row)
    }
}

fn row_to_agent_session(row: &rusqlite::Row<'_>) -> Result<AgentSessionRow> {
    let metadata_json: Option<String> = row.get(10)?;
    let metadata = metadata_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();
    Ok(AgentSessionRow {
        branch: row.get(0)?,
        worktree_path: row.get(1)?,
        session_name: row.get(2)?,
        model: row.get(3)?,
        template: row.get(4)?,
        description: row.get(5)?,
        status: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        log_path: row.get(7)?,
        last_output: row.get(8)?,
        last_output_at: row.get(9)?,
        metadata,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
