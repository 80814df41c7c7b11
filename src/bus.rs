//! Local message bus: two append-only JSONL journals, notifications out and
//! commands in. Producers append; consumers seek to a stored byte offset and
//! read forward. Malformed lines are skipped, never fatal.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::state::JsonMap;

fn default_true() -> bool {
    true
}

fn now_ts_f64() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// One outbound notification record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusNotification {
    pub id: String,
    pub ts: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub meta: JsonMap,
}

/// One inbound command record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusCommand {
    pub id: String,
    pub ts: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default = "default_true")]
    pub enter: bool,
    #[serde(default)]
    pub meta: JsonMap,
}

/// Append-only journals under one base directory.
#[derive(Clone)]
pub struct LocalBus {
    notifications_path: PathBuf,
    commands_path: PathBuf,
}

impl LocalBus {
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)
            .with_context(|| format!("failed to create bus directory {}", base_dir.display()))?;
        let bus = Self {
            notifications_path: base_dir.join("notifications.jsonl"),
            commands_path: base_dir.join("commands.jsonl"),
        };
        for path in [&bus.notifications_path, &bus.commands_path] {
            if !path.exists() {
                std::fs::File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
            }
        }
        Ok(bus)
    }

    // Notifications ----------------------------------------------------

    pub fn append_notification(
        &self,
        title: &str,
        body: &str,
        meta: JsonMap,
    ) -> Result<BusNotification> {
        let record = BusNotification {
            id: format!("n-{}", Uuid::new_v4()),
            ts: now_ts_f64(),
            title: title.to_string(),
            body: body.to_string(),
            meta,
        };
        self.append_jsonl(&self.notifications_path, &record)?;
        Ok(record)
    }

    pub fn read_notifications(&self, offset: u64) -> Result<(Vec<BusNotification>, u64)> {
        read_jsonl_from(&self.notifications_path, offset)
    }

    /// Tail-read recent notifications, newest last. Two reads with the same
    /// `since_ts` see the same set until the journal is trimmed.
    pub fn recent_notifications(
        &self,
        limit: usize,
        since_ts: Option<f64>,
    ) -> Result<Vec<BusNotification>> {
        let (mut rows, _) = read_jsonl_from::<BusNotification>(&self.notifications_path, 0)?;
        if let Some(since) = since_ts {
            rows.retain(|row| row.ts > since);
        }
        rows.sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap_or(std::cmp::Ordering::Equal));
        if limit > 0 && rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(rows)
    }

    // Commands ---------------------------------------------------------

    pub fn append_command(
        &self,
        text: &str,
        session: Option<&str>,
        enter: bool,
        meta: JsonMap,
    ) -> Result<BusCommand> {
        let record = BusCommand {
            id: format!("c-{}", Uuid::new_v4()),
            ts: now_ts_f64(),
            text: text.to_string(),
            session: session.map(str::to_string),
            enter,
            meta,
        };
        self.append_jsonl(&self.commands_path, &record)?;
        Ok(record)
    }

    pub fn read_commands(&self, offset: u64) -> Result<(Vec<BusCommand>, u64)> {
        read_jsonl_from(&self.commands_path, offset)
    }

    // Internal ---------------------------------------------------------

    fn append_jsonl<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize bus record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
        Ok(())
    }
}

/// Read records forward from a byte offset. A stale offset past EOF (the
/// journal was trimmed) restarts from the beginning. Returns the parsed
/// records and the offset at end-of-read.
fn read_jsonl_from<T: DeserializeOwned>(path: &Path, offset: u64) -> Result<(Vec<T>, u64)> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let len = data.len() as u64;
    let start = if offset > len { 0 } else { offset } as usize;

    let mut records = Vec::new();
    for line in String::from_utf8_lossy(&data[start..]).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(e) => debug!(error = %e, "skipping malformed bus line"),
        }
    }
    Ok((records, len))
}
