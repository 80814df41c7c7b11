//! Advisor orchestrator: the slow loop that nudges agent sessions.
//!
//! On each cycle, every agent-session record gets a heartbeat, its log is
//! rotated when oversized, an optional summary pass runs, and (cooldown
//! permitting) the advisor is consulted for the next commands. The advisor
//! is strictly advisory: its commands travel through the same bus as human
//! commands, and any failure is parked in the session metadata and retried
//! next cycle.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::advisor::{Advise, Decision};
use crate::agents::AgentService;
use crate::bus::LocalBus;
use crate::notify::{NotificationMessage, Notifier};
use crate::state::{AgentSessionRow, JsonMap, StateStore, now_ts};

const HISTORY_SUMMARIES_KEPT: usize = 10;

fn default_poll_interval() -> f64 {
    45.0
}

fn default_cooldown_seconds() -> f64 {
    120.0
}

fn default_max_commands_per_cycle() -> usize {
    2
}

fn default_history_lines() -> usize {
    400
}

fn default_command_prompt() -> PathBuf {
    PathBuf::from(".sentry/prompts/command.md")
}

fn default_summary_prompt() -> Option<PathBuf> {
    Some(PathBuf::from(".sentry/prompts/summary.md"))
}

fn default_advisor_bin() -> String {
    "codex".to_string()
}

fn default_advisor_timeout_secs() -> u64 {
    120
}

fn default_notify_only_on_confirmation() -> bool {
    true
}

fn default_session_prefix() -> String {
    crate::agents::DEFAULT_SESSION_PREFIX.to_string()
}

/// Locations of the prompt templates.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_command_prompt")]
    pub command: PathBuf,
    #[serde(default = "default_summary_prompt")]
    pub summary: Option<PathBuf>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            command: default_command_prompt(),
            summary: default_summary_prompt(),
        }
    }
}

/// Decision-CLI invocation details.
#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorConfig {
    #[serde(default = "default_advisor_bin")]
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_advisor_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            bin: default_advisor_bin(),
            args: Vec::new(),
            timeout_secs: default_advisor_timeout_secs(),
            env: HashMap::new(),
        }
    }
}

impl AdvisorConfig {
    pub fn executable(&self) -> Vec<String> {
        let mut executable = vec![self.bin.clone()];
        executable.extend(self.args.iter().cloned());
        executable
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Top-level orchestrator configuration (TOML).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,
    #[serde(default = "default_max_commands_per_cycle")]
    pub max_commands_per_cycle: usize,
    #[serde(default = "default_history_lines")]
    pub history_lines: usize,
    pub prompts: PromptsConfig,
    pub advisor: AdvisorConfig,
    #[serde(default = "default_notify_only_on_confirmation")]
    pub notify_only_on_confirmation: bool,
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
}

pub fn load_orchestrator_config(path: &Path) -> Result<OrchestratorConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read orchestrator config {}", path.display()))?;
    let mut config: OrchestratorConfig = toml::from_str(&contents)
        .with_context(|| format!("invalid orchestrator config at {}", path.display()))?;

    // Prompt paths are relative to the config file.
    let base = path.parent().unwrap_or(Path::new("."));
    config.prompts.command = absolutize(base, &config.prompts.command);
    config.prompts.summary = config
        .prompts
        .summary
        .as_deref()
        .map(|p| absolutize(base, p));
    Ok(config)
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub struct Orchestrator<A: Advise> {
    config: OrchestratorConfig,
    store: StateStore,
    agents: AgentService,
    bus: LocalBus,
    notifier: Notifier,
    advisor: A,
    last_command_at: HashMap<String, i64>,
}

impl<A: Advise> Orchestrator<A> {
    pub fn new(
        config: OrchestratorConfig,
        store: StateStore,
        agents: AgentService,
        bus: LocalBus,
        notifier: Notifier,
        advisor: A,
    ) -> Self {
        Self {
            config,
            store,
            agents,
            bus,
            notifier,
            advisor,
            last_command_at: HashMap::new(),
        }
    }

    pub fn run_forever(&mut self, stop: &AtomicBool) {
        let interval = Duration::from_secs_f64(self.config.poll_interval.max(1.0));
        info!(interval_secs = interval.as_secs_f64(), "orchestrator loop starting");
        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.run_once() {
                warn!(error = %e, "orchestrator cycle failed");
            }
            // Sleep in slices so Ctrl-C lands at a tick boundary promptly.
            let mut remaining = interval;
            while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
                let slice = remaining.min(Duration::from_millis(250));
                std::thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
        }
        info!("orchestrator loop stopped");
    }

    pub fn run_once(&mut self) -> Result<()> {
        let records = self.agents.list_agents(&self.store)?;
        let now = now_ts();
        for record in records {
            if let Err(e) = self.process_record(&record, now) {
                warn!(branch = %record.branch, error = %e, "agent cycle failed");
                self.record_error(&record.branch, &e.to_string());
            }
        }
        Ok(())
    }

    fn process_record(&mut self, record: &AgentSessionRow, now: i64) -> Result<()> {
        // Heartbeat first: it advances whether or not anything else does.
        let mut heartbeat = JsonMap::new();
        heartbeat.insert("orchestrator_heartbeat".to_string(), json!(now));
        self.agents
            .update_status(&self.store, &record.branch, None, None, &heartbeat)?;

        if let Some(log_path) = record.log_path.as_deref() {
            rotate_log(Path::new(log_path), self.config.history_lines);
        }
        let log_excerpt = read_log_tail(record.log_path.as_deref(), self.config.history_lines);

        self.maybe_generate_summary(record, &log_excerpt);

        if !self.should_process(&record.branch) {
            debug!(branch = %record.branch, "cooldown active, skipping command cycle");
            return Ok(());
        }

        let prompt = self.render_prompt(record, &log_excerpt)?;
        match self.advisor.run(&prompt) {
            Ok(decision) => self.handle_decision(record, &decision),
            Err(e) => {
                self.record_error(&record.branch, &e.to_string());
                Ok(())
            }
        }
    }

    fn handle_decision(&mut self, record: &AgentSessionRow, decision: &Decision) -> Result<()> {
        debug!(branch = %record.branch, commands = decision.commands.len(), "advisor decision");

        // A decision synthesized from an advisor failure event is surfaced
        // exactly like an invocation failure.
        if let Some(detail) = decision.advisor_error() {
            self.record_error(&record.branch, detail);
        }

        let mut metadata = JsonMap::new();
        let mut status = None;
        if let Some(summary) = &decision.summary {
            metadata.insert("orchestrator_summary".to_string(), json!(summary));
            let texts: Vec<&str> = decision
                .commands
                .iter()
                .filter_map(|cmd| cmd.text.as_deref())
                .collect();
            metadata.insert("orchestrator_last_command".to_string(), json!(texts));
            status = Some("orchestrated");
        }
        if let Some(phase) = &decision.phase {
            metadata.insert("phase".to_string(), json!(phase));
        }
        metadata.insert("blockers".to_string(), json!(decision.blockers));
        self.agents
            .update_status(&self.store, &record.branch, status, None, &metadata)?;

        let mut sent = 0;
        for command in &decision.commands {
            if sent >= self.config.max_commands_per_cycle {
                debug!(branch = %record.branch, "per-cycle command budget reached");
                break;
            }
            let target = command.session.as_deref().unwrap_or(&record.session_name);
            let mut meta = JsonMap::new();
            meta.insert("sender".to_string(), json!("orchestrator"));
            meta.insert("risk_level".to_string(), json!(command.risk_level));
            if !command.keys.is_empty() {
                meta.insert("keys".to_string(), json!(command.keys));
            }
            if let Some(notes) = &command.notes {
                meta.insert("notes".to_string(), json!(notes));
            }
            self.bus.append_command(
                command.text.as_deref().unwrap_or(""),
                Some(target),
                command.enter,
                meta,
            )?;
            sent += 1;
        }
        if sent > 0 {
            self.last_command_at.insert(record.branch.clone(), now_ts());
        }

        if let Some(notify) = decision.notify.as_deref().filter(|n| !n.trim().is_empty()) {
            if !self.config.notify_only_on_confirmation || decision.requires_confirmation {
                self.notifier.send(&NotificationMessage::new(
                    format!("{} needs attention", record.branch),
                    notify.to_string(),
                ));
            }
        }
        Ok(())
    }

    fn maybe_generate_summary(&self, record: &AgentSessionRow, log_excerpt: &str) {
        let Some(summary_path) = self.config.prompts.summary.as_deref() else {
            return;
        };
        let Ok(template) = std::fs::read_to_string(summary_path) else {
            return;
        };
        let prompt = render_template(
            &template,
            &[
                ("branch", &record.branch),
                ("session", &record.session_name),
                ("log_excerpt", log_excerpt),
                ("metadata", &metadata_json(record)),
            ],
        );
        let summary = match self.advisor.run_summary(&prompt) {
            Ok(summary) if !summary.is_empty() => summary,
            Ok(_) => return,
            Err(e) => {
                debug!(branch = %record.branch, error = %e, "summary pass failed");
                return;
            }
        };

        let mut history: Vec<serde_json::Value> = record
            .metadata
            .get("history_summaries")
            .and_then(|value| value.as_array())
            .cloned()
            .unwrap_or_default();
        history.push(json!(summary));
        if history.len() > HISTORY_SUMMARIES_KEPT {
            history.drain(..history.len() - HISTORY_SUMMARIES_KEPT);
        }
        let mut metadata = JsonMap::new();
        metadata.insert("history_summaries".to_string(), json!(history));
        if let Err(e) = self
            .agents
            .update_status(&self.store, &record.branch, None, None, &metadata)
        {
            debug!(branch = %record.branch, error = %e, "failed to persist summary history");
        }
    }

    fn render_prompt(&self, record: &AgentSessionRow, log_excerpt: &str) -> Result<String> {
        let template = std::fs::read_to_string(&self.config.prompts.command).with_context(|| {
            format!(
                "failed to read command prompt template {}",
                self.config.prompts.command.display()
            )
        })?;
        let summary_template = self
            .config
            .prompts
            .summary
            .as_deref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .unwrap_or_default();
        Ok(render_template(
            &template,
            &[
                ("branch", &record.branch),
                ("session", &record.session_name),
                ("model", record.model.as_deref().unwrap_or("")),
                ("template", record.template.as_deref().unwrap_or("")),
                ("description", record.description.as_deref().unwrap_or("")),
                ("status", &record.status),
                ("metadata", &metadata_json(record)),
                ("log_excerpt", log_excerpt),
                ("summary_prompt", &summary_template),
            ],
        ))
    }

    fn record_error(&self, branch: &str, message: &str) {
        warn!(branch, error = message, "advisor cycle error recorded");
        let mut metadata = JsonMap::new();
        metadata.insert("orchestrator_error".to_string(), json!(message));
        if let Err(e) = self
            .agents
            .update_status(&self.store, branch, None, None, &metadata)
        {
            warn!(branch, error = %e, "failed to record orchestrator error");
        }
    }

    fn should_process(&self, branch: &str) -> bool {
        match self.last_command_at.get(branch) {
            None => true,
            Some(last) => (now_ts() - last) as f64 >= self.config.cooldown_seconds,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_command_at(&mut self, branch: &str, ts: i64) {
        self.last_command_at.insert(branch.to_string(), ts);
    }
}

fn metadata_json(record: &AgentSessionRow) -> String {
    serde_json::to_string_pretty(&record.metadata).unwrap_or_else(|_| "{}".to_string())
}

fn render_template(template: &str, fields: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in fields {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

/// Tail of the session log, bounded to `history_lines`.
fn read_log_tail(log_path: Option<&str>, history_lines: usize) -> String {
    let Some(path) = log_path else {
        return String::new();
    };
    let Ok(data) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = data.lines().collect();
    let start = lines.len().saturating_sub(history_lines);
    lines[start..].join("\n")
}

/// When the log exceeds 10x the history window, move everything but the
/// last 5x into `<log>.archive`.
fn rotate_log(log_path: &Path, history_lines: usize) {
    let Ok(data) = std::fs::read_to_string(log_path) else {
        return;
    };
    let lines: Vec<&str> = data.lines().collect();
    let max_lines = history_lines * 10;
    let keep_lines = history_lines * 5;
    if lines.len() <= max_lines {
        return;
    }

    let archive_path = {
        let mut name = log_path.as_os_str().to_os_string();
        name.push(".archive");
        PathBuf::from(name)
    };
    let (archived, kept) = lines.split_at(lines.len() - keep_lines);
    let append = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&archive_path)
        .and_then(|mut file| {
            file.write_all(archived.join("\n").as_bytes())?;
            file.write_all(b"\n")
        });
    if let Err(e) = append {
        warn!(error = %e, "log archive write failed, skipping rotation");
        return;
    }
    if let Err(e) = std::fs::write(log_path, format!("{}\n", kept.join("\n"))) {
        warn!(error = %e, "log truncate failed");
    } else {
        info!(log = %log_path.display(), archived = archived.len(), "rotated session log");
    }
}
