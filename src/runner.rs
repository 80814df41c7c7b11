//! The supervisor loop: expire tokens, observe panes, diff output, evaluate
//! policy, dispatch actions, fan out notifications, and drain the inbound
//! command bus. One cooperative tick at a time.
//!
//! Store failures are fatal by design: offsets must be persisted before
//! actions dispatch, and a crash-loop beats a silent double-send. Tmux
//! failures are per-host and transient: the host is skipped for the tick.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::approvals::ApprovalManager;
use crate::bus::{BusCommand, LocalBus};
use crate::config::{AgentConfig, HostConfig, SshConfig};
use crate::parser::parse_messages;
use crate::policy::{Action, ActionKind, EvaluationOutcome, PolicyEngine};
use crate::state::{JsonMap, StateStore};
use crate::tmux::{PaneInfo, Tmux, ssh_base_command};

/// Named reader offset for the supervisor's command-bus cursor.
const BUS_READER: &str = "supervisor";

/// How much of a capture buffer is kept as an agent session's last output.
const RECENT_OUTPUT_LINES: usize = 200;

/// One monitored host: its config plus a live adapter and the filter
/// regexes compiled at startup (bad patterns fail the boot, not the tick).
pub struct HostRuntime {
    pub host: HostConfig,
    pub adapter: Box<dyn Tmux>,
    session_filters: Vec<Regex>,
    pane_name_patterns: Vec<Regex>,
}

impl HostRuntime {
    pub fn new(host: HostConfig, adapter: Box<dyn Tmux>) -> Result<Self> {
        let session_filters = compile_patterns(&host.tmux.session_filters)
            .with_context(|| format!("bad session_filters for host {:?}", host.name))?;
        let pane_name_patterns = compile_patterns(&host.tmux.pane_name_patterns)
            .with_context(|| format!("bad pane_name_patterns for host {:?}", host.name))?;
        Ok(Self {
            host,
            adapter,
            session_filters,
            pane_name_patterns,
        })
    }

    fn pane_matches(&self, pane: &PaneInfo) -> bool {
        if !self.session_filters.is_empty()
            && !self
                .session_filters
                .iter()
                .any(|filter| filter.is_match(&pane.session_name))
        {
            return false;
        }
        if !self.pane_name_patterns.is_empty()
            && !self.pane_name_patterns.iter().any(|pattern| {
                pattern.is_match(&pane.pane_title) || pattern.is_match(&pane.window_name)
            })
        {
            return false;
        }
        true
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|raw| Regex::new(raw).with_context(|| format!("bad pattern {raw:?}")))
        .collect()
}

pub struct Runner {
    config: AgentConfig,
    store: StateStore,
    engine: PolicyEngine,
    approvals: ApprovalManager,
    notifier: crate::notify::Notifier,
    bus: LocalBus,
    runtimes: Vec<HostRuntime>,
    dry_run: bool,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        store: StateStore,
        engine: PolicyEngine,
        approvals: ApprovalManager,
        notifier: crate::notify::Notifier,
        bus: LocalBus,
        runtimes: Vec<HostRuntime>,
        dry_run: bool,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            approvals,
            notifier,
            bus,
            runtimes,
            dry_run,
        }
    }

    /// Effective poll interval: the minimum of the global and per-host
    /// settings, clamped to 100ms.
    pub fn poll_interval(&self) -> Duration {
        let mut effective_ms = self.config.poll_interval_ms;
        for runtime in &self.runtimes {
            if let Some(host_ms) = runtime.host.tmux.poll_interval_ms {
                effective_ms = effective_ms.min(host_ms);
            }
        }
        Duration::from_millis(effective_ms.max(100))
    }

    pub fn run_forever(&mut self, stop: &AtomicBool) -> Result<()> {
        let interval = self.poll_interval();
        info!(interval_ms = interval.as_millis() as u64, "supervisor loop starting");
        while !stop.load(Ordering::SeqCst) {
            self.run_once()?;
            let mut remaining = interval;
            while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
                let slice = remaining.min(Duration::from_millis(100));
                std::thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
        }
        info!("supervisor loop stopped");
        Ok(())
    }

    /// A single tick.
    pub fn run_once(&mut self) -> Result<()> {
        self.store.expire_tokens().context("token expiry failed")?;

        for idx in 0..self.runtimes.len() {
            let panes = match self.runtimes[idx].adapter.list_panes() {
                Ok(panes) => panes,
                Err(e) => {
                    warn!(host = %self.runtimes[idx].host.name, error = %e, "host unavailable this tick");
                    continue;
                }
            };
            for pane in panes {
                if !self.runtimes[idx].pane_matches(&pane) {
                    continue;
                }
                self.observe_pane(idx, &pane)?;
            }
        }

        self.drain_commands()
    }

    fn observe_pane(&self, runtime_idx: usize, pane: &PaneInfo) -> Result<()> {
        let runtime = &self.runtimes[runtime_idx];
        let host = runtime.host.name.clone();
        let buffer = match runtime
            .adapter
            .capture_pane(&pane.pane_id, runtime.host.tmux.capture_lines)
        {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(host = %host, pane = %pane.pane_id, error = %e, "capture failed");
                return Ok(());
            }
        };

        let new_lines = self.diff_pane(&host, &pane.pane_id, &buffer)?;
        if !new_lines.is_empty() {
            self.record_agent_output(&pane.session_name, &buffer)?;
        }
        let messages = parse_messages(&new_lines);
        let outcome = self.engine.evaluate(
            &self.store,
            &self.approvals,
            &host,
            pane,
            &new_lines,
            &messages,
        )?;
        self.handle_outcome(runtime_idx, pane, outcome);
        Ok(())
    }

    /// Panes that belong to a registered agent session keep their recent
    /// output mirrored into the session record for the orchestrator.
    fn record_agent_output(&self, session_name: &str, buffer: &str) -> Result<()> {
        let Some(record) = self.store.find_agent_by_session(session_name)? else {
            return Ok(());
        };
        let lines: Vec<&str> = buffer.lines().collect();
        let start = lines.len().saturating_sub(RECENT_OUTPUT_LINES);
        let tail = lines[start..].join("\n");
        self.store
            .update_agent_runtime(&record.branch, None, Some(&tail), &JsonMap::new())?;
        Ok(())
    }

    /// Compute the fresh slice of a capture buffer and persist the advanced
    /// offset BEFORE evaluation: bytes are never reprocessed, even across a
    /// crash mid-tick (at-most-once reads).
    fn diff_pane(&self, host: &str, pane_id: &str, buffer: &str) -> Result<Vec<String>> {
        let mut prev = self.store.get_offset(host, pane_id)?;
        let len = buffer.len() as u64;
        if prev > len {
            debug!(host, pane_id, prev, len, "buffer shrank, resetting offset");
            prev = 0;
        }
        let new_slice = &buffer.as_bytes()[prev as usize..];
        self.store.set_offset(host, pane_id, len)?;
        if new_slice.is_empty() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(new_slice)
            .lines()
            .map(str::to_string)
            .collect())
    }

    fn handle_outcome(&self, runtime_idx: usize, pane: &PaneInfo, outcome: EvaluationOutcome) {
        for request in &outcome.approvals {
            info!(
                host = %request.host,
                pane = %request.pane_id,
                stage = %request.stage,
                file = %request.file_path.display(),
                "approval pending"
            );
        }
        for note in &outcome.notifications {
            self.notifier.send(note);
        }
        for action in &outcome.actions {
            self.dispatch_action(runtime_idx, pane, action);
        }
    }

    fn dispatch_action(&self, runtime_idx: usize, pane: &PaneInfo, action: &Action) {
        let runtime = &self.runtimes[runtime_idx];
        if action.host != runtime.host.name {
            debug!(
                action_host = %action.host,
                runtime = %runtime.host.name,
                "skipping action for another host"
            );
            return;
        }
        info!(
            host = %action.host,
            pane = %pane.pane_id,
            kind = ?action.kind,
            command = %action.command,
            "dispatching action"
        );
        if self.dry_run {
            info!("dry-run: action not executed");
            return;
        }
        let result = match action.kind {
            ActionKind::SendKeys => runtime
                .adapter
                .send_keys(&action.pane_id, &action.command, action.enter)
                .map_err(anyhow::Error::from),
            ActionKind::Shell => run_shell(runtime.host.ssh.as_ref(), &action.command),
        };
        if let Err(e) = result {
            // Next tick re-evaluates; action_sent stays set so the stage is
            // not resent outside a retry (at-most-once per stage entry).
            warn!(pane = %action.pane_id, error = %e, "action dispatch failed");
        }
    }

    /// Drain the inbound command journal. The offset advances before any
    /// dispatch, mirroring the pane-read contract.
    fn drain_commands(&self) -> Result<()> {
        let offset = self.store.get_bus_offset(BUS_READER)?;
        let (commands, new_offset) = self.bus.read_commands(offset)?;
        if new_offset != offset {
            self.store.set_bus_offset(BUS_READER, new_offset)?;
        }
        for command in &commands {
            self.dispatch_bus_command(command);
        }
        Ok(())
    }

    fn dispatch_bus_command(&self, command: &BusCommand) {
        let Some(session) = command.session.as_deref() else {
            warn!(id = %command.id, "bus command has no target session, skipping");
            return;
        };
        if self.dry_run {
            info!(id = %command.id, session, "dry-run: bus command not executed");
            return;
        }

        let keys: Vec<String> = command
            .meta
            .get("keys")
            .and_then(|value| value.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        for runtime in &self.runtimes {
            if !runtime.adapter.session_exists(session) {
                continue;
            }
            let pane = match runtime.adapter.panes_for_session(session) {
                Ok(panes) => panes.into_iter().next(),
                Err(e) => {
                    warn!(session, error = %e, "failed to resolve session panes");
                    return;
                }
            };
            let Some(pane) = pane else {
                warn!(session, "session has no panes");
                return;
            };
            let result = if keys.is_empty() {
                runtime
                    .adapter
                    .send_keys(&pane.pane_id, &command.text, command.enter)
            } else {
                runtime
                    .adapter
                    .send_key_tokens(&pane.pane_id, &keys, command.enter)
            };
            match result {
                Ok(()) => debug!(id = %command.id, session, pane = %pane.pane_id, "bus command delivered"),
                Err(e) => warn!(id = %command.id, session, error = %e, "bus command delivery failed"),
            }
            return;
        }
        warn!(id = %command.id, session, "no host has this session, command dropped");
    }
}

/// Run a shell action: `bash -lc` locally, or the same wrapped in ssh for
/// remote hosts.
fn run_shell(ssh: Option<&SshConfig>, command: &str) -> Result<()> {
    let status = match ssh {
        Some(ssh) => {
            let mut cmd = ssh_base_command(ssh);
            cmd.arg(format!("bash -lc {}", sh_quote(command)));
            cmd.status()
        }
        None => Command::new("bash").args(["-lc", command]).status(),
    }
    .context("failed to spawn shell action")?;
    if !status.success() {
        bail!("shell action exited with {status}");
    }
    Ok(())
}

/// POSIX single-quote escaping.
fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}
