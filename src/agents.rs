//! Agent-session service: the bridge between agent records in the store and
//! their live tmux sessions. Records are created by the external session
//! bootstrapper; this service lists them, merges runtime metadata, captures
//! recent output, forwards input, and tears sessions down.

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::state::{AgentSessionRow, JsonMap, StateStore};
use crate::tmux::{PaneInfo, Tmux};

pub const DEFAULT_SESSION_PREFIX: &str = "agent-";

pub struct AgentService {
    tmux: Box<dyn Tmux>,
    prefix: String,
}

impl AgentService {
    pub fn new(tmux: Box<dyn Tmux>, prefix: &str) -> Self {
        Self {
            tmux,
            prefix: prefix.to_string(),
        }
    }

    /// Branch → tmux session name. Branch separators are not valid in tmux
    /// targets, so they collapse to dashes.
    pub fn session_name(&self, branch: &str) -> String {
        let safe = branch.replace(['/', ':'], "-");
        format!("{}{safe}", self.prefix)
    }

    pub fn list_agents(&self, store: &StateStore) -> Result<Vec<AgentSessionRow>> {
        store
            .list_agent_sessions()
            .context("failed to list agent sessions")
    }

    /// Merge status / output / metadata into the record. Unknown branches
    /// are a no-op: the session may have been killed between ticks.
    pub fn update_status(
        &self,
        store: &StateStore,
        branch: &str,
        status: Option<&str>,
        last_output: Option<&str>,
        metadata: &JsonMap,
    ) -> Result<()> {
        store
            .update_agent_runtime(branch, status, last_output, metadata)
            .with_context(|| format!("failed to update agent session {branch}"))
    }

    /// Capture the tail of the session's first pane and persist it as the
    /// record's recent output.
    pub fn capture_recent_output(
        &self,
        store: &StateStore,
        branch: &str,
        lines: u32,
    ) -> Result<String> {
        let pane = self.first_pane(branch)?;
        let output = self
            .tmux
            .capture_pane(&pane.pane_id, lines)
            .with_context(|| format!("failed to capture output for {branch}"))?;
        self.update_status(store, branch, None, Some(&output), &JsonMap::new())?;
        Ok(output)
    }

    pub fn send(&self, branch: &str, text: &str, enter: bool) -> Result<()> {
        let pane = self.first_pane(branch)?;
        self.tmux
            .send_keys(&pane.pane_id, text, enter)
            .with_context(|| format!("failed to send keys to {branch}"))?;
        Ok(())
    }

    /// Kill the tmux session (if any) and remove the record.
    pub fn kill(&self, store: &StateStore, branch: &str) -> Result<()> {
        let session = self.session_name(branch);
        if self.tmux.session_exists(&session) {
            self.tmux
                .kill_session(&session)
                .with_context(|| format!("failed to kill session {session}"))?;
        }
        store
            .delete_agent_session(branch)
            .with_context(|| format!("failed to delete agent session {branch}"))?;
        info!(branch, session, "agent session removed");
        Ok(())
    }

    fn first_pane(&self, branch: &str) -> Result<PaneInfo> {
        let session = self.session_name(branch);
        let panes = self
            .tmux
            .panes_for_session(&session)
            .with_context(|| format!("failed to list panes for session {session}"))?;
        match panes.into_iter().next() {
            Some(pane) => Ok(pane),
            None => bail!("session {session} does not exist or has no panes"),
        }
    }
}
