//! Adapter around the tmux CLI for pane discovery and interaction.
//!
//! Every call is one `tmux` subprocess, optionally wrapped in `ssh` for
//! remote hosts. Nothing is cached between calls. A failed invocation
//! surfaces as [`TmuxError::Unavailable`]; the pane observer treats that as
//! "no panes this tick for this host" and carries on.

use std::process::Command;

use tracing::debug;

use crate::config::SshConfig;
use crate::error::TmuxError;

const PANE_FORMAT: &str = "#{pane_id}\t#{session_name}\t#{window_name}\t#{pane_title}\t#{?pane_active,1,0}\t#{pane_width}\t#{pane_height}";

/// One pane as reported by `list-panes -a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub pane_id: String,
    pub session_name: String,
    pub window_name: String,
    pub pane_title: String,
    pub is_active: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Capability surface the observer, dispatcher, and session helpers consume.
pub trait Tmux: Send + Sync {
    fn list_panes(&self) -> Result<Vec<PaneInfo>, TmuxError>;

    /// Capture the most recent `capture_lines` of scrollback plus the
    /// visible screen of a pane.
    fn capture_pane(&self, pane_id: &str, capture_lines: u32) -> Result<String, TmuxError>;

    /// Send literal text. Embedded newlines become `C-m` between segments;
    /// a trailing `C-m` is appended iff `enter`. Empty text with
    /// `enter=true` sends a lone `C-m`.
    fn send_keys(&self, pane_id: &str, text: &str, enter: bool) -> Result<(), TmuxError>;

    /// Send raw key tokens (for example `C-c`), forwarded literally, with a
    /// trailing `C-m` iff `enter`.
    fn send_key_tokens(
        &self,
        pane_id: &str,
        keys: &[String],
        enter: bool,
    ) -> Result<(), TmuxError>;

    /// Wire pane output to an external command. tmux itself makes the
    /// re-issue of an identical pipe a no-op on the destination.
    fn pipe_pane(&self, pane_id: &str, command: &str, append: bool) -> Result<(), TmuxError>;

    fn new_session(
        &self,
        session_name: &str,
        start_directory: Option<&str>,
    ) -> Result<(), TmuxError>;

    fn kill_session(&self, session_name: &str) -> Result<(), TmuxError>;

    fn session_exists(&self, session_name: &str) -> bool;

    fn list_sessions(&self) -> Result<Vec<String>, TmuxError>;

    fn panes_for_session(&self, session_name: &str) -> Result<Vec<PaneInfo>, TmuxError> {
        Ok(self
            .list_panes()?
            .into_iter()
            .filter(|pane| pane.session_name == session_name)
            .collect())
    }
}

/// Build the `ssh` invocation prefix for a remote host. Shared with the
/// shell-action dispatcher so actions and tmux calls route identically.
pub(crate) fn ssh_base_command(ssh: &SshConfig) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(["-o", "BatchMode=yes"]);
    cmd.args(["-o", &format!("ConnectTimeout={}", ssh.timeout)]);
    cmd.args(["-p", &ssh.port.to_string()]);
    if let Some(key) = &ssh.key_path {
        cmd.args(["-i", key]);
    }
    cmd.arg(ssh.target());
    cmd
}

/// Real adapter that shells out to the tmux binary, locally or over ssh.
pub struct TmuxAdapter {
    tmux_bin: String,
    socket: Option<String>,
    ssh: Option<SshConfig>,
}

impl TmuxAdapter {
    pub fn new(tmux_bin: &str, socket: Option<&str>, ssh: Option<SshConfig>) -> Self {
        // "default" means the default server socket; passing -L default
        // would fork a second server namespace.
        let socket = socket.filter(|s| !s.is_empty() && *s != "default");
        Self {
            tmux_bin: tmux_bin.to_string(),
            socket: socket.map(str::to_string),
            ssh,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let mut tmux_args: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(socket) = &self.socket {
            tmux_args.push("-L");
            tmux_args.push(socket);
        }
        tmux_args.extend_from_slice(args);

        let mut cmd = match &self.ssh {
            Some(ssh) => {
                let mut cmd = ssh_base_command(ssh);
                cmd.arg(&self.tmux_bin);
                cmd.args(&tmux_args);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.tmux_bin);
                cmd.args(&tmux_args);
                cmd
            }
        };

        let output = cmd
            .output()
            .map_err(|e| TmuxError::Unavailable(format!("{}: {e}", self.tmux_bin)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TmuxError::Unavailable(format!(
                "tmux {} failed: {stderr}",
                args.first().copied().unwrap_or("")
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Tmux for TmuxAdapter {
    fn list_panes(&self) -> Result<Vec<PaneInfo>, TmuxError> {
        let stdout = self.run(&["list-panes", "-a", "-F", PANE_FORMAT])?;
        let mut panes = Vec::new();
        for line in stdout.lines() {
            if line.is_empty() {
                continue;
            }
            match parse_pane_line(line) {
                Some(pane) => panes.push(pane),
                None => debug!(line, "skipping unparseable list-panes line"),
            }
        }
        Ok(panes)
    }

    fn capture_pane(&self, pane_id: &str, capture_lines: u32) -> Result<String, TmuxError> {
        self.run(&[
            "capture-pane",
            "-p",
            "-t",
            pane_id,
            "-S",
            &format!("-{capture_lines}"),
        ])
    }

    fn send_keys(&self, pane_id: &str, text: &str, enter: bool) -> Result<(), TmuxError> {
        let chunks: Vec<&str> = text.split('\n').collect();
        for (idx, chunk) in chunks.iter().copied().enumerate() {
            let mut args = vec!["send-keys", "-t", pane_id];
            if !chunk.is_empty() {
                args.push(chunk);
            }
            let is_last = idx == chunks.len() - 1;
            if !is_last || enter {
                args.push("C-m");
            }
            self.run(&args)?;
        }
        debug!(pane_id, enter, "sent keys");
        Ok(())
    }

    fn send_key_tokens(
        &self,
        pane_id: &str,
        keys: &[String],
        enter: bool,
    ) -> Result<(), TmuxError> {
        let mut args = vec!["send-keys", "-t", pane_id];
        args.extend(keys.iter().map(String::as_str));
        if enter {
            args.push("C-m");
        }
        self.run(&args)?;
        Ok(())
    }

    fn pipe_pane(&self, pane_id: &str, command: &str, append: bool) -> Result<(), TmuxError> {
        let mut args = vec!["pipe-pane", "-t", pane_id];
        if append {
            args.push("-o");
        }
        args.push(command);
        self.run(&args)?;
        Ok(())
    }

    fn new_session(
        &self,
        session_name: &str,
        start_directory: Option<&str>,
    ) -> Result<(), TmuxError> {
        let mut args = vec!["new-session", "-d", "-s", session_name];
        if let Some(dir) = start_directory {
            args.push("-c");
            args.push(dir);
        }
        self.run(&args)?;
        Ok(())
    }

    fn kill_session(&self, session_name: &str) -> Result<(), TmuxError> {
        self.run(&["kill-session", "-t", session_name])?;
        Ok(())
    }

    fn session_exists(&self, session_name: &str) -> bool {
        self.run(&["has-session", "-t", session_name]).is_ok()
    }

    fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        let stdout = self.run(&["list-sessions", "-F", "#{session_name}"])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let mut parts: Vec<&str> = line.split('\t').collect();
    if parts.is_empty() || parts[0].is_empty() {
        return None;
    }
    while parts.len() < 7 {
        parts.push("");
    }
    Some(PaneInfo {
        pane_id: parts[0].to_string(),
        session_name: parts[1].to_string(),
        window_name: parts[2].to_string(),
        pane_title: parts[3].to_string(),
        is_active: parts[4] == "1",
        width: parts[5].parse().ok(),
        height: parts[6].parse().ok(),
    })
}


#[cfg(test)]
mod tests {
    use super::fake::FakeTmux;
    use super::*;

    #[test]
    fn parse_pane_line_full() {
        let pane = parse_pane_line("%3\tmain\tbuild\tworker\t1\t220\t50").unwrap();
        assert_eq!(pane.pane_id, "%3");
        assert_eq!(pane.session_name, "main");
        assert_eq!(pane.window_name, "build");
        assert_eq!(pane.pane_title, "worker");
        assert!(pane.is_active);
        assert_eq!(pane.width, Some(220));
        assert_eq!(pane.height, Some(50));
    }

    #[test]
    fn parse_pane_line_pads_missing_fields() {
        let pane = parse_pane_line("%7\tsess").unwrap();
        assert_eq!(pane.pane_id, "%7");
        assert_eq!(pane.session_name, "sess");
        assert_eq!(pane.window_name, "");
        assert!(!pane.is_active);
        assert_eq!(pane.width, None);
    }

    #[test]
    fn parse_pane_line_rejects_empty_pane_id() {
        assert!(parse_pane_line("\tsess\twin").is_none());
        assert!(parse_pane_line("").is_none());
    }

    #[test]
    fn fake_records_send_keys() {
        let tmux = FakeTmux::new();
        tmux.add_pane("%1", "sess", "win", "title");
        tmux.send_keys("%1", "npm run lint", true).unwrap();

        let sent = tmux.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].pane_id, "%1");
        assert_eq!(sent[0].keys, "npm run lint");
        assert!(sent[0].enter);
    }

    #[test]
    fn fake_panes_for_session_filters() {
        let tmux = FakeTmux::new();
        tmux.add_pane("%1", "a", "w", "t");
        tmux.add_pane("%2", "b", "w", "t");
        tmux.add_pane("%3", "a", "w", "t");

        let panes = tmux.panes_for_session("a").unwrap();
        let ids: Vec<&str> = panes.iter().map(|p| p.pane_id.as_str()).collect();
        assert_eq!(ids, vec!["%1", "%3"]);
    }

    #[test]
    fn fake_session_lifecycle() {
        let tmux = FakeTmux::new();
        assert!(!tmux.session_exists("agent-x"));
        tmux.new_session("agent-x", None).unwrap();
        assert!(tmux.session_exists("agent-x"));
        assert_eq!(tmux.panes_for_session("agent-x").unwrap().len(), 1);

        // Duplicate creation is an error, kill is idempotent.
        assert!(tmux.new_session("agent-x", None).is_err());
        tmux.kill_session("agent-x").unwrap();
        tmux.kill_session("agent-x").unwrap();
        assert!(!tmux.session_exists("agent-x"));
    }

    #[test]
    fn fake_pipe_pane_records_destination() {
        let tmux = FakeTmux::new();
        tmux.add_pane("%1", "sess", "win", "title");
        tmux.pipe_pane("%1", "cat >> /tmp/agent.log", true).unwrap();
        // Re-issuing the same pipe is a no-op on the destination.
        tmux.pipe_pane("%1", "cat >> /tmp/agent.log", true).unwrap();
        assert_eq!(tmux.piped()["%1"], "cat >> /tmp/agent.log");
    }

    #[test]
    fn local_adapter_reports_unavailable_for_missing_binary() {
        let adapter = TmuxAdapter::new("definitely-not-a-tmux-binary-xyz", None, None);
        let err = adapter.list_panes().unwrap_err();
        assert!(matches!(err, TmuxError::Unavailable(_)));
    }

    #[test]
    fn default_socket_is_not_passed() {
        let adapter = TmuxAdapter::new("tmux", Some("default"), None);
        assert!(adapter.socket.is_none());
        let adapter = TmuxAdapter::new("tmux", Some("agents"), None);
        assert_eq!(adapter.socket.as_deref(), Some("agents"));
    }
}
