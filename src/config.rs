//! Configuration documents: the agent config and the policy document, both
//! YAML. The orchestrator's TOML config lives in `orchestrator`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_tmux_bin() -> String {
    "tmux".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("~/.sentry/state.db")
}

fn default_approval_dir() -> PathBuf {
    PathBuf::from("~/.sentry/approvals")
}

fn default_bus_dir() -> PathBuf {
    PathBuf::from("~/.sentry/bus")
}

fn default_notify() -> String {
    "stdout".to_string()
}

fn default_host_name() -> String {
    "local".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_timeout() -> u64 {
    30
}

fn default_capture_lines() -> u32 {
    2000
}

fn default_tmux_socket() -> String {
    "default".to_string()
}

/// SSH connection options for a remote tmux host.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, alias = "key")]
    pub key_path: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_ssh_timeout")]
    pub timeout: u64,
}

impl SshConfig {
    pub fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// tmux interaction options for a host.
#[derive(Debug, Clone, Deserialize)]
pub struct TmuxOptions {
    #[serde(default = "default_tmux_socket")]
    pub socket: String,
    #[serde(default)]
    pub session_filters: Vec<String>,
    #[serde(default)]
    pub pane_name_patterns: Vec<String>,
    #[serde(default = "default_capture_lines")]
    pub capture_lines: u32,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl Default for TmuxOptions {
    fn default() -> Self {
        Self {
            socket: default_tmux_socket(),
            session_filters: Vec::new(),
            pane_name_patterns: Vec::new(),
            capture_lines: default_capture_lines(),
            poll_interval_ms: None,
        }
    }
}

/// One monitored tmux host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_host_name")]
    pub name: String,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub tmux: TmuxOptions,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            ssh: None,
            tmux: TmuxOptions::default(),
        }
    }
}

/// Top-level agent configuration (YAML).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_tmux_bin")]
    pub tmux_bin: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default = "default_approval_dir")]
    pub approval_dir: PathBuf,
    #[serde(default = "default_bus_dir")]
    pub bus_dir: PathBuf,
    /// Comma-separated notification channel list.
    #[serde(default = "default_notify")]
    pub notify: String,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            tmux_bin: default_tmux_bin(),
            sqlite_path: default_sqlite_path(),
            approval_dir: default_approval_dir(),
            bus_dir: default_bus_dir(),
            notify: default_notify(),
            hosts: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn expanded_sqlite_path(&self) -> PathBuf {
        expand_user(&self.sqlite_path)
    }

    pub fn expanded_approval_dir(&self) -> PathBuf {
        expand_user(&self.approval_dir)
    }

    pub fn expanded_bus_dir(&self) -> PathBuf {
        expand_user(&self.bus_dir)
    }
}

/// Replace a leading `~` with `$HOME`. Paths without a tilde pass through.
pub fn expand_user(path: &Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(stripped),
        None => path.to_path_buf(),
    }
}

pub fn load_agent_config(path: &Path) -> Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read agent config {}", path.display()))?;
    let mut config: AgentConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("invalid agent config at {}", path.display()))?;
    if config.hosts.is_empty() {
        config.hosts.push(HostConfig::default());
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Policy document
// ---------------------------------------------------------------------------

/// One condition inside a trigger group. Any non-empty subset of the fields
/// may be set; the trigger fires when any present field matches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerSpec {
    #[serde(default)]
    pub log_regex: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub after_stage_success: Option<String>,
}

/// A labelled group of triggers. `any_of` groups OR their members, `all_of`
/// groups AND theirs; a block carrying both labels requires both groups.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerBlock {
    #[serde(default)]
    pub any_of: Vec<TriggerSpec>,
    #[serde(default)]
    pub all_of: Vec<TriggerSpec>,
}

impl TriggerBlock {
    pub fn is_empty(&self) -> bool {
        self.any_of.is_empty() && self.all_of.is_empty()
    }
}

/// A side effect emitted when a stage starts (or retries).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub send_keys: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrySpec {
    #[serde(default)]
    pub max: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IfStillFail {
    #[serde(default)]
    pub ask_human: Option<String>,
    #[serde(default)]
    pub escalate: Option<String>,
}

/// One entry of a stage's ordered fault-handler list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OnFailEntry {
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    #[serde(default)]
    pub ask_human: Option<String>,
    #[serde(default)]
    pub escalate: Option<String>,
    #[serde(default)]
    pub if_still_fail: Option<IfStillFail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageDoc {
    pub name: String,
    #[serde(default)]
    pub triggers: Option<TriggerBlock>,
    #[serde(default)]
    pub actions_on_start: Vec<ActionSpec>,
    #[serde(default)]
    pub success_when: Option<TriggerBlock>,
    #[serde(default)]
    pub fail_when: Option<TriggerBlock>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub on_fail: Vec<OnFailEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineMatcher {
    #[serde(default)]
    pub window_name: Option<String>,
    #[serde(default)]
    pub pane_title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchBlock {
    #[serde(default)]
    pub any_of: Vec<PipelineMatcher>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDoc {
    pub name: String,
    #[serde(rename = "match", default)]
    pub match_block: MatchBlock,
    pub stages: Vec<StageDoc>,
}

/// The policy document. Unknown top-level keys are rejected so typos do not
/// silently disable pipelines.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDoc {
    #[serde(default)]
    pub principles: Vec<String>,
    pub pipelines: Vec<PipelineDoc>,
}

pub fn load_policy(path: &Path) -> Result<PolicyDoc> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("invalid policy at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE_POLICY: &str = r#"
principles:
  - "never force-push"
pipelines:
  - name: ci
    match:
      any_of:
        - window_name: "build-.*"
        - pane_title: "worker"
    stages:
      - name: lint
        triggers:
          any_of:
            - log_regex: "run lint"
        actions_on_start:
          - send_keys: "npm run lint"
        success_when:
          any_of:
            - log_regex: "lint ok"
        fail_when:
          any_of:
            - log_regex: "lint failed"
        on_fail:
          - retry:
              max: 2
          - if_still_fail:
              ask_human: "lint keeps failing"
              escalate: lint_failure
      - name: build
        triggers:
          all_of:
            - after_stage_success: lint
        require_approval: true
        actions_on_start:
          - send_keys: "npm run build"
        success_when:
          any_of:
            - message_type: STATUS
"#;

    #[test]
    fn parse_sample_policy() {
        let doc: PolicyDoc = serde_yaml::from_str(SAMPLE_POLICY).unwrap();
        assert_eq!(doc.principles.len(), 1);
        assert_eq!(doc.pipelines.len(), 1);

        let pipeline = &doc.pipelines[0];
        assert_eq!(pipeline.name, "ci");
        assert_eq!(pipeline.match_block.any_of.len(), 2);
        assert_eq!(pipeline.stages.len(), 2);

        let lint = &pipeline.stages[0];
        assert_eq!(lint.name, "lint");
        assert!(!lint.require_approval);
        assert_eq!(lint.on_fail.len(), 2);
        assert_eq!(lint.on_fail[0].retry.as_ref().unwrap().max, 2);
        let still = lint.on_fail[1].if_still_fail.as_ref().unwrap();
        assert_eq!(still.escalate.as_deref(), Some("lint_failure"));

        let build = &pipeline.stages[1];
        assert!(build.require_approval);
        assert_eq!(
            build.triggers.as_ref().unwrap().all_of[0]
                .after_stage_success
                .as_deref(),
            Some("lint")
        );
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let raw = "pipelines: []\npiplines_typo: []\n";
        assert!(serde_yaml::from_str::<PolicyDoc>(raw).is_err());
    }

    #[test]
    fn agent_config_defaults() {
        let config: AgentConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.poll_interval_ms, 1500);
        assert_eq!(config.tmux_bin, "tmux");
        assert_eq!(config.notify, "stdout");
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn agent_config_with_hosts() {
        let raw = r#"
poll_interval_ms: 500
notify: "stdout,bus"
hosts:
  - name: devbox
    ssh:
      host: dev.example.com
      user: ops
      key: ~/.ssh/id_ed25519
      timeout: 10
    tmux:
      socket: agents
      session_filters: ["^agent-"]
      capture_lines: 500
      poll_interval_ms: 750
"#;
        let config: AgentConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.hosts.len(), 1);

        let host = &config.hosts[0];
        assert_eq!(host.name, "devbox");
        let ssh = host.ssh.as_ref().unwrap();
        assert_eq!(ssh.host, "dev.example.com");
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.timeout, 10);
        assert_eq!(ssh.target(), "ops@dev.example.com");
        assert_eq!(ssh.key_path.as_deref(), Some("~/.ssh/id_ed25519"));
        assert_eq!(host.tmux.socket, "agents");
        assert_eq!(host.tmux.capture_lines, 500);
        assert_eq!(host.tmux.poll_interval_ms, Some(750));
    }

    #[test]
    fn load_agent_config_defaults_local_host() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.yaml");
        fs::write(&path, "poll_interval_ms: 2000\n").unwrap();

        let config = load_agent_config(&path).unwrap();
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[0].name, "local");
        assert!(config.hosts[0].ssh.is_none());
    }

    #[test]
    fn load_agent_config_missing_file_errors_with_path() {
        let err = load_agent_config(Path::new("/nonexistent/agent.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/agent.yaml"));
    }

    #[test]
    fn load_policy_reports_invalid_document() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("policy.yaml");
        fs::write(&path, "pipelines: 42\n").unwrap();

        let err = load_policy(&path).unwrap_err();
        assert!(err.to_string().contains("policy.yaml"));
    }

    #[test]
    fn expand_user_substitutes_home() {
        let home = std::env::var("HOME").unwrap();
        let expanded = expand_user(Path::new("~/.sentry/state.db"));
        assert!(expanded.starts_with(&home));
        // Non-tilde paths pass through unchanged.
        assert_eq!(
            expand_user(Path::new("/var/lib/sentry")),
            PathBuf::from("/var/lib/sentry")
        );
    }

    #[test]
    fn ssh_target_without_user() {
        let ssh: SshConfig = serde_yaml::from_str("host: 10.0.0.2").unwrap();
        assert_eq!(ssh.target(), "10.0.0.2");
    }
}
