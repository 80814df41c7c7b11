//! Client for the external decision CLI ("the advisor").
//!
//! The advisor receives a rendered prompt on stdin and is expected to print
//! one JSON object on stdout. Real CLIs wrap that object in Markdown fences,
//! stream JSONL event envelopes, or drown it in prose, so decoding is a
//! ladder: fence strip, JSONL scan with graceful degradation, direct parse,
//! then largest-balanced-segment extraction. The advisor is advisory only;
//! every failure here is recorded and retried on the next cycle.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::state::JsonMap;

/// Extra key planted on decisions synthesized from a failed advisor run.
/// The orchestrator mirrors it into the session's `orchestrator_error`.
pub const ADVISOR_ERROR_KEY: &str = "advisor_error";

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor executable not found: {0}")]
    MissingExecutable(String),
    #[error("advisor CLI timed out after {0}s")]
    Timeout(u64),
    #[error("advisor CLI failed with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("advisor returned empty output")]
    EmptyOutput,
    #[error("advisor output could not be parsed as JSON: {0}")]
    JsonParse(String),
    #[error("advisor output is not a JSON object")]
    InvalidPayloadType,
    #[error("advisor I/O failed: {0}")]
    Io(String),
}

/// One command suggestion from a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSuggestion {
    /// Literal text to type. May be absent when `keys` carries the input.
    pub text: Option<String>,
    pub session: Option<String>,
    pub enter: bool,
    pub cwd: Option<String>,
    pub risk_level: String,
    pub notes: Option<String>,
    /// Raw key tokens such as `C-c`.
    pub keys: Vec<String>,
    pub input_mode: Option<String>,
}

/// Normalized decision payload.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub summary: Option<String>,
    pub commands: Vec<CommandSuggestion>,
    pub notify: Option<String>,
    pub requires_confirmation: bool,
    pub phase: Option<String>,
    pub blockers: Vec<String>,
    pub extra: JsonMap,
}

impl Decision {
    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    /// The failure detail when this decision was synthesized from an
    /// advisor error event rather than a real reply.
    pub fn advisor_error(&self) -> Option<&str> {
        self.extra.get(ADVISOR_ERROR_KEY).and_then(Value::as_str)
    }
}

/// The seam the orchestrator drives. Production uses [`AdvisorClient`];
/// tests queue canned decisions.
pub trait Advise {
    fn run(&self, prompt: &str) -> Result<Decision, AdvisorError>;
    fn run_summary(&self, prompt: &str) -> Result<String, AdvisorError>;
}

pub struct AdvisorClient {
    executable: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl AdvisorClient {
    pub fn new(executable: Vec<String>, env: HashMap<String, String>, timeout: Duration) -> Self {
        Self {
            executable,
            env,
            timeout,
        }
    }

    fn invoke(&self, prompt: &str) -> Result<String, AdvisorError> {
        let program = self
            .executable
            .first()
            .ok_or_else(|| AdvisorError::MissingExecutable("(empty command)".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.executable[1..]);
        cmd.env("LC_ALL", "en_US.UTF-8");
        cmd.envs(&self.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AdvisorError::MissingExecutable(program.clone())
            } else {
                AdvisorError::Io(e.to_string())
            }
        })?;

        // Drain stdout/stderr on the side so a chatty advisor cannot block
        // on a full pipe while we wait for it to exit.
        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            use std::io::Read;
            let _ = stdout_pipe.read_to_end(&mut buf);
            buf
        });
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            use std::io::Read;
            let _ = stderr_pipe.read_to_end(&mut buf);
            buf
        });

        // Prompt terminated by a blank line, then stdin closes.
        let mut payload = prompt.trim().to_string();
        payload.push_str("\n\n");
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(payload.as_bytes());
        }

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(AdvisorError::Timeout(self.timeout.as_secs()));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(AdvisorError::Io(e.to_string())),
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_thread.join().unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_thread.join().unwrap_or_default()).into_owned();

        if !status.success() {
            return Err(AdvisorError::NonZeroExit {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        debug!(bytes = stdout.len(), "advisor replied");
        Ok(stdout)
    }
}

impl Advise for AdvisorClient {
    /// Run the advisor and decode its reply into a decision.
    fn run(&self, prompt: &str) -> Result<Decision, AdvisorError> {
        let stdout = self.invoke(prompt)?;
        let map = load_json_object(&stdout)?;
        Ok(normalize_decision(map))
    }

    /// Summary mode: prefer the `summary` field of a JSON reply, fall back
    /// to the raw text for plain-prose advisors.
    fn run_summary(&self, prompt: &str) -> Result<String, AdvisorError> {
        let stdout = self.invoke(prompt)?;
        match load_json_object(&stdout) {
            Ok(map) => match map.get("summary").and_then(Value::as_str) {
                Some(summary) if !summary.trim().is_empty() => Ok(summary.trim().to_string()),
                _ => Err(AdvisorError::JsonParse(
                    "summary reply missing 'summary' field".to_string(),
                )),
            },
            Err(_) => Ok(stdout.trim().to_string()),
        }
    }
}

/// Scripted advisor for tests: queued decisions and recorded prompts.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::{Advise, AdvisorError, Decision};

    #[derive(Default)]
    struct Inner {
        decisions: VecDeque<Result<Decision, AdvisorError>>,
        summaries: VecDeque<String>,
        prompts: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeAdvisor {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeAdvisor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_decision(&self, decision: Decision) {
            self.inner.lock().unwrap().decisions.push_back(Ok(decision));
        }

        pub fn push_error(&self, error: AdvisorError) {
            self.inner.lock().unwrap().decisions.push_back(Err(error));
        }

        pub fn push_summary(&self, summary: &str) {
            self.inner
                .lock()
                .unwrap()
                .summaries
                .push_back(summary.to_string());
        }

        pub fn prompts(&self) -> Vec<String> {
            self.inner.lock().unwrap().prompts.clone()
        }
    }

    impl Advise for FakeAdvisor {
        fn run(&self, prompt: &str) -> Result<Decision, AdvisorError> {
            let mut inner = self.inner.lock().unwrap();
            inner.prompts.push(prompt.to_string());
            inner
                .decisions
                .pop_front()
                .unwrap_or(Err(AdvisorError::EmptyOutput))
        }

        fn run_summary(&self, _prompt: &str) -> Result<String, AdvisorError> {
            self.inner
                .lock()
                .unwrap()
                .summaries
                .pop_front()
                .ok_or(AdvisorError::EmptyOutput)
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding ladder
// ---------------------------------------------------------------------------

fn load_json_object(payload: &str) -> Result<JsonMap, AdvisorError> {
    if let Some(map) = parse_jsonl_stream(payload)? {
        return Ok(map);
    }

    let normalized = normalize_payload(payload)?;
    let mut attempts = vec![normalized.clone()];
    let segment = extract_json_segment(&normalized);
    if segment != normalized {
        attempts.push(segment);
    }

    for candidate in &attempts {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => return Ok(map),
            Ok(_) => return Err(AdvisorError::InvalidPayloadType),
            Err(_) => continue,
        }
    }
    Err(AdvisorError::JsonParse(summarize_payload(
        attempts.last().map(String::as_str).unwrap_or(""),
    )))
}

/// Scan JSONL event streams (one JSON object per line) for a user-visible
/// message to recurse into. When no message ever arrives, degrade: the last
/// reasoning text becomes the summary, then the last command output, and a
/// terminal error event synthesizes an error decision.
fn parse_jsonl_stream(payload: &str) -> Result<Option<JsonMap>, AdvisorError> {
    let mut last_reasoning: Option<String> = None;
    let mut last_command_output: Option<String> = None;
    let mut last_error: Option<String> = None;
    let mut saw_event = false;

    for raw in payload.lines() {
        let line = raw.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        if let Some(Value::Object(msg)) = data.get("msg") {
            saw_event = true;
            match msg.get("type").and_then(Value::as_str) {
                Some("agent_message" | "assistant_message") => {
                    let text = msg
                        .get("message")
                        .and_then(Value::as_str)
                        .filter(|s| !s.trim().is_empty());
                    if let Some(text) = text {
                        if let Some(map) = interpret_assistant_message(text)? {
                            return Ok(Some(map));
                        }
                    }
                }
                Some("agent_reasoning") => {
                    let text = msg
                        .get("text")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty());
                    if let Some(text) = text {
                        last_reasoning = Some(text.to_string());
                    }
                }
                Some("agent_error" | "task_failed") => {
                    let detail = msg
                        .get("error")
                        .or_else(|| msg.get("message"))
                        .or_else(|| msg.get("text"))
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| Value::Object(msg.clone()).to_string());
                    last_error = Some(detail);
                }
                Some("exec_command_end") => {
                    let output = ["formatted_output", "aggregated_output", "stderr", "stdout"]
                        .iter()
                        .find_map(|key| msg.get(*key).and_then(Value::as_str))
                        .map(str::trim)
                        .filter(|s| !s.is_empty());
                    if let Some(output) = output {
                        last_command_output = Some(output.to_string());
                    }
                }
                _ => {}
            }
            continue;
        }

        match data.get("type").and_then(Value::as_str) {
            Some("item.completed") => {
                saw_event = true;
                let Some(Value::Object(item)) = data.get("item") else {
                    continue;
                };
                let item_type = item
                    .get("item_type")
                    .or_else(|| item.get("type"))
                    .and_then(Value::as_str);
                let Some(text) = item.get("text").and_then(Value::as_str) else {
                    continue;
                };
                match item_type {
                    Some("assistant_message" | "output_text" | "assistant") => {
                        if let Some(map) = interpret_assistant_message(text)? {
                            return Ok(Some(map));
                        }
                    }
                    Some("reasoning" | "analysis") => {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            last_reasoning = Some(trimmed.to_string());
                        }
                    }
                    _ => {}
                }
            }
            Some("error" | "response.error") => {
                saw_event = true;
                let detail = data
                    .get("detail")
                    .or_else(|| data.get("error"))
                    .or_else(|| data.get("message"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                if let Some(detail) = detail {
                    last_error = Some(detail.to_string());
                }
            }
            _ => {}
        }
    }

    if let Some(detail) = last_error {
        let summary = format!("Advisor run failed: {detail}");
        let mut map = JsonMap::new();
        map.insert("summary".to_string(), json!(summary));
        map.insert("commands".to_string(), json!([]));
        map.insert("requires_confirmation".to_string(), json!(true));
        map.insert("notify".to_string(), json!(summary));
        map.insert(ADVISOR_ERROR_KEY.to_string(), json!(detail));
        return Ok(Some(map));
    }
    if let Some(reasoning) = last_reasoning {
        let mut summary = reasoning;
        if let Some(output) = &last_command_output {
            let last_line = output
                .lines()
                .last()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !summary.contains(*line));
            if let Some(last_line) = last_line {
                summary = format!("{summary}\nlast output: {last_line}");
            }
        }
        let mut map = JsonMap::new();
        map.insert("summary".to_string(), json!(summary));
        map.insert("commands".to_string(), json!([]));
        map.insert("requires_confirmation".to_string(), json!(false));
        return Ok(Some(map));
    }
    if let Some(output) = last_command_output {
        let mut map = JsonMap::new();
        map.insert("summary".to_string(), json!(output));
        map.insert("commands".to_string(), json!([]));
        map.insert("requires_confirmation".to_string(), json!(false));
        return Ok(Some(map));
    }
    // A pure JSONL stream with no usable content should not fall through to
    // the plain-JSON parser, but a single-object payload must.
    let _ = saw_event;
    Ok(None)
}

fn interpret_assistant_message(message: &str) -> Result<Option<JsonMap>, AdvisorError> {
    let cleaned = strip_code_fence(message.trim());
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Value>(cleaned) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(AdvisorError::InvalidPayloadType),
        Err(_) => {
            // Plain prose: treat the whole message as the summary.
            let mut map = JsonMap::new();
            map.insert("summary".to_string(), json!(cleaned));
            map.insert("commands".to_string(), json!([]));
            map.insert("requires_confirmation".to_string(), json!(false));
            Ok(Some(map))
        }
    }
}

fn normalize_payload(payload: &str) -> Result<String, AdvisorError> {
    let text = payload.trim();
    if text.is_empty() {
        return Err(AdvisorError::EmptyOutput);
    }
    Ok(strip_code_fence(text).trim().to_string())
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (```json) up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body)
}

/// Pull the largest brace- or bracket-balanced substring that parses.
fn extract_json_segment(text: &str) -> String {
    for (open, close) in [('{', '}'), ('[', ']')] {
        let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) else {
            continue;
        };
        if end <= start {
            continue;
        }
        let candidate = &text[start..=end];
        if serde_json::from_str::<Value>(candidate).is_ok() {
            return candidate.to_string();
        }
    }
    text.to_string()
}

fn summarize_payload(payload: &str) -> String {
    let compact = payload.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= 200 {
        compact
    } else {
        let truncated: String = compact.chars().take(197).collect();
        format!("{truncated}...")
    }
}

fn normalize_decision(map: JsonMap) -> Decision {
    let summary = map
        .get("summary")
        .and_then(Value::as_str)
        .map(str::to_string);
    let notify = map
        .get("notify")
        .and_then(Value::as_str)
        .map(str::to_string);
    let requires_confirmation = map
        .get("requires_confirmation")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let phase = map
        .get("phase")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut commands = Vec::new();
    if let Some(Value::Array(entries)) = map.get("commands") {
        for entry in entries {
            let Value::Object(item) = entry else { continue };
            if let Some(command) = normalize_command(item) {
                commands.push(command);
            }
        }
    }

    let blockers = match map.get("blockers") {
        Some(Value::String(text)) => text.lines().map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    };

    const KNOWN_KEYS: [&str; 6] = [
        "summary",
        "commands",
        "notify",
        "requires_confirmation",
        "phase",
        "blockers",
    ];
    let extra: JsonMap = map
        .into_iter()
        .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
        .collect();

    Decision {
        summary,
        commands,
        notify,
        requires_confirmation,
        phase,
        blockers,
        extra,
    }
}

fn normalize_command(item: &JsonMap) -> Option<CommandSuggestion> {
    let text = item
        .get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let keys: Vec<String> = match item.get("keys") {
        Some(Value::String(key)) => {
            let key = key.trim();
            if key.is_empty() {
                Vec::new()
            } else {
                vec![key.to_string()]
            }
        }
        Some(Value::Array(values)) => values
            .iter()
            .map(|value| match value {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    // A suggestion with neither text nor keys cannot be enacted.
    if text.is_none() && keys.is_empty() {
        return None;
    }

    Some(CommandSuggestion {
        text,
        session: item
            .get("session")
            .and_then(Value::as_str)
            .map(str::to_string),
        enter: item.get("enter").and_then(Value::as_bool).unwrap_or(true),
        cwd: item.get("cwd").and_then(Value::as_str).map(str::to_string),
        risk_level: item
            .get("risk_level")
            .and_then(Value::as_str)
            .unwrap_or("low")
            .to_lowercase(),
        notes: item
            .get("notes")
            .and_then(Value::as_str)
            .map(str::to_string),
        keys,
        input_mode: item
            .get("input_mode")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(payload: &str) -> Decision {
        normalize_decision(load_json_object(payload).unwrap())
    }

    #[test]
    fn direct_json_object_decodes() {
        let decision = decode(
            r#"{"summary": "all good", "commands": [{"text": "cargo test"}], "phase": "verifying"}"#,
        );
        assert_eq!(decision.summary.as_deref(), Some("all good"));
        assert_eq!(decision.commands.len(), 1);
        assert_eq!(decision.commands[0].text.as_deref(), Some("cargo test"));
        assert!(decision.commands[0].enter);
        assert_eq!(decision.commands[0].risk_level, "low");
        assert_eq!(decision.phase.as_deref(), Some("verifying"));
        assert!(!decision.requires_confirmation);
    }

    #[test]
    fn fenced_json_decodes() {
        let decision = decode("```json\n{\"summary\": \"fenced\"}\n```");
        assert_eq!(decision.summary.as_deref(), Some("fenced"));
    }

    #[test]
    fn json_buried_in_prose_is_extracted() {
        let decision = decode("Here is my plan:\n{\"summary\": \"buried\"}\nHope that helps!");
        assert_eq!(decision.summary.as_deref(), Some("buried"));
    }

    #[test]
    fn non_object_top_level_is_rejected() {
        let err = load_json_object("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, AdvisorError::InvalidPayloadType));
    }

    #[test]
    fn empty_output_is_rejected() {
        let err = load_json_object("   \n").unwrap_err();
        assert!(matches!(err, AdvisorError::EmptyOutput));
    }

    #[test]
    fn garbage_reports_json_parse_error() {
        let err = load_json_object("no json anywhere here").unwrap_err();
        assert!(matches!(err, AdvisorError::JsonParse(_)));
    }

    #[test]
    fn jsonl_agent_message_with_fenced_json_decodes() {
        let payload = concat!(
            r#"{"msg": {"type": "task_started"}}"#,
            "\n",
            r#"{"msg": {"type": "agent_message", "message": "```json\n{\"summary\": \"from stream\", \"commands\": []}\n```"}}"#,
            "\n",
        );
        let decision = decode(payload);
        assert_eq!(decision.summary.as_deref(), Some("from stream"));
    }

    #[test]
    fn jsonl_task_failed_synthesizes_error_decision() {
        // Reasoning events followed by a terminal failure: the decision is
        // synthesized, carries no commands, and demands confirmation.
        let payload = concat!(
            r#"{"msg": {"type": "agent_reasoning", "text": "thinking about the build"}}"#,
            "\n",
            r#"{"msg": {"type": "agent_reasoning", "text": "still thinking"}}"#,
            "\n",
            r#"{"msg": {"type": "task_failed", "error": "Model aborted"}}"#,
            "\n",
        );
        let decision = decode(payload);
        let summary = decision.summary.clone().unwrap();
        assert!(summary.contains("Model aborted"));
        assert!(decision.commands.is_empty());
        assert!(decision.requires_confirmation);
        assert_eq!(decision.notify.as_deref(), Some(summary.as_str()));
        assert_eq!(decision.advisor_error(), Some("Model aborted"));
    }

    #[test]
    fn jsonl_reasoning_only_degrades_to_summary() {
        let payload = concat!(
            r#"{"msg": {"type": "agent_reasoning", "text": "inspecting the failing test"}}"#,
            "\n",
            r#"{"msg": {"type": "exec_command_end", "exit_code": 0, "stdout": "3 passed\n1 skipped"}}"#,
            "\n",
        );
        let decision = decode(payload);
        let summary = decision.summary.unwrap();
        assert!(summary.contains("inspecting the failing test"));
        assert!(summary.contains("1 skipped"));
        assert!(decision.commands.is_empty());
        assert!(!decision.requires_confirmation);
    }

    #[test]
    fn item_completed_assistant_message_decodes() {
        let payload = concat!(
            r#"{"type": "item.started", "item": {}}"#,
            "\n",
            r#"{"type": "item.completed", "item": {"item_type": "assistant_message", "text": "{\"summary\": \"via item\"}"}}"#,
            "\n",
        );
        let decision = decode(payload);
        assert_eq!(decision.summary.as_deref(), Some("via item"));
    }

    #[test]
    fn prose_assistant_message_becomes_summary() {
        let payload =
            r#"{"msg": {"type": "agent_message", "message": "I could not find the file."}}"#;
        let decision = decode(payload);
        assert_eq!(decision.summary.as_deref(), Some("I could not find the file."));
        assert!(decision.commands.is_empty());
    }

    #[test]
    fn command_normalization_rules() {
        let decision = decode(
            r#"{
                "summary": "s",
                "commands": [
                    {"text": "  ", "notes": "skipped: no text, no keys"},
                    {"keys": ["C-c", "", "C-m"], "enter": false},
                    {"text": "make deploy", "risk_level": "HIGH", "session": "agent-x"},
                    "not an object"
                ]
            }"#,
        );
        assert_eq!(decision.commands.len(), 2);
        assert_eq!(decision.commands[0].keys, vec!["C-c", "C-m"]);
        assert!(!decision.commands[0].enter);
        assert!(decision.commands[0].text.is_none());
        assert_eq!(decision.commands[1].risk_level, "high");
        assert_eq!(decision.commands[1].session.as_deref(), Some("agent-x"));
    }

    #[test]
    fn blockers_accept_string_or_list() {
        let decision = decode(r#"{"blockers": "a\nb"}"#);
        assert_eq!(decision.blockers, vec!["a", "b"]);
        let decision = decode(r#"{"blockers": ["x", 7]}"#);
        assert_eq!(decision.blockers, vec!["x", "7"]);
    }

    #[test]
    fn unknown_keys_land_in_extra() {
        let decision = decode(r#"{"summary": "s", "confidence": 0.9}"#);
        assert_eq!(decision.extra["confidence"], json!(0.9));
    }

    #[test]
    fn run_invokes_subprocess_and_parses() {
        let client = AdvisorClient::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > /dev/null; printf '{"summary": "live", "commands": []}'"#.to_string(),
            ],
            HashMap::new(),
            Duration::from_secs(10),
        );
        let decision = client.run("what next?").unwrap();
        assert_eq!(decision.summary.as_deref(), Some("live"));
    }

    #[test]
    fn run_summary_falls_back_to_raw_text() {
        let client = AdvisorClient::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > /dev/null; printf 'plain prose summary'".to_string(),
            ],
            HashMap::new(),
            Duration::from_secs(10),
        );
        assert_eq!(client.run_summary("p").unwrap(), "plain prose summary");
    }

    #[test]
    fn missing_executable_is_classified() {
        let client = AdvisorClient::new(
            vec!["definitely-not-an-advisor-xyz".to_string()],
            HashMap::new(),
            Duration::from_secs(1),
        );
        let err = client.run("p").unwrap_err();
        assert!(matches!(err, AdvisorError::MissingExecutable(_)));
    }

    #[test]
    fn non_zero_exit_is_classified() {
        let client = AdvisorClient::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > /dev/null; echo boom >&2; exit 3".to_string(),
            ],
            HashMap::new(),
            Duration::from_secs(10),
        );
        let err = client.run("p").unwrap_err();
        match err {
            AdvisorError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[test]
    fn slow_advisor_times_out() {
        let client = AdvisorClient::new(
            vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            HashMap::new(),
            Duration::from_millis(200),
        );
        let err = client.run("p").unwrap_err();
        assert!(matches!(err, AdvisorError::Timeout(_)));
    }
}
