//! Policy compilation and the per-pane stage state machine.
//!
//! The policy document compiles once at startup into regex-backed triggers;
//! runtime evaluation never re-parses YAML or recompiles patterns. Each tick
//! advances at most one stage per pipeline per pane: terminal stages are
//! skipped, the first non-terminal stage gets one transition attempt, and
//! evaluation stops there so a later stage never runs ahead of an earlier
//! one.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Value, json};

use crate::approvals::{ApprovalManager, ApprovalRequest, FileDecision};
use crate::config::{PipelineDoc, PolicyDoc, StageDoc, TriggerBlock, TriggerSpec};
use crate::notify::NotificationMessage;
use crate::parser::ParsedMessage;
use crate::state::{JsonMap, StageStatus, StateStore, now_ts};
use crate::tmux::PaneInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    SendKeys,
    Shell,
}

/// A side effect the dispatcher should execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub host: String,
    pub pane_id: String,
    pub kind: ActionKind,
    pub command: String,
    pub enter: bool,
}

/// Everything a single pane evaluation produced.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    pub actions: Vec<Action>,
    pub notifications: Vec<NotificationMessage>,
    pub approvals: Vec<ApprovalRequest>,
}

struct CompiledTrigger {
    log_regex: Option<Regex>,
    message_type: Option<String>,
    after_stage_success: Option<String>,
}

impl CompiledTrigger {
    fn compile(spec: &TriggerSpec) -> Result<Self> {
        let log_regex = spec
            .log_regex
            .as_deref()
            .map(|raw| Regex::new(raw).with_context(|| format!("bad log_regex {raw:?}")))
            .transpose()?;
        Ok(Self {
            log_regex,
            message_type: spec.message_type.clone(),
            after_stage_success: spec.after_stage_success.clone(),
        })
    }
}

struct CompiledBlock {
    any_of: Vec<CompiledTrigger>,
    all_of: Vec<CompiledTrigger>,
}

impl CompiledBlock {
    fn compile(block: &TriggerBlock) -> Result<Self> {
        Ok(Self {
            any_of: block
                .any_of
                .iter()
                .map(CompiledTrigger::compile)
                .collect::<Result<_>>()?,
            all_of: block
                .all_of
                .iter()
                .map(CompiledTrigger::compile)
                .collect::<Result<_>>()?,
        })
    }

    fn is_empty(&self) -> bool {
        self.any_of.is_empty() && self.all_of.is_empty()
    }
}

struct CompiledAction {
    kind: ActionKind,
    command: String,
    enter: bool,
}

struct CompiledStage {
    name: String,
    triggers: Option<CompiledBlock>,
    actions_on_start: Vec<CompiledAction>,
    success_when: Option<CompiledBlock>,
    fail_when: Option<CompiledBlock>,
    require_approval: bool,
    retry_max: u32,
    ask_human_prompt: Option<String>,
    escalate_code: Option<String>,
}

impl CompiledStage {
    fn compile(stage: &StageDoc) -> Result<Self> {
        let mut actions = Vec::new();
        for spec in &stage.actions_on_start {
            if let Some(keys) = &spec.send_keys {
                actions.push(CompiledAction {
                    kind: ActionKind::SendKeys,
                    command: keys.clone(),
                    enter: true,
                });
            }
            if let Some(shell) = &spec.shell {
                actions.push(CompiledAction {
                    kind: ActionKind::Shell,
                    command: shell.clone(),
                    enter: false,
                });
            }
        }

        // Flatten the ordered fault-handler list; later entries override.
        let mut retry_max = 0;
        let mut ask_human_prompt = None;
        let mut escalate_code = None;
        for entry in &stage.on_fail {
            if let Some(retry) = &entry.retry {
                retry_max = retry.max;
            }
            if let Some(prompt) = &entry.ask_human {
                ask_human_prompt = Some(prompt.clone());
            }
            if let Some(code) = &entry.escalate {
                escalate_code = Some(code.clone());
            }
            if let Some(still) = &entry.if_still_fail {
                if let Some(prompt) = &still.ask_human {
                    ask_human_prompt = Some(prompt.clone());
                }
                if let Some(code) = &still.escalate {
                    escalate_code = Some(code.clone());
                }
            }
        }

        Ok(Self {
            name: stage.name.clone(),
            triggers: stage
                .triggers
                .as_ref()
                .map(CompiledBlock::compile)
                .transpose()?,
            actions_on_start: actions,
            success_when: stage
                .success_when
                .as_ref()
                .map(CompiledBlock::compile)
                .transpose()?,
            fail_when: stage
                .fail_when
                .as_ref()
                .map(CompiledBlock::compile)
                .transpose()?,
            require_approval: stage.require_approval,
            retry_max,
            ask_human_prompt,
            escalate_code,
        })
    }
}

struct CompiledPipeline {
    name: String,
    window_matchers: Vec<Regex>,
    pane_matchers: Vec<Regex>,
    stages: Vec<CompiledStage>,
}

impl CompiledPipeline {
    fn compile(pipeline: &PipelineDoc) -> Result<Self> {
        let mut window_matchers = Vec::new();
        let mut pane_matchers = Vec::new();
        for matcher in &pipeline.match_block.any_of {
            if let Some(raw) = &matcher.window_name {
                window_matchers
                    .push(Regex::new(raw).with_context(|| format!("bad window_name {raw:?}"))?);
            }
            if let Some(raw) = &matcher.pane_title {
                pane_matchers
                    .push(Regex::new(raw).with_context(|| format!("bad pane_title {raw:?}"))?);
            }
        }
        let stages = pipeline
            .stages
            .iter()
            .map(CompiledStage::compile)
            .collect::<Result<_>>()
            .with_context(|| format!("in pipeline {:?}", pipeline.name))?;
        Ok(Self {
            name: pipeline.name.clone(),
            window_matchers,
            pane_matchers,
            stages,
        })
    }

    fn matches(&self, pane: &PaneInfo) -> bool {
        let window_ok = self.window_matchers.is_empty()
            || self
                .window_matchers
                .iter()
                .any(|m| m.is_match(&pane.window_name));
        let pane_ok = self.pane_matchers.is_empty()
            || self
                .pane_matchers
                .iter()
                .any(|m| m.is_match(&pane.pane_title));
        window_ok && pane_ok
    }
}

/// The compiled policy. Holds no store or approval handles; those are passed
/// per evaluation so the store stays the single shared dependency.
pub struct PolicyEngine {
    principles: Vec<String>,
    pipelines: Vec<CompiledPipeline>,
}

impl PolicyEngine {
    pub fn compile(doc: &PolicyDoc) -> Result<Self> {
        Ok(Self {
            principles: doc.principles.clone(),
            pipelines: doc
                .pipelines
                .iter()
                .map(CompiledPipeline::compile)
                .collect::<Result<_>>()?,
        })
    }

    pub fn principles(&self) -> &[String] {
        &self.principles
    }

    /// Evaluate every matching pipeline for one pane against this tick's
    /// fresh lines and parsed messages.
    pub fn evaluate(
        &self,
        store: &StateStore,
        approvals: &ApprovalManager,
        host: &str,
        pane: &PaneInfo,
        new_lines: &[String],
        messages: &[ParsedMessage],
    ) -> Result<EvaluationOutcome> {
        let mut outcome = EvaluationOutcome::default();
        for pipeline in &self.pipelines {
            if !pipeline.matches(pane) {
                continue;
            }
            self.evaluate_pipeline(
                store,
                approvals,
                pipeline,
                host,
                pane,
                new_lines,
                messages,
                &mut outcome,
            )?;
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_pipeline(
        &self,
        store: &StateStore,
        approvals: &ApprovalManager,
        pipeline: &CompiledPipeline,
        host: &str,
        pane: &PaneInfo,
        new_lines: &[String],
        messages: &[ParsedMessage],
        outcome: &mut EvaluationOutcome,
    ) -> Result<()> {
        for stage in &pipeline.stages {
            let mut state =
                store.load_stage_state(host, &pane.pane_id, &pipeline.name, &stage.name)?;
            match state.status {
                StageStatus::Completed => continue,
                // A failed stage freezes the pipeline until an external reset.
                StageStatus::Failed => break,
                _ => {}
            }

            let now = now_ts();
            match state.status {
                StageStatus::Idle | StageStatus::WaitingTrigger => {
                    let ready = match &stage.triggers {
                        None => true,
                        Some(block) if block.is_empty() => true,
                        Some(block) => self.block_matches(
                            store, block, pipeline, host, pane, new_lines, messages,
                        )?,
                    };
                    if ready {
                        if stage.require_approval {
                            state.status = StageStatus::WaitingApproval;
                            state.data = JsonMap::new();
                            state.data.insert("waiting_since".into(), json!(now));
                            state.data.insert("notified".into(), json!(true));
                            let request =
                                approvals.ensure_request(store, host, &pane.pane_id, &stage.name)?;
                            outcome.notifications.push(NotificationMessage::new(
                                format!("Approval required: {}/{}", pipeline.name, stage.name),
                                format_approval_body(&request, stage.ask_human_prompt.as_deref()),
                            ));
                            outcome.approvals.push(request);
                        } else {
                            let already_sent = state
                                .data
                                .get("action_sent")
                                .and_then(Value::as_bool)
                                .unwrap_or(false);
                            if !already_sent {
                                outcome.actions.extend(stage_actions(host, pane, stage));
                                state.data.insert("action_sent".into(), json!(true));
                            }
                            state.status = StageStatus::Running;
                        }
                    } else {
                        state.status = StageStatus::WaitingTrigger;
                    }
                }

                StageStatus::WaitingApproval => {
                    match approvals.poll_file_decision(host, &pane.pane_id, &stage.name) {
                        Some(FileDecision::Approve) => {
                            outcome.actions.extend(stage_actions(host, pane, stage));
                            state.status = StageStatus::Running;
                            state.data = JsonMap::new();
                            state.data.insert("action_sent".into(), json!(true));
                            state.data.insert("approved_at".into(), json!(now));
                            store.delete_approval_token(host, &pane.pane_id, &stage.name)?;
                        }
                        Some(FileDecision::Reject) => {
                            state.status = StageStatus::Failed;
                            state.data = JsonMap::new();
                            state.data.insert("rejected_at".into(), json!(now));
                            store.delete_approval_token(host, &pane.pane_id, &stage.name)?;
                        }
                        None => {
                            if state.data.is_empty() {
                                state.data.insert("waiting_since".into(), json!(now));
                            }
                            let request =
                                approvals.ensure_request(store, host, &pane.pane_id, &stage.name)?;
                            let notified = state
                                .data
                                .get("notified")
                                .and_then(Value::as_bool)
                                .unwrap_or(false);
                            if !notified && stage.ask_human_prompt.is_some() {
                                outcome.notifications.push(NotificationMessage::new(
                                    format!(
                                        "Manual decision needed: {}/{}",
                                        pipeline.name, stage.name
                                    ),
                                    format_approval_body(
                                        &request,
                                        stage.ask_human_prompt.as_deref(),
                                    ),
                                ));
                                state.data.insert("notified".into(), json!(true));
                            }
                            outcome.approvals.push(request);
                        }
                    }
                }

                StageStatus::Running => {
                    let success = match &stage.success_when {
                        Some(block) => self.block_matches(
                            store, block, pipeline, host, pane, new_lines, messages,
                        )?,
                        None => false,
                    };
                    let failure = match &stage.fail_when {
                        Some(block) => self.block_matches(
                            store, block, pipeline, host, pane, new_lines, messages,
                        )?,
                        None => false,
                    };
                    // Success wins when both predicates fire on the same tick.
                    if success {
                        state.status = StageStatus::Completed;
                        state.data = JsonMap::new();
                        state.data.insert("completed_at".into(), json!(now));
                    } else if failure {
                        if state.retries < stage.retry_max {
                            state.retries += 1;
                            outcome.actions.extend(stage_actions(host, pane, stage));
                            state.data = JsonMap::new();
                            state.data.insert("retry".into(), json!(state.retries));
                            state.data.insert("retry_at".into(), json!(now));
                            state.data.insert("action_sent".into(), json!(true));
                        } else if stage.ask_human_prompt.is_some() {
                            state.status = StageStatus::WaitingApproval;
                            state.data = JsonMap::new();
                            state.data.insert("waiting_since".into(), json!(now));
                            state
                                .data
                                .insert("prompt".into(), json!(stage.ask_human_prompt));
                            state.data.insert("notified".into(), json!(true));
                            let request =
                                approvals.ensure_request(store, host, &pane.pane_id, &stage.name)?;
                            outcome.notifications.push(NotificationMessage::new(
                                format!("Manual decision needed: {}/{}", pipeline.name, stage.name),
                                format_approval_body(&request, stage.ask_human_prompt.as_deref()),
                            ));
                            outcome.approvals.push(request);
                        } else {
                            state.status = StageStatus::Failed;
                            state.data = JsonMap::new();
                            state.data.insert("failed_at".into(), json!(now));
                            state.data.insert("reason".into(), json!("fail_condition"));
                            if let Some(code) = &stage.escalate_code {
                                outcome.notifications.push(NotificationMessage::new(
                                    format!("Escalation: {}/{}", pipeline.name, stage.name),
                                    format!(
                                        "{} failed after {} retries (code: {code})",
                                        stage.name, state.retries
                                    ),
                                ));
                            }
                        }
                    }
                }

                StageStatus::Completed | StageStatus::Failed => unreachable!(),
            }

            store.save_stage_state(&state)?;
            // One transition per pipeline per tick; later stages wait.
            break;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn block_matches(
        &self,
        store: &StateStore,
        block: &CompiledBlock,
        pipeline: &CompiledPipeline,
        host: &str,
        pane: &PaneInfo,
        new_lines: &[String],
        messages: &[ParsedMessage],
    ) -> Result<bool> {
        if block.is_empty() {
            return Ok(false);
        }
        let mut any_ok = block.any_of.is_empty();
        for trigger in &block.any_of {
            if self.trigger_satisfied(store, trigger, pipeline, host, pane, new_lines, messages)? {
                any_ok = true;
                break;
            }
        }
        let mut all_ok = true;
        for trigger in &block.all_of {
            if !self.trigger_satisfied(store, trigger, pipeline, host, pane, new_lines, messages)? {
                all_ok = false;
                break;
            }
        }
        Ok(any_ok && all_ok)
    }

    #[allow(clippy::too_many_arguments)]
    fn trigger_satisfied(
        &self,
        store: &StateStore,
        trigger: &CompiledTrigger,
        pipeline: &CompiledPipeline,
        host: &str,
        pane: &PaneInfo,
        new_lines: &[String],
        messages: &[ParsedMessage],
    ) -> Result<bool> {
        if let Some(regex) = &trigger.log_regex {
            if new_lines.iter().any(|line| regex.is_match(line)) {
                return Ok(true);
            }
        }
        if let Some(kind) = &trigger.message_type {
            if messages.iter().any(|msg| msg.kind == *kind) {
                return Ok(true);
            }
        }
        if let Some(previous) = &trigger.after_stage_success {
            let prev = store.load_stage_state(host, &pane.pane_id, &pipeline.name, previous)?;
            if prev.status == StageStatus::Completed {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn stage_actions(host: &str, pane: &PaneInfo, stage: &CompiledStage) -> Vec<Action> {
    stage
        .actions_on_start
        .iter()
        .map(|action| Action {
            host: host.to_string(),
            pane_id: pane.pane_id.clone(),
            kind: action.kind,
            command: action.command.clone(),
            enter: action.enter,
        })
        .collect()
}

fn format_approval_body(request: &ApprovalRequest, prompt: Option<&str>) -> String {
    let mut body = vec![prompt.unwrap_or("Approval required").to_string()];
    body.push(format!("File: `{}`", request.file_path.display()));
    if let (Some(approve), Some(reject)) = (&request.approve_url, &request.reject_url) {
        body.push(format!("[Approve]({approve}) | [Reject]({reject})"));
    }
    body.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_messages;

    const LINT_BUILD_POLICY: &str = r#"
pipelines:
  - name: ci
    match:
      any_of:
        - window_name: "build"
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
      - name: build
        triggers:
          any_of:
            - after_stage_success: lint
        require_approval: true
        actions_on_start:
          - send_keys: "npm run build"
        success_when:
          any_of:
            - log_regex: "build ok"
"#;

    struct Harness {
        store: StateStore,
        approvals: ApprovalManager,
        engine: PolicyEngine,
        _tmp: tempfile::TempDir,
    }

    fn harness(policy_yaml: &str) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let doc: PolicyDoc = serde_yaml::from_str(policy_yaml).unwrap();
        Harness {
            store: StateStore::open_in_memory().unwrap(),
            approvals: ApprovalManager::new(tmp.path().join("approvals"), None, None, 3600)
                .unwrap(),
            engine: PolicyEngine::compile(&doc).unwrap(),
            _tmp: tmp,
        }
    }

    fn pane() -> PaneInfo {
        PaneInfo {
            pane_id: "%1".to_string(),
            session_name: "work".to_string(),
            window_name: "build".to_string(),
            pane_title: "worker".to_string(),
            is_active: true,
            width: None,
            height: None,
        }
    }

    fn tick(h: &Harness, pane: &PaneInfo, lines: &[&str]) -> EvaluationOutcome {
        let lines: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        let messages = parse_messages(&lines);
        h.engine
            .evaluate(&h.store, &h.approvals, "local", pane, &lines, &messages)
            .unwrap()
    }

    fn stage_status(h: &Harness, pipeline: &str, stage: &str) -> StageStatus {
        h.store
            .load_stage_state("local", "%1", pipeline, stage)
            .unwrap()
            .status
    }

    #[test]
    fn lint_then_build_happy_path() {
        let h = harness(LINT_BUILD_POLICY);
        let pane = pane();

        // Tick 1: trigger fires, lint runs, action dispatched.
        let out = tick(&h, &pane, &["run lint"]);
        assert_eq!(out.actions.len(), 1);
        assert_eq!(out.actions[0].command, "npm run lint");
        assert_eq!(out.actions[0].kind, ActionKind::SendKeys);
        assert!(out.actions[0].enter);
        assert_eq!(stage_status(&h, "ci", "lint"), StageStatus::Running);

        // Tick 2: success predicate completes lint.
        let out = tick(&h, &pane, &["lint ok"]);
        assert!(out.actions.is_empty());
        assert_eq!(stage_status(&h, "ci", "lint"), StageStatus::Completed);

        // Tick 3: build becomes ready via after_stage_success and gates on
        // approval; exactly one request and one notification.
        let out = tick(&h, &pane, &[]);
        assert!(out.actions.is_empty());
        assert_eq!(out.approvals.len(), 1);
        assert_eq!(out.approvals[0].stage, "build");
        assert_eq!(out.notifications.len(), 1);
        assert!(out.notifications[0].title.contains("Approval required"));
        assert_eq!(stage_status(&h, "ci", "build"), StageStatus::WaitingApproval);

        // Human approves via drop file; tick 4 dispatches the build action.
        std::fs::write(h.approvals.approval_file("local", "%1", "build"), "approve").unwrap();
        let out = tick(&h, &pane, &[]);
        assert_eq!(out.actions.len(), 1);
        assert_eq!(out.actions[0].command, "npm run build");
        assert_eq!(stage_status(&h, "ci", "build"), StageStatus::Running);

        // Tick 5: build completes.
        tick(&h, &pane, &["build ok"]);
        assert_eq!(stage_status(&h, "ci", "build"), StageStatus::Completed);
    }

    #[test]
    fn one_transition_per_tick_keeps_stages_sequential() {
        let h = harness(LINT_BUILD_POLICY);
        let pane = pane();

        // Both the lint trigger and its success line arrive in one tick:
        // lint only moves to RUNNING; build is untouched.
        tick(&h, &pane, &["run lint", "lint ok"]);
        assert_eq!(stage_status(&h, "ci", "lint"), StageStatus::Running);
        assert_eq!(stage_status(&h, "ci", "build"), StageStatus::Idle);
    }

    #[test]
    fn actions_not_resent_while_running() {
        let h = harness(LINT_BUILD_POLICY);
        let pane = pane();

        let out = tick(&h, &pane, &["run lint"]);
        assert_eq!(out.actions.len(), 1);

        // Still running, no success yet: nothing is re-dispatched.
        let out = tick(&h, &pane, &["still linting"]);
        assert!(out.actions.is_empty());
        let out = tick(&h, &pane, &[]);
        assert!(out.actions.is_empty());
    }

    #[test]
    fn rejection_freezes_the_pipeline() {
        let h = harness(LINT_BUILD_POLICY);
        let pane = pane();

        tick(&h, &pane, &["run lint"]);
        tick(&h, &pane, &["lint ok"]);
        tick(&h, &pane, &[]);
        assert_eq!(stage_status(&h, "ci", "build"), StageStatus::WaitingApproval);

        std::fs::write(h.approvals.approval_file("local", "%1", "build"), "no").unwrap();
        let out = tick(&h, &pane, &[]);
        assert!(out.actions.is_empty());
        assert_eq!(stage_status(&h, "ci", "build"), StageStatus::Failed);

        // The pipeline is frozen; later ticks do nothing.
        let out = tick(&h, &pane, &["build ok"]);
        assert!(out.actions.is_empty());
        assert_eq!(stage_status(&h, "ci", "build"), StageStatus::Failed);

        // External reset re-arms it.
        h.store.reset_pipeline("local", "%1", "ci").unwrap();
        assert_eq!(stage_status(&h, "ci", "lint"), StageStatus::Idle);
    }

    const RETRY_POLICY: &str = r#"
pipelines:
  - name: deploy
    match:
      any_of:
        - window_name: "build"
    stages:
      - name: ship
        actions_on_start:
          - send_keys: "make deploy"
        success_when:
          any_of:
            - log_regex: "deploy ok"
        fail_when:
          any_of:
            - log_regex: "deploy failed"
        on_fail:
          - retry:
              max: 2
          - escalate: deploy_failure
"#;

    #[test]
    fn retry_budget_exhaustion_escalates_once() {
        let h = harness(RETRY_POLICY);
        let pane = pane();

        // Empty trigger block: stage starts immediately.
        let out = tick(&h, &pane, &[]);
        assert_eq!(out.actions.len(), 1);

        // First failure: retry 1, actions replayed.
        let out = tick(&h, &pane, &["deploy failed"]);
        assert_eq!(out.actions.len(), 1);
        assert!(out.notifications.is_empty());
        let state = h.store.load_stage_state("local", "%1", "deploy", "ship").unwrap();
        assert_eq!(state.status, StageStatus::Running);
        assert_eq!(state.retries, 1);

        // Second failure: retry 2.
        let out = tick(&h, &pane, &["deploy failed"]);
        assert_eq!(out.actions.len(), 1);
        let state = h.store.load_stage_state("local", "%1", "deploy", "ship").unwrap();
        assert_eq!(state.retries, 2);

        // Third failure: budget exhausted, FAILED, exactly one escalation.
        let out = tick(&h, &pane, &["deploy failed"]);
        assert!(out.actions.is_empty());
        assert_eq!(out.notifications.len(), 1);
        assert!(out.notifications[0].title.contains("Escalation"));
        assert!(out.notifications[0].body.contains("deploy_failure"));
        assert_eq!(stage_status(&h, "deploy", "ship"), StageStatus::Failed);

        // No further notifications once frozen.
        let out = tick(&h, &pane, &["deploy failed"]);
        assert!(out.notifications.is_empty());
    }

    #[test]
    fn exhausted_retries_with_prompt_ask_the_human() {
        let policy = r#"
pipelines:
  - name: deploy
    match:
      any_of:
        - window_name: "build"
    stages:
      - name: ship
        actions_on_start:
          - send_keys: "make deploy"
        fail_when:
          any_of:
            - log_regex: "deploy failed"
        on_fail:
          - retry:
              max: 1
          - if_still_fail:
              ask_human: "deploy keeps failing, retry manually?"
"#;
        let h = harness(policy);
        let pane = pane();

        tick(&h, &pane, &[]);
        tick(&h, &pane, &["deploy failed"]); // retry 1
        let out = tick(&h, &pane, &["deploy failed"]);
        assert_eq!(stage_status(&h, "deploy", "ship"), StageStatus::WaitingApproval);
        assert_eq!(out.notifications.len(), 1);
        assert!(out.notifications[0].title.contains("Manual decision needed"));
        assert!(out.notifications[0].body.contains("retry manually"));

        // While waiting, the request is re-ensured but not re-notified.
        let out = tick(&h, &pane, &[]);
        assert_eq!(out.approvals.len(), 1);
        assert!(out.notifications.is_empty());

        // Approval replays the actions and resumes running.
        std::fs::write(h.approvals.approval_file("local", "%1", "ship"), "approved").unwrap();
        let out = tick(&h, &pane, &[]);
        assert_eq!(out.actions.len(), 1);
        assert_eq!(stage_status(&h, "deploy", "ship"), StageStatus::Running);
    }

    #[test]
    fn success_wins_over_failure_on_the_same_tick() {
        let h = harness(RETRY_POLICY);
        let pane = pane();

        tick(&h, &pane, &[]);
        let out = tick(&h, &pane, &["deploy failed", "deploy ok"]);
        assert!(out.actions.is_empty());
        assert_eq!(stage_status(&h, "deploy", "ship"), StageStatus::Completed);
    }

    #[test]
    fn message_type_trigger_matches_heuristic_kinds() {
        let policy = r#"
pipelines:
  - name: watch
    match:
      any_of:
        - window_name: "build"
    stages:
      - name: react
        triggers:
          any_of:
            - message_type: ERROR
        actions_on_start:
          - shell: "echo alert"
"#;
        let h = harness(policy);
        let pane = pane();

        // A keyword-derived ERROR message satisfies the message_type trigger.
        let out = tick(&h, &pane, &["compilation failed badly"]);
        assert_eq!(out.actions.len(), 1);
        assert_eq!(out.actions[0].kind, ActionKind::Shell);
        assert!(!out.actions[0].enter);
        assert_eq!(out.actions[0].command, "echo alert");
    }

    #[test]
    fn all_of_requires_every_trigger() {
        let policy = r#"
pipelines:
  - name: gated
    match:
      any_of:
        - window_name: "build"
    stages:
      - name: go
        triggers:
          all_of:
            - log_regex: "ready"
            - message_type: STATUS
        actions_on_start:
          - send_keys: "start"
"#;
        let h = harness(policy);
        let pane = pane();

        // Only one of the two conditions: stage keeps waiting.
        let out = tick(&h, &pane, &["ready when you are"]);
        assert!(out.actions.is_empty());
        assert_eq!(stage_status(&h, "gated", "go"), StageStatus::WaitingTrigger);

        // Both in one tick ("done" yields a STATUS message): stage starts.
        let out = tick(&h, &pane, &["ready", "setup done"]);
        assert_eq!(out.actions.len(), 1);
    }

    #[test]
    fn mixed_block_requires_both_groups() {
        let policy = r#"
pipelines:
  - name: gated
    match:
      any_of:
        - window_name: "build"
    stages:
      - name: go
        triggers:
          any_of:
            - log_regex: "alpha"
            - log_regex: "beta"
          all_of:
            - message_type: STATUS
        actions_on_start:
          - send_keys: "start"
"#;
        let h = harness(policy);
        let pane = pane();

        let out = tick(&h, &pane, &["alpha"]);
        assert!(out.actions.is_empty());

        let out = tick(&h, &pane, &["beta", "checks passed"]);
        assert_eq!(out.actions.len(), 1);
    }

    #[test]
    fn pipeline_matching_honours_window_and_title() {
        let policy = r#"
pipelines:
  - name: ci
    match:
      any_of:
        - window_name: "^build-"
        - pane_title: "agent"
    stages:
      - name: only
        actions_on_start:
          - send_keys: "hi"
"#;
        let h = harness(policy);

        let mut other = pane();
        other.window_name = "scratch".to_string();
        other.pane_title = "shell".to_string();
        let out = tick(&h, &other, &[]);
        assert!(out.actions.is_empty());

        let mut matching = pane();
        matching.window_name = "build-7".to_string();
        let out = tick(&h, &matching, &[]);
        assert_eq!(out.actions.len(), 1);
    }

    #[test]
    fn empty_success_and_fail_never_fire() {
        let policy = r#"
pipelines:
  - name: ci
    match:
      any_of:
        - window_name: "build"
    stages:
      - name: forever
        actions_on_start:
          - send_keys: "run"
"#;
        let h = harness(policy);
        let pane = pane();

        tick(&h, &pane, &[]);
        tick(&h, &pane, &["done", "failed", "everything"]);
        assert_eq!(stage_status(&h, "ci", "forever"), StageStatus::Running);
    }

    #[test]
    fn bad_regex_fails_compilation() {
        let policy = r#"
pipelines:
  - name: ci
    match:
      any_of:
        - window_name: "build"
    stages:
      - name: broken
        triggers:
          any_of:
            - log_regex: "([unclosed"
"#;
        let doc: PolicyDoc = serde_yaml::from_str(policy).unwrap();
        assert!(PolicyEngine::compile(&doc).is_err());
    }

    #[test]
    fn approval_file_decision_applies_once() {
        let h = harness(LINT_BUILD_POLICY);
        let pane = pane();
        tick(&h, &pane, &["run lint"]);
        tick(&h, &pane, &["lint ok"]);
        tick(&h, &pane, &[]);

        let file = h.approvals.approval_file("local", "%1", "build");
        std::fs::write(&file, "approve").unwrap();
        tick(&h, &pane, &[]);
        assert!(!file.exists(), "decision file is consumed");
        assert_eq!(stage_status(&h, "ci", "build"), StageStatus::Running);
    }
}
