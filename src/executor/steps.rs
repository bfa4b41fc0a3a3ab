//! Sequential step engine
//!
//! Steps run strictly in order. An ai-action step dispatches to the agent's
//! action or assertion API (chosen by a verification-verb heuristic), a
//! `code` step runs through the sandbox. Every step ends with a screenshot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::error::RunError;
use crate::events::{LogLevel, RunEvent};
use crate::executor::sandbox::{CodeSandbox, split_statements, validate_code};
use crate::executor::types::{EventSink, ResolvedRunConfig, Step, StepKind};
use crate::runtime::{CancelToken, with_deadline_cancellable};

use super::{PreparedKind, PreparedTarget};

/// Instructions starting with one of these dispatch to the assert API.
const VERIFICATION_VERBS: [&str; 6] =
    ["verify", "assert", "check", "confirm", "ensure", "validate"];

/// Ceiling on the opportunistic post-navigation settle wait.
const NAV_SETTLE_CEILING: Duration = Duration::from_secs(3);

static QUOTED_STRINGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)""#).unwrap_or_else(|e| panic!("quoted regex: {e}")));

pub(crate) struct StepContext<'a> {
    pub run: &'a ResolvedRunConfig,
    pub orch: &'a OrchestratorConfig,
    pub targets: &'a [PreparedTarget],
    pub emit: &'a EventSink,
    pub token: &'a CancelToken,
}

impl StepContext<'_> {
    fn select_target(&self, step: &Step) -> Result<&PreparedTarget, RunError> {
        match &step.target_id {
            None => self
                .targets
                .first()
                .ok_or_else(|| RunError::config("Test has no targets")),
            Some(id) => self
                .targets
                .iter()
                .find(|t| &t.id == id)
                .ok_or_else(|| {
                    RunError::config(format!("Unknown target '{id}' in step '{}'", step.id))
                }),
        }
    }
}

/// Run one step to completion. Any error fails the run.
pub(crate) async fn execute_step(
    ctx: &StepContext<'_>,
    index: usize,
    step: &Step,
) -> Result<(), RunError> {
    let target = ctx.select_target(step)?;
    debug!(step = %step.id, target = %target.id, "executing step");

    match step.kind {
        StepKind::AiAction => execute_ai_step(ctx, index, step, target).await?,
        StepKind::Code => execute_code_step(ctx, step, target).await?,
    }

    // Screenshot after each step, best-effort.
    if let Ok(src) = target.shot.capture().await {
        (ctx.emit)(
            RunEvent::screenshot(src, format!("after step {}", index + 1))
                .with_browser_id(target.id.clone()),
        );
    }
    Ok(())
}

async fn execute_ai_step(
    ctx: &StepContext<'_>,
    index: usize,
    step: &Step,
    target: &PreparedTarget,
) -> Result<(), RunError> {
    let instruction = substitute_placeholders(step.action.trim(), ctx, target)?;

    if let PreparedKind::Browser { page, last_url, .. } = &target.kind {
        // A navigation in an earlier step may still be settling; give the
        // DOM a bounded chance to be ready before acting on it.
        let current = page.current_url().await.unwrap_or_default();
        let mut last = last_url.lock().await;
        if *last != current {
            let _ = page.wait_for_dom_ready(NAV_SETTLE_CEILING).await;
            *last = page.current_url().await.unwrap_or(current);
        }
    }

    if is_verification(&instruction) {
        verify_quoted_strings(step, target, &instruction).await?;
        dispatch_agent(ctx, target, index, AgentCall::Assert, &instruction).await?;
    } else {
        dispatch_agent(ctx, target, index, AgentCall::Act, &instruction).await?;
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum AgentCall {
    Act,
    Assert,
}

async fn dispatch_agent(
    ctx: &StepContext<'_>,
    target: &PreparedTarget,
    index: usize,
    call: AgentCall,
    instruction: &str,
) -> Result<(), RunError> {
    let agent = &target.agent;
    let invoke = |instruction: String| {
        let agent = Arc::clone(agent);
        async move {
            let result = match call {
                AgentCall::Act => agent.ai_act(&instruction).await,
                AgentCall::Assert => agent.ai_assert(&instruction).await,
            };
            result.map_err(|e| RunError::step(e.to_string()))
        }
    };

    if !target.is_android() {
        return invoke(instruction.to_string()).await;
    }

    // Android agent calls carry an operation deadline and honor the run
    // token at every suspension point.
    let result = with_deadline_cancellable(
        invoke(instruction.to_string()),
        ctx.orch.android_op_timeout,
        "AI operation",
        ctx.token,
    )
    .await;

    match result {
        Err(RunError::Step(message)) if index == 0 && looks_like_splash(&message) => {
            // One retry: the app may still be on its splash screen.
            (ctx.emit)(
                RunEvent::log(
                    LogLevel::Info,
                    "First action hit a loading screen, waiting for the UI to be ready",
                )
                .with_browser_id(target.id.clone()),
            );
            target
                .agent
                .ai_wait_for(
                    "the app has finished loading and its main UI is interactive",
                    Duration::from_secs(10),
                )
                .await
                .map_err(|e| RunError::step(e.to_string()))?;
            with_deadline_cancellable(
                invoke(instruction.to_string()),
                ctx.orch.android_op_timeout,
                "AI operation",
                ctx.token,
            )
            .await
        }
        other => other,
    }
}

fn looks_like_splash(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("loading") || lowered.contains("splash")
}

/// Every double-quoted string in a verification instruction must appear on
/// the page verbatim; the agent is queried per string and the answer is
/// compared exactly.
async fn verify_quoted_strings(
    step: &Step,
    target: &PreparedTarget,
    instruction: &str,
) -> Result<(), RunError> {
    for capture in QUOTED_STRINGS.captures_iter(instruction) {
        let expected = &capture[1];
        let prompt = format!(
            "Locate the exact text \"{expected}\" on the current screen. \
             Reply with that text exactly as it appears, or NOT_FOUND if it is absent."
        );
        let answer = target
            .agent
            .ai_query(&prompt)
            .await
            .map_err(|e| RunError::step(e.to_string()))?;
        let answer = answer.trim();

        if answer == "NOT_FOUND" {
            return Err(RunError::step(format!(
                "Verification failed in step '{}': \"{expected}\" was not found on the page",
                step.id
            )));
        }
        if answer != expected {
            return Err(RunError::step(format!(
                "Verification failed in step '{}': expected \"{expected}\" exactly, \
                 but the page shows \"{answer}\"",
                step.id
            )));
        }
    }
    Ok(())
}

async fn execute_code_step(
    ctx: &StepContext<'_>,
    step: &Step,
    target: &PreparedTarget,
) -> Result<(), RunError> {
    let PreparedKind::Browser { page, .. } = &target.kind else {
        return Err(RunError::config(format!(
            "Step '{}' is a code step, which is not supported on Android targets",
            step.id
        )));
    };

    validate_code(&step.action).map_err(RunError::Config)?;
    let statements = split_statements(&step.action).map_err(RunError::Step)?;
    if statements.is_empty() {
        return Err(RunError::config(format!("Step '{}' contains no statements", step.id)));
    }

    let mut variables = ctx.run.resolved_variables.clone();
    if let PreparedKind::Browser {
        credentials: (username, password),
        ..
    } = &target.kind
    {
        if let Some(username) = username {
            variables.insert("username".to_string(), username.clone());
        }
        if let Some(password) = password {
            variables.insert("password".to_string(), password.clone());
        }
    }

    let sandbox = CodeSandbox::new(
        Arc::clone(page),
        variables,
        ctx.run.resolved_files.clone(),
        ctx.orch.upload_root.join(&ctx.run.test_case_id),
        step.files
            .as_ref()
            .map(|ids| ids.iter().cloned().collect::<HashSet<_>>()),
        ctx.orch.statement_timeout,
    );

    // Whole-step syntax check before the first statement acts.
    sandbox.check_syntax(&statements).map_err(RunError::Step)?;

    for (i, statement) in statements.iter().enumerate() {
        ctx.token.check()?;
        sandbox
            .execute_statement(statement)
            .await
            .map_err(RunError::Step)?;
        if let Ok(src) = target.shot.capture().await {
            (ctx.emit)(
                RunEvent::screenshot(src, format!("{} statement {}", step.id, i + 1))
                    .with_browser_id(target.id.clone()),
            );
        }
    }
    Ok(())
}

fn is_verification(instruction: &str) -> bool {
    let lowered = instruction.trim_start().to_lowercase();
    VERIFICATION_VERBS.iter().any(|verb| {
        lowered.starts_with(verb)
            && lowered[verb.len()..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_alphanumeric())
    })
}

/// Replace `{{name}}` placeholders from resolved variables and the target's
/// credentials. A credential placeholder without a configured value is a
/// configuration error, not a silent empty string.
fn substitute_placeholders(
    input: &str,
    ctx: &StepContext<'_>,
    target: &PreparedTarget,
) -> Result<String, RunError> {
    if !input.contains("{{") {
        return Ok(input.to_string());
    }

    let (username, password) = match &target.kind {
        PreparedKind::Browser { credentials, .. } => (credentials.0.clone(), credentials.1.clone()),
        PreparedKind::Android { .. } => (None, None),
    };

    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(RunError::config("Unterminated variable placeholder in step"));
        };
        let name = after[..end].trim();
        let value = match name {
            "username" => username.clone(),
            "password" => password.clone(),
            other => ctx.run.resolved_variables.get(other).cloned(),
        };
        match value {
            Some(value) => output.push_str(&value),
            None => {
                return Err(RunError::config(format!(
                    "Step uses {{{{{name}}}}} but no value is configured for it"
                )));
            }
        }
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_heuristic_matches_prefix_verbs() {
        assert!(is_verification("Verify the cart shows one item"));
        assert!(is_verification("  check that the banner is gone"));
        assert!(is_verification("Ensure \"Done\" is visible"));
        assert!(!is_verification("Click the verify button"));
        assert!(!is_verification("checkout now"));
    }

    #[test]
    fn quoted_string_regex_extracts_all() {
        let captures: Vec<&str> = QUOTED_STRINGS
            .captures_iter(r#"Verify "Order #12345 confirmed" and "Thank you""#)
            .map(|c| c.get(1).map_or("", |m| m.as_str()))
            .collect();
        assert_eq!(captures, vec!["Order #12345 confirmed", "Thank you"]);
    }

    #[test]
    fn splash_detection_is_case_insensitive() {
        assert!(looks_like_splash("App is still Loading"));
        assert!(looks_like_splash("stuck on SPLASH screen"));
        assert!(!looks_like_splash("button not found"));
    }
}
