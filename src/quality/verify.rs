//! Worker/verifier feedback loop.
//!
//! ```text
//!   attempt 1: worker ──► verifier ──► passed? ──yes──► success
//!                                        │no
//!   attempt 2: worker(+feedback) ──► verifier ──► ...
//!                                        │ attempts exhausted
//!                                        ▼
//!                                  error(last reasoning)
//! ```
//!
//! Attempts for one item are strictly sequential; different items run
//! their loops concurrently under the shared scheduler.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::SwarmError;
use crate::events::EngineEvent;
use crate::retry::ItemContext;
use crate::task::{Item, TaskResult, TaskStatus, VerifyInfo, RESULT_FILE};

/// Default number of worker passes in a verify loop.
const DEFAULT_VERIFY_ATTEMPTS: u32 = 3;

/// Configuration of a verify loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyPolicy {
    /// Instructions given to the verifier.
    pub prompt: String,
    /// Total worker passes, at least 1.
    #[serde(default = "default_verify_attempts")]
    pub max_attempts: u32,
    /// Overrides the verdict schema handed to the verifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

fn default_verify_attempts() -> u32 {
    DEFAULT_VERIFY_ATTEMPTS
}

impl VerifyPolicy {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_attempts: DEFAULT_VERIFY_ATTEMPTS,
            schema: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Schema the verifier output must follow.
    pub fn verdict_schema(&self) -> serde_json::Value {
        self.schema.clone().unwrap_or_else(verdict_schema)
    }

    /// # Errors
    ///
    /// Returns `SwarmError::InvalidPolicy` for zero attempts.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.max_attempts == 0 {
            return Err(SwarmError::invalid_policy(
                "verify",
                "max_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// JSON schema of the verifier's structured output.
pub fn verdict_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "passed": { "type": "boolean" },
            "reasoning": { "type": "string" }
        },
        "required": ["passed", "reasoning"]
    })
}

/// A verifier's judgement of one worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    #[serde(default, alias = "feedback")]
    pub reasoning: String,
}

impl Verdict {
    pub fn pass(reasoning: impl Into<String>) -> Self {
        Self {
            passed: true,
            reasoning: reasoning.into(),
        }
    }

    pub fn fail(reasoning: impl Into<String>) -> Self {
        Self {
            passed: false,
            reasoning: reasoning.into(),
        }
    }

    /// Interprets a verifier call.
    ///
    /// A failed verifier call, or one without a readable verdict, counts as
    /// a failed verification whose reasoning explains what went wrong.
    pub fn from_result(result: &TaskResult) -> Self {
        if !result.is_success() {
            return Self::fail(format!("verifier failed: {}", result.failure_reason()));
        }
        match result.structured_output() {
            Some(value) => serde_json::from_value::<Verdict>(value).unwrap_or_else(|e| {
                Self::fail(format!("verifier returned an unreadable verdict: {e}"))
            }),
            None => Self::fail("verifier returned no verdict"),
        }
    }
}

/// Feedback paragraph appended to the worker prompt on a rerun.
pub fn feedback_prompt(reasoning: &str) -> String {
    format!(
        "A reviewer rejected the previous attempt. Address this feedback:\n{}",
        reasoning.trim()
    )
}

/// What the verifier sees: the original item under `input/` and the worker
/// output under `output/`.
///
/// Structured data returned without a result file is written to
/// `output/result.json`.
pub fn verifier_context(input: &Item, output: &TaskResult) -> Result<Item, SwarmError> {
    let mut context = input.prefixed("input").merged(&output.files.prefixed("output"));
    if !output.files.contains(RESULT_FILE) {
        if let Some(data) = output.data.as_ref().filter(|data| !data.is_null()) {
            context = context.with_file(
                format!("output/{RESULT_FILE}"),
                serde_json::to_vec_pretty(data)?,
            );
        }
    }
    Ok(context)
}

/// Runs the worker/verifier loop for one item.
///
/// `worker(feedback, attempt)` performs one worker pass, receiving the
/// previous verifier reasoning from the second attempt on.
/// `verifier(output, attempt)` evaluates a successful worker output.
///
/// A worker pass that fails ends the loop with that failure. A verifier
/// rejection reruns the worker while attempts remain; afterwards the item
/// fails with the last reasoning.
///
/// # Errors
///
/// Only infrastructure errors from either closure are returned.
pub async fn run_verify_loop<W, WFut, V, VFut>(
    ctx: ItemContext<'_>,
    max_attempts: u32,
    mut worker: W,
    mut verifier: V,
) -> Result<TaskResult, SwarmError>
where
    W: FnMut(Option<String>, u32) -> WFut,
    WFut: Future<Output = Result<TaskResult, SwarmError>>,
    V: FnMut(TaskResult, u32) -> VFut,
    VFut: Future<Output = Result<TaskResult, SwarmError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut feedback: Option<String> = None;
    let mut attempt = 1;

    loop {
        let mut output = worker(feedback.take(), attempt).await?;
        ctx.events.emit(EngineEvent::worker_complete(
            ctx.stage_index,
            ctx.item_index,
            attempt,
            output.status,
        ));

        if !output.is_success() {
            debug!(
                stage_index = ctx.stage_index,
                item_index = ctx.item_index,
                attempt,
                "Worker pass failed, ending verify loop"
            );
            output.meta.attempts = Some(attempt);
            return Ok(output);
        }

        let verdict = Verdict::from_result(&verifier(output.clone(), attempt).await?);
        ctx.events.emit(EngineEvent::verifier_complete(
            ctx.stage_index,
            ctx.item_index,
            attempt,
            verdict.passed,
            (!verdict.reasoning.is_empty()).then(|| verdict.reasoning.clone()),
        ));

        if verdict.passed {
            output.meta.attempts = Some(attempt);
            output.verify = Some(VerifyInfo {
                passed: true,
                reasoning: verdict.reasoning,
                attempts: attempt,
            });
            return Ok(output);
        }

        if attempt >= max_attempts {
            warn!(
                stage_index = ctx.stage_index,
                item_index = ctx.item_index,
                attempts = attempt,
                reasoning = %verdict.reasoning,
                "Verification failed, attempts exhausted"
            );
            output.status = TaskStatus::Error;
            output.error = Some(format!(
                "verification failed after {attempt} attempt(s): {}",
                verdict.reasoning
            ));
            output.meta.attempts = Some(attempt);
            output.verify = Some(VerifyInfo {
                passed: false,
                reasoning: verdict.reasoning,
                attempts: attempt,
            });
            return Ok(output);
        }

        debug!(
            stage_index = ctx.stage_index,
            item_index = ctx.item_index,
            attempt,
            "Verification rejected output, rerunning worker with feedback"
        );
        feedback = Some(verdict.reasoning);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventLog};
    use std::sync::Mutex;

    fn passing_verdict() -> TaskResult {
        TaskResult::success(json!({"passed": true, "reasoning": "looks right"}))
    }

    fn failing_verdict(reason: &str) -> TaskResult {
        TaskResult::success(json!({"passed": false, "reasoning": reason}))
    }

    #[test]
    fn test_verdict_parsing() {
        assert!(Verdict::from_result(&passing_verdict()).passed);

        let alias = TaskResult::success(json!({"passed": false, "feedback": "too short"}));
        assert_eq!(Verdict::from_result(&alias), Verdict::fail("too short"));

        let broken = Verdict::from_result(&TaskResult::error("timeout"));
        assert!(!broken.passed);
        assert!(broken.reasoning.contains("timeout"));

        let garbled = Verdict::from_result(&TaskResult::success(json!({"passed": "maybe"})));
        assert!(!garbled.passed);
    }

    #[test]
    fn test_verifier_context_layout() {
        let input = Item::single("task.md", "add numbers");
        let output = TaskResult::success(json!({"sum": 3}))
            .with_files(Item::single("solution.py", "print(3)"));

        let context = verifier_context(&input, &output).expect("context");
        assert_eq!(context.get_str("input/task.md"), Some("add numbers"));
        assert_eq!(context.get_str("output/solution.py"), Some("print(3)"));
        assert!(context.contains("output/result.json"));
    }

    #[test]
    fn test_policy_validation() {
        assert!(VerifyPolicy::new("check").validate().is_ok());
        assert!(VerifyPolicy::new("check")
            .with_max_attempts(0)
            .validate()
            .is_err());
        assert_eq!(VerifyPolicy::new("x").verdict_schema(), verdict_schema());
    }

    #[tokio::test]
    async fn test_passes_on_first_attempt() {
        let bus = EventBus::new();
        let log = EventLog::new();
        bus.subscribe(log.clone());

        let result = run_verify_loop(
            ItemContext::new(&bus, 0, 0),
            3,
            |_, _| async { Ok(TaskResult::success(json!({"answer": 42}))) },
            |_, _| async { Ok(passing_verdict()) },
        )
        .await
        .expect("ok");

        assert!(result.is_success());
        let info = result.verify.expect("verify info");
        assert!(info.passed);
        assert_eq!(info.attempts, 1);
        assert_eq!(log.count("workerComplete"), 1);
        assert_eq!(log.count("verifierComplete"), 1);
    }

    #[tokio::test]
    async fn test_feedback_is_passed_to_rerun() {
        let bus = EventBus::new();
        let seen_feedback = Mutex::new(Vec::new());

        let result = run_verify_loop(
            ItemContext::new(&bus, 0, 0),
            3,
            |feedback, attempt| {
                seen_feedback.lock().expect("lock").push(feedback);
                async move { Ok(TaskResult::success(json!({ "attempt": attempt }))) }
            },
            |output, _| async move {
                if output.data == Some(json!({"attempt": 1})) {
                    Ok(failing_verdict("missing units"))
                } else {
                    Ok(passing_verdict())
                }
            },
        )
        .await
        .expect("ok");

        assert!(result.is_success());
        assert_eq!(result.meta.attempts, Some(2));
        assert_eq!(
            *seen_feedback.lock().expect("lock"),
            vec![None, Some("missing units".to_string())]
        );
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_error_with_last_reasoning() {
        let bus = EventBus::new();
        let log = EventLog::new();
        bus.subscribe(log.clone());

        let result = run_verify_loop(
            ItemContext::new(&bus, 2, 5),
            2,
            |_, _| async { Ok(TaskResult::success(json!({}))) },
            |_, attempt| async move { Ok(failing_verdict(&format!("bad #{attempt}"))) },
        )
        .await
        .expect("ok");

        assert_eq!(result.status, TaskStatus::Error);
        assert!(result.error.as_deref().unwrap_or("").contains("bad #2"));
        let info = result.verify.expect("verify info");
        assert!(!info.passed);
        assert_eq!(info.attempts, 2);
        assert_eq!(log.count("workerComplete"), 2);
        assert_eq!(log.count("verifierComplete"), 2);
    }

    #[tokio::test]
    async fn test_worker_failure_skips_verifier() {
        let bus = EventBus::new();
        let log = EventLog::new();
        bus.subscribe(log.clone());

        let result = run_verify_loop(
            ItemContext::new(&bus, 0, 0),
            3,
            |_, _| async { Ok(TaskResult::error("worker crashed")) },
            |_, _| async { Ok(passing_verdict()) },
        )
        .await
        .expect("ok");

        assert!(result.is_error());
        assert_eq!(result.error.as_deref(), Some("worker crashed"));
        assert_eq!(log.count("verifierComplete"), 0);
    }
}
