//! Best-of-N tournaments.
//!
//! ```text
//!   candidate 0 ──┐
//!   candidate 1 ──┼── all settled ──► judge ──► winner + BestOfInfo
//!   candidate n ──┘
//! ```
//!
//! Every candidate takes its own scheduler slot and retry budget. The judge
//! is issued exactly once, after the slowest candidate has settled, and sees
//! failed candidates too.

use std::collections::BTreeMap;
use std::future::Future;

use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::SwarmError;
use crate::events::EngineEvent;
use crate::retry::ItemContext;
use crate::task::{BestOfInfo, Item, TaskResult, TaskStatus};

/// Path of the judge's candidate manifest.
pub const CANDIDATES_MANIFEST: &str = "candidates.json";

/// Per-candidate configuration override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Extra paragraph appended to the worker prompt for this candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl CandidateOverride {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_prompt_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.prompt_suffix = Some(suffix.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Configuration of a best-of tournament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestOfPolicy {
    /// Number of candidates, at least 1.
    pub n: usize,
    /// Instructions given to the judge.
    pub judge_prompt: String,
    /// Optional overrides, applied by candidate index.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateOverride>,
}

impl BestOfPolicy {
    pub fn new(n: usize, judge_prompt: impl Into<String>) -> Self {
        Self {
            n,
            judge_prompt: judge_prompt.into(),
            candidates: Vec::new(),
        }
    }

    pub fn with_candidate(mut self, candidate: CandidateOverride) -> Self {
        self.candidates.push(candidate);
        self
    }

    /// Override for candidate `index`, if any.
    pub fn candidate(&self, index: usize) -> Option<&CandidateOverride> {
        self.candidates.get(index)
    }

    /// # Errors
    ///
    /// Returns `SwarmError::InvalidPolicy` when `n` is zero or more
    /// overrides than candidates are given.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.n == 0 {
            return Err(SwarmError::invalid_policy("best_of", "n must be at least 1"));
        }
        if self.candidates.len() > self.n {
            return Err(SwarmError::invalid_policy(
                "best_of",
                format!(
                    "{} candidate overrides given for only {} candidates",
                    self.candidates.len(),
                    self.n
                ),
            ));
        }
        Ok(())
    }
}

/// JSON schema of the judge's structured output.
pub fn judge_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "winner": { "type": "integer", "minimum": 0 },
            "reasoning": { "type": "string" }
        },
        "required": ["winner", "reasoning"]
    })
}

/// A judge's pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeDecision {
    #[serde(alias = "winnerIndex", alias = "winner_index")]
    pub winner: usize,
    #[serde(default)]
    pub reasoning: String,
    /// Set when the judge's own pick could not be used.
    #[serde(skip)]
    pub fallback: bool,
}

impl JudgeDecision {
    /// Interprets a judge call over `candidates`.
    ///
    /// A failed judge, an unreadable decision or an out-of-range index falls
    /// back to the first successful candidate, or candidate 0 when none
    /// succeeded. The reasoning records why.
    pub fn resolve(judge: &TaskResult, candidates: &[TaskResult]) -> Self {
        let problem = if !judge.is_success() {
            format!("judge failed: {}", judge.failure_reason())
        } else {
            match judge
                .structured_output()
                .map(serde_json::from_value::<JudgeDecision>)
            {
                Some(Ok(decision)) if decision.winner < candidates.len() => return decision,
                Some(Ok(decision)) => format!(
                    "judge picked candidate {} of {}",
                    decision.winner,
                    candidates.len()
                ),
                Some(Err(e)) => format!("judge returned an unreadable decision: {e}"),
                None => "judge returned no decision".to_string(),
            }
        };

        let winner = candidates
            .iter()
            .position(TaskResult::is_success)
            .unwrap_or(0);
        Self {
            winner,
            reasoning: format!("{problem}; falling back to candidate {winner}"),
            fallback: true,
        }
    }
}

/// Lays out candidates for the judge.
///
/// The original item goes under `input/`, candidate `i`'s output files under
/// `candidate_{i}/`, and a manifest of statuses, errors and structured
/// outputs under [`CANDIDATES_MANIFEST`].
pub fn judge_context(input: &Item, candidates: &[TaskResult]) -> Result<Item, SwarmError> {
    let mut combined = input.prefixed("input");
    let mut manifest = Vec::with_capacity(candidates.len());

    for (index, candidate) in candidates.iter().enumerate() {
        combined = combined.merged(&candidate.files.prefixed(&format!("candidate_{index}")));
        manifest.push(json!({
            "index": index,
            "status": candidate.status,
            "error": candidate.error,
            "data": candidate.structured_output(),
        }));
    }

    let manifest = serde_json::to_vec_pretty(&manifest)?;
    Ok(combined.with_file(CANDIDATES_MANIFEST, manifest))
}

/// Runs a tournament for one item.
///
/// `candidate(i)` produces candidate `i`; all `n` run concurrently.
/// `judge(candidates)` is called once with every candidate in index order,
/// after all of them have settled.
///
/// # Errors
///
/// Only infrastructure errors are returned. Candidates are always allowed
/// to settle first.
pub async fn run_tournament<C, CFut, J, JFut>(
    ctx: ItemContext<'_>,
    n: usize,
    candidate: C,
    judge: J,
) -> Result<TaskResult, SwarmError>
where
    C: Fn(usize) -> CFut,
    CFut: Future<Output = Result<TaskResult, SwarmError>>,
    J: FnOnce(Vec<TaskResult>) -> JFut,
    JFut: Future<Output = Result<TaskResult, SwarmError>>,
{
    let n = n.max(1);
    let runs = (0..n).map(|index| {
        candidate(index).map(move |settled| {
            if let Ok(result) = &settled {
                ctx.events.emit(EngineEvent::candidate_complete(
                    ctx.stage_index,
                    ctx.item_index,
                    index,
                    result.status,
                ));
            }
            settled
        })
    });

    let candidates = join_all(runs)
        .await
        .into_iter()
        .collect::<Result<Vec<TaskResult>, SwarmError>>()?;

    let succeeded = candidates.iter().filter(|c| c.is_success()).count();
    debug!(
        stage_index = ctx.stage_index,
        item_index = ctx.item_index,
        candidates = candidates.len(),
        succeeded,
        "All candidates settled, calling judge"
    );

    let verdict = judge(candidates.clone()).await?;
    let decision = JudgeDecision::resolve(&verdict, &candidates);
    if decision.fallback {
        warn!(
            stage_index = ctx.stage_index,
            item_index = ctx.item_index,
            winner = decision.winner,
            reasoning = %decision.reasoning,
            "Judge decision unusable, using fallback winner"
        );
    }

    ctx.events.emit(EngineEvent::judge_complete(
        ctx.stage_index,
        ctx.item_index,
        decision.winner,
        decision.reasoning.clone(),
    ));

    let mut winner = candidates[decision.winner].clone();
    if winner.status == TaskStatus::Error && winner.error.is_none() {
        winner.error = Some("every candidate failed".to_string());
    }
    winner.best_of = Some(BestOfInfo {
        winner_index: decision.winner,
        judge_reasoning: decision.reasoning,
        candidates,
    });
    Ok(winner)
}
