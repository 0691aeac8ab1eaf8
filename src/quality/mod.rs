//! Quality strategies applied to transform stages.
//!
//! A transform stage runs each item under exactly one [`QualityPolicy`]:
//!
//! - **Plain**: a single retry-wrapped worker call
//! - **Verify**: a worker/verifier feedback loop ([`verify`])
//! - **BestOf**: N concurrent candidates and one judge ([`best_of`])

pub mod best_of;
pub mod verify;

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

pub use best_of::{
    judge_context, judge_schema, run_tournament, BestOfPolicy, CandidateOverride, JudgeDecision,
    CANDIDATES_MANIFEST,
};
pub use verify::{
    feedback_prompt, run_verify_loop, verdict_schema, verifier_context, Verdict, VerifyPolicy,
};

/// How a transform stage raises output quality for each item.
///
/// Verify and best-of are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QualityPolicy {
    #[default]
    Plain,
    Verify(VerifyPolicy),
    BestOf(BestOfPolicy),
}

impl QualityPolicy {
    /// Short name used in logs and plan summaries.
    pub fn mode(&self) -> &'static str {
        match self {
            QualityPolicy::Plain => "plain",
            QualityPolicy::Verify(_) => "verify",
            QualityPolicy::BestOf(_) => "best_of",
        }
    }

    pub fn validate(&self) -> Result<(), SwarmError> {
        match self {
            QualityPolicy::Plain => Ok(()),
            QualityPolicy::Verify(policy) => policy.validate(),
            QualityPolicy::BestOf(policy) => policy.validate(),
        }
    }
}
