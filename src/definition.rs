//! YAML pipeline definitions.
//!
//! A definition file describes a pipeline declaratively:
//!
//! ```yaml
//! name: review
//! retry:
//!   max_attempts: 2
//!   backoff_ms: 500
//! stages:
//!   - type: transform
//!     name: draft
//!     prompt: Write a summary of the document.
//!     verify:
//!       prompt: Check that the summary is faithful.
//!       max_attempts: 3
//!   - type: gate
//!     prompt: Score the summary from 0 to 10.
//!     schema: { type: object, properties: { score: { type: integer } } }
//!     conditions:
//!       - { field: score, op: gte, value: 8 }
//!     emit: success
//!   - type: synthesis
//!     prompt: Merge the summaries into one report.
//! ```
//!
//! Loading converts the file into a [`Pipeline`]; every configuration error
//! surfaces there, before any executor call.

use std::cmp::Ordering;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SwarmError;
use crate::pipeline::Pipeline;
use crate::quality::{BestOfPolicy, QualityPolicy, VerifyPolicy};
use crate::retry::{RetryPolicy, RetrySettings};
use crate::stage::{Emit, GateStage, StageConfig, SynthesisStage, TransformStage};

/// Root of a definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Retry settings for stages that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    pub stages: Vec<StageDefinition>,
}

/// One stage of a definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageDefinition {
    Transform(TransformDefinition),
    Gate(GateDefinition),
    Synthesis(SynthesisDefinition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub retry: Option<RetrySettings>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub verify: Option<VerifyPolicy>,
    #[serde(default)]
    pub best_of: Option<BestOfPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub prompt: String,
    pub schema: Value,
    /// All conditions must hold for an item to pass.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub emit: Emit,
    #[serde(default)]
    pub retry: Option<RetrySettings>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub retry: Option<RetrySettings>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Comparison operator of a gate condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
}

/// `field op value` over a gate's structured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot-separated path; numeric segments index into arrays.
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    /// Evaluates the condition. A missing field or incomparable values
    /// never satisfy it, except under `ne`.
    pub fn evaluate(&self, data: &Value) -> bool {
        let Some(actual) = lookup(data, &self.field) else {
            return self.op == CompareOp::Ne;
        };
        match self.op {
            CompareOp::Eq => values_equal(actual, &self.value),
            CompareOp::Ne => !values_equal(actual, &self.value),
            CompareOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            CompareOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CompareOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            CompareOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(data, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn timeout(timeout_ms: Option<u64>) -> Option<Duration> {
    timeout_ms.map(Duration::from_millis)
}

fn stage_label(index: usize, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("stage {index} ('{name}')"),
        None => format!("stage {index}"),
    }
}

impl PipelineDefinition {
    /// Parses a definition from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SwarmError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and parses a definition file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SwarmError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Builds the pipeline described by this definition.
    ///
    /// # Errors
    ///
    /// Returns `SwarmError::Definition` for an empty pipeline, a transform
    /// stage declaring both `verify` and `best_of`, or a gate without
    /// conditions. Policy and ordering errors surface as they do for
    /// pipelines built in code.
    pub fn into_pipeline(self) -> Result<Pipeline, SwarmError> {
        if self.stages.is_empty() {
            return Err(SwarmError::Definition(
                "a pipeline needs at least one stage".to_string(),
            ));
        }

        let fallback_retry = self.retry.map(RetryPolicy::from);
        let resolve_retry = |retry: Option<RetrySettings>| {
            retry.map(RetryPolicy::from).or_else(|| fallback_retry.clone())
        };

        let mut pipeline = Pipeline::new();
        for (index, stage) in self.stages.into_iter().enumerate() {
            let stage: StageConfig = match stage {
                StageDefinition::Transform(def) => {
                    let quality = match (def.verify, def.best_of) {
                        (Some(_), Some(_)) => {
                            return Err(SwarmError::Definition(format!(
                                "{}: verify and best_of are mutually exclusive",
                                stage_label(index, def.name.as_deref())
                            )))
                        }
                        (Some(verify), None) => QualityPolicy::Verify(verify),
                        (None, Some(best_of)) => QualityPolicy::BestOf(best_of),
                        (None, None) => QualityPolicy::Plain,
                    };
                    TransformStage {
                        name: def.name,
                        prompt: def.prompt.into(),
                        schema: def.schema,
                        retry: resolve_retry(def.retry),
                        quality,
                        timeout: timeout(def.timeout_ms),
                    }
                    .into()
                }
                StageDefinition::Gate(def) => {
                    if def.conditions.is_empty() {
                        return Err(SwarmError::Definition(format!(
                            "{}: a gate needs at least one condition",
                            stage_label(index, def.name.as_deref())
                        )));
                    }
                    let conditions = def.conditions;
                    let mut gate = GateStage::new(def.prompt, def.schema, move |data: &Value| {
                        conditions.iter().all(|condition| condition.evaluate(data))
                    })
                    .with_emit(def.emit);
                    gate.name = def.name;
                    gate.retry = resolve_retry(def.retry);
                    gate.timeout = timeout(def.timeout_ms);
                    gate.into()
                }
                StageDefinition::Synthesis(def) => SynthesisStage {
                    name: def.name,
                    prompt: def.prompt.into(),
                    schema: def.schema,
                    retry: resolve_retry(def.retry),
                    timeout: timeout(def.timeout_ms),
                }
                .into(),
            };
            pipeline = pipeline.then(stage)?;
        }
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const REVIEW: &str = r#"
name: review
retry:
  max_attempts: 2
  backoff_ms: 10
stages:
  - type: transform
    name: draft
    prompt: Write a summary.
    verify:
      prompt: Check the summary.
  - type: gate
    prompt: Score it.
    schema: { type: object }
    conditions:
      - { field: score, op: gte, value: 8 }
    emit: filtered
  - type: synthesis
    prompt: Merge.
"#;

    #[test]
    fn test_parse_and_build() {
        let definition = PipelineDefinition::from_yaml_str(REVIEW).expect("parses");
        assert_eq!(definition.name.as_deref(), Some("review"));
        assert_eq!(definition.stages.len(), 3);

        let pipeline = definition.into_pipeline().expect("valid");
        assert_eq!(
            pipeline.describe(),
            vec![
                "0: transform 'draft' (verify, 3 attempts)".to_string(),
                "1: gate (emit filtered)".to_string(),
                "2: synthesis".to_string(),
            ]
        );
        assert_eq!(pipeline.stages()[2].retry().map(|r| r.max_attempts), Some(2));
    }

    #[test]
    fn test_verify_and_best_of_conflict() {
        let yaml = r#"
stages:
  - type: transform
    prompt: x
    verify: { prompt: check }
    best_of: { n: 2, judge_prompt: pick }
"#;
        let err = PipelineDefinition::from_yaml_str(yaml)
            .and_then(PipelineDefinition::into_pipeline)
            .expect_err("conflict");
        assert!(matches!(err, SwarmError::Definition(ref m) if m.contains("mutually exclusive")));
    }

    #[test]
    fn test_stage_after_synthesis_is_rejected() {
        let yaml = r#"
stages:
  - type: synthesis
    prompt: merge
  - type: transform
    prompt: too late
"#;
        let err = PipelineDefinition::from_yaml_str(yaml)
            .and_then(PipelineDefinition::into_pipeline)
            .expect_err("terminal");
        assert!(matches!(err, SwarmError::TerminalStage { .. }));
    }

    #[test]
    fn test_gate_without_conditions_is_rejected() {
        let yaml = r#"
stages:
  - type: gate
    prompt: score
    schema: { type: object }
"#;
        let err = PipelineDefinition::from_yaml_str(yaml)
            .and_then(PipelineDefinition::into_pipeline)
            .expect_err("no conditions");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_conditions() {
        let data = json!({"score": 8, "review": {"verdict": "ok", "tags": ["a", "b"]}});
        let condition = |field: &str, op, value| Condition {
            field: field.to_string(),
            op,
            value,
        };

        assert!(condition("score", CompareOp::Gte, json!(8)).evaluate(&data));
        assert!(!condition("score", CompareOp::Gt, json!(8)).evaluate(&data));
        assert!(condition("score", CompareOp::Eq, json!(8.0)).evaluate(&data));
        assert!(condition("review.verdict", CompareOp::Eq, json!("ok")).evaluate(&data));
        assert!(condition("review.tags.1", CompareOp::Eq, json!("b")).evaluate(&data));
        assert!(!condition("missing", CompareOp::Lt, json!(3)).evaluate(&data));
        assert!(condition("missing", CompareOp::Ne, json!(3)).evaluate(&data));
        assert!(!condition("review", CompareOp::Gt, json!(1)).evaluate(&data));
    }

    #[test]
    fn test_operator_aliases() {
        let condition: Condition =
            serde_yaml::from_str("{ field: score, op: '>=', value: 5 }").expect("parses");
        assert_eq!(condition.op, CompareOp::Gte);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(REVIEW.as_bytes()).expect("write");

        let definition = PipelineDefinition::from_path(file.path()).expect("loads");
        assert_eq!(definition.stages.len(), 3);

        let missing = PipelineDefinition::from_path("/nonexistent/pipeline.yaml");
        assert!(matches!(missing, Err(SwarmError::Io(_))));
    }
}
