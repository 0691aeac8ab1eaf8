//! Core data model shared by every part of the engine.
//!
//! - `Item`: an immutable file mapping submitted to a stage
//! - `TaskResult`: the envelope returned for one executor invocation
//! - `TaskMeta`: identifiers threaded through results and requests
//! - `BestOfInfo` / `VerifyInfo`: audit data attached by quality strategies

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File name under which executors place their structured output.
pub const RESULT_FILE: &str = "result.json";

/// One unit of input: relative path mapped to byte content.
///
/// Items are values. A stage never mutates the items it receives; every
/// transformation below returns a new `Item`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item {
    files: BTreeMap<String, Vec<u8>>,
}

impl Item {
    /// Creates an empty item.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an item holding a single file.
    pub fn single(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::new().with_file(path, content)
    }

    /// Returns a copy of this item with `path` set to `content`.
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Returns the content stored at `path`.
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Returns the content at `path` decoded as UTF-8, if valid.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterates over `(path, content)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Iterates over the relative paths in this item.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Returns a new item where every path is nested under `prefix/`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            files: self
                .files
                .iter()
                .map(|(path, content)| (format!("{prefix}/{path}"), content.clone()))
                .collect(),
        }
    }

    /// Returns a new item containing `self` overlaid with `other`.
    ///
    /// Paths present in both take the content from `other`.
    pub fn merged(&self, other: &Item) -> Self {
        let mut files = self.files.clone();
        files.extend(other.files.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { files }
    }

    /// Returns a new item with `from` moved to `to`.
    ///
    /// A missing `from` leaves the item unchanged. An existing `to` is replaced.
    pub fn renamed(&self, from: &str, to: &str) -> Self {
        let mut files = self.files.clone();
        if let Some(content) = files.remove(from) {
            files.insert(to.to_string(), content);
        }
        Self { files }
    }

    /// Returns a new item without `path`.
    pub fn without(&self, path: &str) -> Self {
        let mut files = self.files.clone();
        files.remove(path);
        Self { files }
    }

    /// Total number of content bytes across all files.
    pub fn total_bytes(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

impl<K, V> FromIterator<(K, V)> for Item
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            files: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Outcome classification of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    /// Only produced by gate stages.
    Filtered,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Filtered => "filtered",
            TaskStatus::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part an executor call plays within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    Worker,
    Verifier,
    Candidate,
    Judge,
    Gate,
    Synthesis,
}

impl fmt::Display for TaskRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskRole::Worker => "worker",
            TaskRole::Verifier => "verifier",
            TaskRole::Candidate => "candidate",
            TaskRole::Judge => "judge",
            TaskRole::Gate => "gate",
            TaskRole::Synthesis => "synthesis",
        };
        f.write_str(name)
    }
}

/// Identifiers attached to every result and request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub run_id: Uuid,
    pub stage_index: usize,
    pub item_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_index: Option<usize>,
    /// Number of attempts consumed, set by the retry controller and verify loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<TaskRole>,
    /// Opaque caller correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl TaskMeta {
    pub fn new(run_id: Uuid, stage_index: usize, item_index: usize) -> Self {
        Self {
            run_id,
            stage_index,
            item_index,
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: TaskRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_candidate(mut self, candidate_index: usize) -> Self {
        self.candidate_index = Some(candidate_index);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }
}

/// Audit trail of a best-of tournament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestOfInfo {
    pub winner_index: usize,
    pub judge_reasoning: String,
    /// Every candidate in candidate order, losers included.
    pub candidates: Vec<TaskResult>,
}

/// Outcome of a verify loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyInfo {
    pub passed: bool,
    pub reasoning: String,
    pub attempts: u32,
}

/// Result of one task-executor invocation for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    /// Parsed structured output.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Raw output kept when parsing or validation of `data` failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
    #[serde(default)]
    pub files: Item,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub meta: TaskMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_of: Option<BestOfInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyInfo>,
}

impl TaskResult {
    /// A successful result carrying structured data.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: TaskStatus::Success,
            data: Some(data),
            raw_data: None,
            files: Item::new(),
            error: None,
            meta: TaskMeta::default(),
            best_of: None,
            verify: None,
        }
    }

    /// A successful result with output files and no structured data.
    pub fn success_with_files(files: Item) -> Self {
        Self {
            data: None,
            files,
            ..Self::success(serde_json::Value::Null)
        }
    }

    /// A failed result with a human-readable reason.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            data: None,
            raw_data: None,
            files: Item::new(),
            error: Some(reason.into()),
            meta: TaskMeta::default(),
            best_of: None,
            verify: None,
        }
    }

    pub fn with_files(mut self, files: Item) -> Self {
        self.files = files;
        self
    }

    pub fn with_raw_data(mut self, raw: impl Into<String>) -> Self {
        self.raw_data = Some(raw.into());
        self
    }

    pub fn with_meta(mut self, meta: TaskMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Moves the result to the error bucket, dropping its output.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Error;
        self.error = Some(reason.into());
        self.data = None;
        self.files = Item::new();
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == TaskStatus::Error
    }

    pub fn is_filtered(&self) -> bool {
        self.status == TaskStatus::Filtered
    }

    /// Error text, falling back to the status when the executor gave none.
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("task finished with status '{}'", self.status))
    }

    /// Structured output as a JSON document, preferring `data` over the
    /// result file.
    pub fn structured_output(&self) -> Option<serde_json::Value> {
        if let Some(data) = &self.data {
            if !data.is_null() {
                return Some(data.clone());
            }
        }
        self.files
            .get(RESULT_FILE)
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_builders_do_not_touch_original() {
        let item = Item::single("a.txt", "alpha");
        let renamed = item.renamed("a.txt", "b.txt");

        assert!(item.contains("a.txt"));
        assert!(!renamed.contains("a.txt"));
        assert_eq!(renamed.get_str("b.txt"), Some("alpha"));
    }

    #[test]
    fn test_item_prefixed_and_merged() {
        let item = Item::single("notes.md", "x").with_file("dir/y.txt", "y");
        let nested = item.prefixed("item_0/");
        let paths: Vec<&str> = nested.paths().collect();
        assert_eq!(paths, vec!["item_0/dir/y.txt", "item_0/notes.md"]);

        let overlay = Item::single("notes.md", "z");
        let merged = item.merged(&overlay);
        assert_eq!(merged.get_str("notes.md"), Some("z"));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_item_rename_missing_is_noop() {
        let item = Item::single("a", "1");
        assert_eq!(item.renamed("missing", "b"), item);
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Success.to_string(), "success");
        assert_eq!(TaskStatus::Filtered.to_string(), "filtered");
        assert_eq!(TaskStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_failure_reason_fallback() {
        let err = TaskResult::error("boom");
        assert_eq!(err.failure_reason(), "boom");

        let mut odd = TaskResult::success(json!({}));
        odd.status = TaskStatus::Error;
        assert!(odd.failure_reason().contains("error"));
    }

    #[test]
    fn test_structured_output_prefers_data_then_file() {
        let with_data = TaskResult::success(json!({"score": 3}));
        assert_eq!(with_data.structured_output(), Some(json!({"score": 3})));

        let with_file =
            TaskResult::success_with_files(Item::single(RESULT_FILE, r#"{"score": 9}"#));
        assert_eq!(with_file.structured_output(), Some(json!({"score": 9})));

        let neither = TaskResult::success_with_files(Item::single("out.txt", "hi"));
        assert!(neither.structured_output().is_none());
    }

    #[test]
    fn test_task_result_serialization_skips_empty_fields() {
        let result = TaskResult::success(json!({"ok": true}))
            .with_meta(TaskMeta::new(Uuid::nil(), 1, 2).with_role(TaskRole::Worker));
        let value = serde_json::to_value(&result).expect("serializes");

        assert_eq!(value["status"], "success");
        assert_eq!(value["meta"]["stage_index"], 1);
        assert_eq!(value["meta"]["role"], "worker");
        assert!(value.get("error").is_none());
        assert!(value.get("best_of").is_none());
    }
}
