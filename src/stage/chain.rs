//! Hand-off of items between consecutive stages.
//!
//! Every stage's executor writes its structured output to `result.json`.
//! Before an item moves on, the file from stage `k` is moved to
//! `stage-{k}.result.json` so the next stage's own `result.json` cannot
//! overwrite it.

use crate::error::SwarmError;
use crate::stage::Emit;
use crate::task::{Item, TaskResult, RESULT_FILE};

/// Path the structured output of stage `stage_index` is moved to.
pub fn chained_result_path(stage_index: usize) -> String {
    format!("stage-{stage_index}.result.json")
}

/// Output files of `result`, with the structured output moved out of the way.
///
/// When the executor returned structured data but no result file, the data
/// is written to the chained path.
pub fn chained_output(result: &TaskResult, stage_index: usize) -> Result<Item, SwarmError> {
    let path = chained_result_path(stage_index);
    if result.files.contains(RESULT_FILE) {
        return Ok(result.files.renamed(RESULT_FILE, &path));
    }
    match &result.data {
        Some(data) if !data.is_null() => Ok(result
            .files
            .clone()
            .with_file(path, serde_json::to_vec_pretty(data)?)),
        _ => Ok(result.files.clone()),
    }
}

/// Chained output of `result`, or `None` after moving it to the error
/// bucket when its output cannot be written.
fn forward_one(result: &mut TaskResult, chained: Result<Item, SwarmError>) -> Option<Item> {
    match chained {
        Ok(item) => Some(item),
        Err(e) => {
            result.mark_failed(format!("failed to forward output: {e}"));
            None
        }
    }
}

/// Items a transform stage forwards: the output of every success.
pub fn forward_transform(results: &mut [TaskResult], stage_index: usize) -> Vec<Item> {
    results
        .iter_mut()
        .filter(|result| result.is_success())
        .filter_map(|result| {
            let chained = chained_output(result, stage_index);
            forward_one(result, chained)
        })
        .collect()
}

/// Items a gate stage forwards: each selected input overlaid with its gate
/// output.
///
/// `results` and `inputs` are parallel, in input order.
pub fn forward_gate(
    inputs: &[Item],
    results: &mut [TaskResult],
    emit: Emit,
    stage_index: usize,
) -> Vec<Item> {
    inputs
        .iter()
        .zip(results.iter_mut())
        .filter(|(_, result)| emit.selects(result.status))
        .filter_map(|(input, result)| {
            let chained = chained_output(result, stage_index);
            forward_one(result, chained).map(|output| input.merged(&output))
        })
        .collect()
}

/// Combined context of a synthesis call: item `i` nested under `item_{i}/`.
pub fn combine_items(items: &[Item]) -> Item {
    items
        .iter()
        .enumerate()
        .fold(Item::new(), |combined, (index, item)| {
            combined.merged(&item.prefixed(&format!("item_{index}")))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use serde_json::json;

    #[test]
    fn test_result_file_is_renamed() {
        let result = TaskResult::success_with_files(
            Item::single(RESULT_FILE, "{}").with_file("draft.md", "text"),
        );
        let item = chained_output(&result, 1).expect("chained");

        assert!(!item.contains(RESULT_FILE));
        assert_eq!(item.get_str("stage-1.result.json"), Some("{}"));
        assert_eq!(item.get_str("draft.md"), Some("text"));
    }

    #[test]
    fn test_data_without_file_is_written() {
        let result = TaskResult::success(json!({"score": 9}));
        let item = chained_output(&result, 0).expect("chained");
        let written: serde_json::Value =
            serde_json::from_slice(item.get("stage-0.result.json").expect("file")).expect("json");
        assert_eq!(written, json!({"score": 9}));
    }

    #[test]
    fn test_gate_forwards_selected_inputs_in_order() {
        let inputs: Vec<Item> = (0..3).map(|i| Item::single("id", i.to_string())).collect();
        let statuses = [TaskStatus::Filtered, TaskStatus::Success, TaskStatus::Filtered];
        let mut results: Vec<TaskResult> = statuses
            .iter()
            .map(|status| {
                let mut result = TaskResult::success(json!({"ok": true}));
                result.status = *status;
                result
            })
            .collect();

        let forwarded = forward_gate(&inputs, &mut results, Emit::Filtered, 2);
        let ids: Vec<&str> = forwarded.iter().filter_map(|i| i.get_str("id")).collect();
        assert_eq!(ids, vec!["0", "2"]);
        assert!(forwarded[0].contains("stage-2.result.json"));
    }

    #[test]
    fn test_transform_drops_errors() {
        let mut results = vec![
            TaskResult::success(json!(1)),
            TaskResult::error("bad"),
            TaskResult::success(json!(3)),
        ];
        assert_eq!(forward_transform(&mut results, 0).len(), 2);
    }

    #[test]
    fn test_unwritable_output_fails_only_its_item() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let mut result = TaskResult::success(json!({"score": 9}));

        assert!(forward_one(&mut result, Err(SwarmError::from(json_error))).is_none());
        assert_eq!(result.status, TaskStatus::Error);
        assert!(result.data.is_none());
        assert!(result
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("failed to forward output")));

        let mut kept = TaskResult::success(json!(1));
        let item = Item::single("a.txt", "1");
        assert_eq!(forward_one(&mut kept, Ok(item.clone())), Some(item));
        assert!(kept.is_success());
    }

    #[test]
    fn test_combine_items() {
        let items = vec![Item::single("a.txt", "1"), Item::single("a.txt", "2")];
        let combined = combine_items(&items);
        assert_eq!(combined.get_str("item_0/a.txt"), Some("1"));
        assert_eq!(combined.get_str("item_1/a.txt"), Some("2"));
    }
}
