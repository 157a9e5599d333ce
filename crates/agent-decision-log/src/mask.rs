//! Pointer-restricted mask/drop operations applied during ingest (§4.H stage
//! 1): `{op, path, value?}` entries whose `path` must start with `/input` or
//! `/result`; array-indexing pointers are ignored rather than rejecting the
//! whole event, matching "undefined or array-indexing pointers are ignored".

use agent_types::DecisionEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskOpKind {
    Remove,
    Upsert,
}

/// A single entry returned by the `mask_decision` evaluation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaskOp {
    pub op: MaskOpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// The input handed to the mask/drop decision: `{"input": ..., "result":
/// ...}`, so decision authors can write a single query over both (§4.H).
pub fn decision_input(event: &DecisionEvent) -> Value {
    serde_json::json!({"input": event.input, "result": event.result})
}

/// Apply `ops` to `event.input`/`event.result`, recording the pointer of
/// every operation that actually took effect in `event.erased`/`masked`.
pub fn apply(mut event: DecisionEvent, ops: &[MaskOp]) -> DecisionEvent {
    let mut wrapper = decision_input(&event);

    for op in ops {
        if !(op.path.starts_with("/input") || op.path.starts_with("/result")) {
            continue;
        }
        if has_array_index_segment(&op.path) {
            continue;
        }
        match op.op {
            MaskOpKind::Remove => {
                if remove_pointer(&mut wrapper, &op.path).is_some() {
                    event.erased.push(op.path.clone());
                }
            }
            MaskOpKind::Upsert => {
                if let Some(value) = op.value.clone()
                    && set_pointer(&mut wrapper, &op.path, value)
                {
                    event.masked.push(op.path.clone());
                }
            }
        }
    }

    event.input = wrapper.get("input").cloned().unwrap_or(Value::Null);
    event.result = wrapper.get("result").cloned().unwrap_or(Value::Null);
    event
}

fn pointer_segments(path: &str) -> Option<Vec<String>> {
    if path.is_empty() {
        return Some(Vec::new());
    }
    if !path.starts_with('/') {
        return None;
    }
    Some(path[1..].split('/').map(|s| s.replace("~1", "/").replace("~0", "~")).collect())
}

fn has_array_index_segment(path: &str) -> bool {
    pointer_segments(path)
        .unwrap_or_default()
        .iter()
        .any(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}

fn navigate_mut<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in segments {
        cur = cur.as_object_mut()?.get_mut(seg)?;
    }
    Some(cur)
}

fn navigate_mut_create<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in segments {
        if !cur.is_object() {
            *cur = Value::Object(Default::default());
        }
        cur = cur.as_object_mut()?.entry(seg.clone()).or_insert_with(|| Value::Object(Default::default()));
    }
    Some(cur)
}

fn remove_pointer(root: &mut Value, path: &str) -> Option<Value> {
    let segments = pointer_segments(path)?;
    let (last, parent_segments) = segments.split_last()?;
    let parent = navigate_mut(root, parent_segments)?;
    parent.as_object_mut()?.remove(last)
}

fn set_pointer(root: &mut Value, path: &str, value: Value) -> bool {
    let Some(segments) = pointer_segments(path) else { return false };
    let Some((last, parent_segments)) = segments.split_last() else { return false };
    let Some(parent) = navigate_mut_create(root, parent_segments) else { return false };
    if !parent.is_object() {
        *parent = Value::Object(Default::default());
    }
    parent.as_object_mut().expect("just coerced to object").insert(last.clone(), value);
    true
}
