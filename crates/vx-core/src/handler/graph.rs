//! Workflow rewriting: swap logical input file names for their staged,
//! request-unique counterparts.
//!
//! Two graph shapes exist in the wild. The server-API shape is a map of
//! `node_id -> {class_type, inputs}`; the editor shape is an object with a
//! top-level `nodes` array whose entries carry `type` and `inputs`. One
//! rewrite routine handles both behind a small node-accessor seam; only the
//! recognized loader classes are touched, everything else passes through
//! byte-for-byte.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

/// Loader classes and the input slot each one reads its file name from.
const LOADER_CLASSES: &[(&str, &str)] = &[
    ("LoadImage", "image"),
    ("LoadImageMask", "image"),
    ("VHS_LoadVideo", "video"),
];

/// A mutable view over one graph node, regardless of shape.
trait NodeAccessor {
    fn class_name(&self) -> Option<&str>;
    fn input(&self, name: &str) -> Option<&str>;
    fn set_input(&mut self, name: &str, value: String);
}

struct ApiNode<'a>(&'a mut Value);

impl NodeAccessor for ApiNode<'_> {
    fn class_name(&self) -> Option<&str> {
        self.0.get("class_type").and_then(Value::as_str)
    }

    fn input(&self, name: &str) -> Option<&str> {
        self.0.get("inputs")?.get(name)?.as_str()
    }

    fn set_input(&mut self, name: &str, value: String) {
        if let Some(inputs) = self.0.get_mut("inputs").and_then(Value::as_object_mut) {
            inputs.insert(name.to_string(), Value::String(value));
        }
    }
}

struct EditorNode<'a>(&'a mut Value);

impl NodeAccessor for EditorNode<'_> {
    fn class_name(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    fn input(&self, name: &str) -> Option<&str> {
        self.0.get("inputs")?.get(name)?.as_str()
    }

    fn set_input(&mut self, name: &str, value: String) {
        if let Some(inputs) = self.0.get_mut("inputs").and_then(Value::as_object_mut) {
            inputs.insert(name.to_string(), Value::String(value));
        }
    }
}

/// Rewrite loader references in place; returns how many inputs changed.
///
/// `staged` maps logical names (as the graph author wrote them) to
/// materialized names. Unrecognized node classes and unmapped names are left
/// untouched.
pub fn rewrite_workflow(workflow: &mut Value, staged: &BTreeMap<String, String>) -> usize {
    if staged.is_empty() {
        return 0;
    }
    // Shape detection: an editor export has a top-level `nodes` array.
    if let Some(nodes) = workflow.get_mut("nodes").and_then(Value::as_array_mut) {
        let mut rewritten = 0;
        for node in nodes.iter_mut() {
            rewritten += rewrite_node(&mut EditorNode(node), staged);
        }
        return rewritten;
    }
    let Some(map) = workflow.as_object_mut() else {
        return 0;
    };
    let mut rewritten = 0;
    for node in map.values_mut() {
        rewritten += rewrite_node(&mut ApiNode(node), staged);
    }
    rewritten
}

fn rewrite_node(node: &mut impl NodeAccessor, staged: &BTreeMap<String, String>) -> usize {
    let Some(class) = node.class_name().map(ToOwned::to_owned) else {
        return 0;
    };
    let Some((_, slot)) = LOADER_CLASSES.iter().find(|(name, _)| *name == class) else {
        return 0;
    };
    let Some(current) = node.input(slot).map(ToOwned::to_owned) else {
        return 0;
    };
    let Some(materialized) = staged.get(&current) else {
        return 0;
    };
    debug!(%class, from = %current, to = %materialized, "rewrote loader input");
    node.set_input(slot, materialized.clone());
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn staged() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(
            "img.png".to_string(),
            "req-1_0a0a0a0a_img.png".to_string(),
        );
        map
    }

    #[test]
    fn rewrites_api_shape_loaders() {
        let mut workflow = json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": "img.png"}},
            "2": {"class_type": "KSampler", "inputs": {"seed": 42, "image": "img.png"}},
            "3": {"class_type": "LoadImageMask", "inputs": {"image": "other.png"}}
        });
        let rewritten = rewrite_workflow(&mut workflow, &staged());
        assert_eq!(rewritten, 1);
        assert_eq!(
            workflow["1"]["inputs"]["image"],
            "req-1_0a0a0a0a_img.png"
        );
        // Non-loader nodes keep their inputs even when the value matches.
        assert_eq!(workflow["2"]["inputs"]["image"], "img.png");
        // Loaders referencing unstaged names are untouched.
        assert_eq!(workflow["3"]["inputs"]["image"], "other.png");
    }

    #[test]
    fn rewrites_editor_shape_loaders() {
        let mut workflow = json!({
            "last_node_id": 3,
            "nodes": [
                {"id": 1, "type": "LoadImage", "inputs": {"image": "img.png"}},
                {"id": 2, "type": "VHS_LoadVideo", "inputs": {"video": "img.png"}},
                {"id": 3, "type": "PreviewImage", "inputs": {}}
            ],
            "links": []
        });
        let rewritten = rewrite_workflow(&mut workflow, &staged());
        assert_eq!(rewritten, 2);
        assert_eq!(
            workflow["nodes"][0]["inputs"]["image"],
            "req-1_0a0a0a0a_img.png"
        );
        assert_eq!(
            workflow["nodes"][1]["inputs"]["video"],
            "req-1_0a0a0a0a_img.png"
        );
        // Surrounding structure survives.
        assert_eq!(workflow["last_node_id"], 3);
        assert!(workflow["links"].as_array().expect("links").is_empty());
    }

    #[test]
    fn empty_staging_map_is_a_no_op() {
        let original = json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": "img.png"}}
        });
        let mut workflow = original.clone();
        assert_eq!(rewrite_workflow(&mut workflow, &BTreeMap::new()), 0);
        assert_eq!(workflow, original);
    }

    #[test]
    fn tolerates_odd_graphs() {
        let mut not_an_object = json!([1, 2, 3]);
        assert_eq!(rewrite_workflow(&mut not_an_object, &staged()), 0);

        let mut missing_inputs = json!({
            "1": {"class_type": "LoadImage"}
        });
        assert_eq!(rewrite_workflow(&mut missing_inputs, &staged()), 0);

        let mut non_string_input = json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": ["link", 0]}}
        });
        assert_eq!(rewrite_workflow(&mut non_string_input, &staged()), 0);
    }
}
