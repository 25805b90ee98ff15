use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

/// Recursively sort every object in a JSON value by key.
///
/// `serde_json::Map` preserves insertion order, so a freshly deserialized
/// document may carry whatever order the author used. Sorting before
/// serialization is what makes repeated resolution byte-identical.
pub fn sort_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, child) in entries.iter_mut() {
                sort_json_value(child);
            }
            *map = entries.into_iter().collect();
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                sort_json_value(item);
            }
        }
        _ => {}
    }
}

/// Serialize a document to canonical bytes: sorted keys, 2-space indent,
/// LF line endings, trailing newline.
///
/// # Errors
///
/// Returns an error when the value cannot be represented as JSON.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut tree = serde_json::to_value(value).context("failed to encode document as JSON")?;
    sort_json_value(&mut tree);
    let mut bytes =
        serde_json::to_vec_pretty(&tree).context("failed to serialize canonical JSON")?;
    bytes.push(b'\n');
    Ok(bytes)
}
