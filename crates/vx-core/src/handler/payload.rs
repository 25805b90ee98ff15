use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{core_error, ErrorKind};

/// Wire shape of a job payload. Both `input_images` (map form) and `images`
/// (list form) may appear; they are merged with the list form winning on
/// duplicate names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobPayload {
    pub version_id: Option<String>,
    #[serde(default)]
    pub workflow: Option<Value>,
    #[serde(default)]
    pub workflow_url: Option<String>,
    #[serde(default)]
    pub input_images: BTreeMap<String, String>,
    #[serde(default)]
    pub images: Vec<NamedImage>,
    #[serde(default)]
    pub output_mode: Option<String>,
    #[serde(default)]
    pub object_bucket: Option<String>,
    #[serde(default)]
    pub object_prefix: Option<String>,
    #[serde(default)]
    pub models_dir: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedImage {
    pub name: String,
    pub image: String,
}

/// The workflow input, after untangling object-vs-string-vs-url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowInput {
    Inline(Value),
    Url(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Base64,
    Object,
}

impl OutputMode {
    /// # Errors
    ///
    /// `usage` for anything but `base64` / `object`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "base64" => Ok(Self::Base64),
            "object" => Ok(Self::Object),
            other => Err(core_error(
                ErrorKind::Usage,
                format!("unknown output mode '{other}' (expected base64 or object)"),
            )),
        }
    }
}

impl JobPayload {
    /// Parse a raw payload, tolerating a serverless envelope (`{"input": …}`).
    ///
    /// # Errors
    ///
    /// `usage` for malformed JSON or unknown fields.
    pub fn parse(raw: &Value) -> Result<Self> {
        let body = match raw.get("input") {
            Some(inner) if inner.is_object() => inner,
            _ => raw,
        };
        serde_json::from_value(body.clone())
            .map_err(|err| core_error(ErrorKind::Usage, format!("malformed job payload: {err}")))
    }

    /// Exactly one of `workflow` / `workflow_url`. A string `workflow` is
    /// parsed as embedded JSON.
    ///
    /// # Errors
    ///
    /// `usage` when neither or both are present, or the inline JSON is bad.
    pub fn workflow_input(&self) -> Result<WorkflowInput> {
        match (&self.workflow, &self.workflow_url) {
            (Some(_), Some(_)) => Err(core_error(
                ErrorKind::Usage,
                "provide either workflow or workflow_url, not both",
            )),
            (None, None) => Err(core_error(
                ErrorKind::Usage,
                "workflow or workflow_url must be provided",
            )),
            (Some(value), None) => match value {
                Value::String(text) => {
                    let parsed: Value = serde_json::from_str(text).map_err(|err| {
                        core_error(
                            ErrorKind::Usage,
                            format!("workflow string is not valid JSON: {err}"),
                        )
                    })?;
                    Ok(WorkflowInput::Inline(parsed))
                }
                Value::Object(_) | Value::Array(_) => Ok(WorkflowInput::Inline(value.clone())),
                _ => Err(core_error(
                    ErrorKind::Usage,
                    "workflow must be a JSON object or a JSON string",
                )),
            },
            (None, Some(url)) => Ok(WorkflowInput::Url(url.clone())),
        }
    }

    /// Merge the two input declarations into one `logical name -> url` map.
    #[must_use]
    pub fn merged_inputs(&self) -> BTreeMap<String, String> {
        let mut merged = self.input_images.clone();
        for image in &self.images {
            merged.insert(image.name.clone(), image.image.clone());
        }
        merged
    }

    /// # Errors
    ///
    /// `usage` when version_id is absent or blank.
    pub fn require_version_id(&self) -> Result<&str> {
        self.version_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| core_error(ErrorKind::Usage, "version_id is required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_envelope_and_flat_payloads() {
        let flat = JobPayload::parse(&json!({
            "version_id": "v1",
            "workflow": {},
        }))
        .expect("flat");
        assert_eq!(flat.require_version_id().expect("id"), "v1");

        let envelope = JobPayload::parse(&json!({
            "input": {"version_id": "v2", "workflow_url": "https://host/wf.json"}
        }))
        .expect("envelope");
        assert_eq!(envelope.require_version_id().expect("id"), "v2");
        assert_eq!(
            envelope.workflow_input().expect("input"),
            WorkflowInput::Url("https://host/wf.json".to_string())
        );
    }

    #[test]
    fn workflow_xor_workflow_url() {
        let both = JobPayload::parse(&json!({
            "version_id": "v",
            "workflow": {},
            "workflow_url": "https://host/wf.json"
        }))
        .expect("parse");
        assert!(both.workflow_input().is_err());

        let neither = JobPayload::parse(&json!({"version_id": "v"})).expect("parse");
        assert!(neither.workflow_input().is_err());
    }

    #[test]
    fn string_workflow_is_parsed_as_json() {
        let payload = JobPayload::parse(&json!({
            "version_id": "v",
            "workflow": "{\"9\": {\"class_type\": \"SaveImage\", \"inputs\": {}}}"
        }))
        .expect("parse");
        let WorkflowInput::Inline(value) = payload.workflow_input().expect("input") else {
            panic!("expected inline");
        };
        assert!(value.get("9").is_some());
    }

    #[test]
    fn list_form_wins_over_map_form_on_merge() {
        let payload = JobPayload::parse(&json!({
            "version_id": "v",
            "workflow": {},
            "input_images": {"a.png": "https://host/map.png", "b.png": "https://host/b.png"},
            "images": [{"name": "a.png", "image": "https://host/list.png"}]
        }))
        .expect("parse");
        let merged = payload.merged_inputs();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["a.png"], "https://host/list.png");
        assert_eq!(merged["b.png"], "https://host/b.png");
    }

    #[test]
    fn unknown_fields_are_a_usage_error() {
        let err = JobPayload::parse(&json!({
            "version_id": "v",
            "workflow": {},
            "wrokflow": {}
        }))
        .expect_err("typo must fail");
        assert_eq!(crate::errors::classify(&err), ErrorKind::Usage);
    }

    #[test]
    fn missing_version_id_is_usage() {
        let payload = JobPayload::parse(&json!({"workflow": {}})).expect("parse");
        let err = payload.require_version_id().expect_err("missing");
        assert_eq!(crate::errors::classify(&err), ErrorKind::Usage);
    }
}
