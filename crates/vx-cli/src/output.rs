use serde_json::Value;
use vx_core::ExecutionOutcome;

use crate::cli::VxCli;

/// Render a successful outcome: a JSON envelope with `--json`, otherwise a
/// short human report (plan lines and warnings included when present).
pub fn emit_outcome(cli: &VxCli, outcome: &ExecutionOutcome) {
    if cli.json {
        let envelope = serde_json::json!({
            "status": "ok",
            "message": outcome.message,
            "details": outcome.details,
        });
        println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
        return;
    }
    if cli.quiet {
        return;
    }
    println!("[OK] {}", outcome.message);
    if let Some(plan) = outcome.details.get("plan").and_then(Value::as_array) {
        for line in plan.iter().filter_map(Value::as_str) {
            println!("{line}");
        }
    }
    if let Some(warnings) = outcome.details.get("warnings").and_then(Value::as_array) {
        for warning in warnings.iter().filter_map(Value::as_str) {
            eprintln!("[WARN] {warning}");
        }
    }
    if let Some(response) = outcome.details.get("response") {
        if let Some(url) = response.get("object_url").and_then(Value::as_str) {
            // First stdout line of a delivery is the object URL.
            println!("{url}");
        } else if let Some(encoded) = response.get("base64").and_then(Value::as_str) {
            println!("{encoded}");
        }
    }
}
