use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;

use nimbus_core::ActionType;
use nimbus_core::analyze_repository;
use nimbus_core::safe_repo_path;

use crate::WorkerContext;
use crate::processor::HandlerResult;
use crate::processor::Outcome;
use crate::processor::require_str;

/// Full analysis behind the path-safety precheck. Validation failures are
/// domain results, not dispatcher errors, so the host can render them.
pub fn analyze(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let path = require_str(payload, "path")?;
    let resolved = match safe_repo_path(path) {
        Ok(resolved) => resolved,
        Err(reason) => {
            return Ok(Outcome::Value(json!({"success": false, "error": reason})));
        }
    };
    ctx.audit.log(
        ActionType::FileRead,
        json!({"action": "analyze_repository", "path": resolved.display().to_string()}),
    );
    let analysis = analyze_repository(&resolved)?;
    ctx.monitor
        .add_log(&format!("REPO: analyzed {}", resolved.display()));
    Ok(Outcome::Value(json!({"success": true, "analysis": analysis})))
}

pub fn summary(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let path = require_str(payload, "path")?;
    let resolved = match safe_repo_path(path) {
        Ok(resolved) => resolved,
        Err(reason) => {
            return Ok(Outcome::Value(json!({"success": false, "error": reason})));
        }
    };
    let analysis = analyze_repository(&resolved)?;
    ctx.audit.log(
        ActionType::FileRead,
        json!({"action": "get_repo_summary", "path": resolved.display().to_string()}),
    );
    Ok(Outcome::Value(
        json!({"success": true, "summary": analysis.summary, "stack": analysis.stack}),
    ))
}

pub fn tech_debt(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let path = require_str(payload, "path")?;
    let resolved = match safe_repo_path(path) {
        Ok(resolved) => resolved,
        Err(reason) => {
            return Ok(Outcome::Value(json!({"success": false, "error": reason})));
        }
    };
    let analysis = analyze_repository(&resolved)?;
    ctx.audit.log(
        ActionType::FileRead,
        json!({"action": "detect_tech_debt", "path": resolved.display().to_string()}),
    );
    Ok(Outcome::Value(
        json!({"success": true, "tech_debt": analysis.tech_debt}),
    ))
}
