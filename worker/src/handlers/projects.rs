use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;

use nimbus_core::ProjectPermissions;
use nimbus_core::analyze_repository;
use nimbus_core::safe_repo_path;

use crate::WorkerContext;
use crate::processor::HandlerError;
use crate::processor::HandlerResult;
use crate::processor::Outcome;
use crate::processor::require_str;

pub fn list(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(json!(ctx.projects.list(&ctx.history))))
}

pub fn get(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let project_id = require_str(payload, "project_id")?;
    match ctx.projects.get(project_id)? {
        Some(project) => Ok(Outcome::Value(json!(project))),
        None => Err(HandlerError::new(format!("Project {project_id} not found"))),
    }
}

pub fn create(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let name = require_str(payload, "name")?;
    let description = payload
        .get("description")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let scope_path = payload
        .get("scopePath")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let permissions: Option<ProjectPermissions> = payload
        .get("permissions")
        .map(|p| serde_json::from_value(p.clone()))
        .transpose()
        .map_err(|e| HandlerError::new(format!("invalid permissions: {e}")))?;
    let project = ctx.projects.create(name, description, scope_path, permissions)?;
    Ok(Outcome::Value(json!(project)))
}

pub fn update(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let project_id = require_str(payload, "project_id")?;
    let updates = payload.get("updates").unwrap_or(payload);
    match ctx.projects.update(project_id, updates)? {
        Some(project) => Ok(Outcome::Value(json!(project))),
        None => Err(HandlerError::new(format!("Project {project_id} not found"))),
    }
}

pub fn delete(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let project_id = require_str(payload, "project_id")?;
    let deleted = ctx
        .projects
        .delete(project_id, &ctx.memory, &ctx.history)?;
    Ok(Outcome::Value(json!({"success": deleted})))
}

/// Attaches a repository after the path-safety precheck; with
/// `analyze: true` the analysis result is cached on the repo entry.
pub fn add_repo(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let project_id = require_str(payload, "project_id")?;
    let repo_path = require_str(payload, "repo_path")?;
    let resolved = match safe_repo_path(repo_path) {
        Ok(path) => path,
        Err(reason) => {
            return Ok(Outcome::Value(json!({"success": false, "error": reason})));
        }
    };

    let analysis = if payload.get("analyze").and_then(JsonValue::as_bool) == Some(true) {
        Some(json!(analyze_repository(&resolved)?))
    } else {
        None
    };

    match ctx
        .projects
        .add_repo(project_id, &resolved.display().to_string(), analysis)?
    {
        Some(project) => Ok(Outcome::Value(json!({"success": true, "project": project}))),
        None => Err(HandlerError::new(format!("Project {project_id} not found"))),
    }
}

pub fn remove_repo(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let project_id = require_str(payload, "project_id")?;
    let repo_path = require_str(payload, "repo_path")?;
    match ctx.projects.remove_repo(project_id, repo_path)? {
        Some(project) => Ok(Outcome::Value(json!({"success": true, "project": project}))),
        None => Err(HandlerError::new(format!("Project {project_id} not found"))),
    }
}

pub fn get_or_create_orphan(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(json!(ctx.projects.get_or_create_orphan()?)))
}
