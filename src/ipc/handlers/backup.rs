use std::path::PathBuf;

use serde_json::{json, Value};

use crate::backup;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_trimmed_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::DocStore;

/// `workspacePath` in the params wins over the selected workspace, so a
/// bundle can be exported from or restored into a workspace that is not
/// currently open.
fn workspace_for(state: &AppState, params: &Value) -> Result<PathBuf, HandlerErr> {
    params
        .get("workspacePath")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn export_bundle(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let out_path = get_trimmed_str(params, "outPath")?;
    let workspace_path = workspace_for(state, params)?;

    let out = PathBuf::from(&out_path);
    let export = backup::export_workspace_bundle(&workspace_path, &out).map_err(|e| {
        HandlerErr::with_details("io_failed", e.to_string(), json!({ "path": out_path.clone() }))
    })?;
    Ok(json!({
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
    }))
}

fn import_bundle(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let in_path = get_trimmed_str(params, "inPath")?;
    let workspace_path = workspace_for(state, params)?;

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(HandlerErr::with_details(
            "not_found",
            "bundle file not found",
            json!({ "path": in_path }),
        ));
    }

    // Drop every open handle before replacing the file. Poll sessions keep
    // store clones alive, so they go first.
    state.reset_workspace_state();
    state.store = None;

    let import = backup::import_workspace_bundle(&src, &workspace_path).map_err(|e| {
        HandlerErr::with_details(
            "io_failed",
            e.to_string(),
            json!({ "path": src.to_string_lossy() }),
        )
    })?;

    match DocStore::open(&workspace_path) {
        Ok(store) => {
            state.workspace = Some(workspace_path.clone());
            state.store = Some(store);
            Ok(json!({
                "workspacePath": workspace_path.to_string_lossy(),
                "bundleFormatDetected": import.bundle_format_detected,
            }))
        }
        Err(e) => Err(HandlerErr::new("db_open_failed", e.to_string())),
    }
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(respond(req, export_bundle(state, &req.params))),
        "backup.importWorkspaceBundle" => Some(respond(req, import_bundle(state, &req.params))),
        _ => None,
    }
}
