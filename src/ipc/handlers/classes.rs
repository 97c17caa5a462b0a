use serde_json::{json, Value};

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, get_trimmed_str, require_admin, roster_err, store_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, AttendanceStatus};

fn classes_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let classes = roster::list_classes(&store).map_err(store_err)?;
    Ok(json!({ "classes": classes }))
}

fn classes_add(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let Some(class) = params.get("class") else {
        return Err(bad_params("missing class object"));
    };
    let stored = roster::add_class(&store, class.clone()).map_err(roster_err)?;
    Ok(json!({ "class": stored }))
}

fn classes_delete(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let class_id = get_trimmed_str(params, "classId")?;
    let deleted = roster::delete_class(&store, &class_id).map_err(store_err)?;
    Ok(json!({ "deleted": deleted }))
}

/// Present students get `true` for the class, everyone else `false`. A
/// second request for the same class while one is running is refused, not
/// queued.
fn classes_mark_attendance(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let class_id = get_trimmed_str(params, "classId")?;
    let Some(items) = params.get("presentEmails").and_then(Value::as_array) else {
        return Err(bad_params("missing presentEmails array"));
    };
    let mut present = Vec::with_capacity(items.len());
    for item in items {
        let Some(email) = item.as_str() else {
            return Err(bad_params("presentEmails must be strings"));
        };
        present.push(email.to_string());
    }

    let outcome = roster::bulk_mark_attendance(&store, &state.class_locks, &class_id, &present)
        .map_err(roster_err)?;
    match outcome.status {
        AttendanceStatus::DuplicateRequest => Err(HandlerErr::new(
            "duplicate_request",
            format!("attendance marking already in progress for class {class_id}"),
        )),
        AttendanceStatus::Failed => Err(HandlerErr::new(
            "validation_failed",
            "no student records to mark attendance for",
        )),
        _ => Ok(json!({
            "status": outcome.status.as_str(),
            "updated": outcome.updated,
            "skipped": outcome.skipped,
        })),
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
        "classes.list" => Some(respond(req, classes_list(state, &req.params))),
        "classes.add" => Some(respond(req, classes_add(state, &req.params))),
        "classes.delete" => Some(respond(req, classes_delete(state, &req.params))),
        "classes.markAttendance" => Some(respond(req, classes_mark_attendance(state, &req.params))),
        _ => None,
    }
}
