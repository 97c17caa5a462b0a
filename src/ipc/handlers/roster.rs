use serde_json::{json, Map, Value};

use crate::courses;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, get_trimmed_str, require_admin, roster_err, store_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, SheetTable};

fn sheet_param(params: &Value, key: &str) -> Result<SheetTable, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(SheetTable::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| bad_params(format!("{key} is not a sheet table: {e}"))),
    }
}

fn updates_param(params: &Value) -> Result<Map<String, Value>, HandlerErr> {
    params
        .get("updates")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| bad_params("missing updates object"))
}

fn total_labs(store: &crate::store::DocStore) -> Result<i64, HandlerErr> {
    let catalog = courses::load_catalog(store).map_err(store_err)?;
    Ok(courses::total_expected_labs(&catalog))
}

/// Full pipeline behind one lock: refuse concurrent runs, always release,
/// and record the failure text so `students.syncStatus` can surface it.
fn students_sync(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let register = sheet_param(params, "register")?;
    let survey = sheet_param(params, "survey")?;

    if !roster::acquire_sync_lock(&store).map_err(store_err)? {
        return Err(HandlerErr::new(
            "duplicate_request",
            "a roster sync is already running",
        ));
    }
    match roster::run_sync(&store, &register, &survey) {
        Ok(report) => {
            roster::release_sync_lock(&store, true, None).map_err(store_err)?;
            Ok(json!({
                "status": "completed",
                "studentCount": report.student_count,
                "metrics": report.metrics,
            }))
        }
        Err(e) => {
            let message = e.to_string();
            if let Err(release) = roster::release_sync_lock(&store, false, Some(&message)) {
                log::error!("failed to release sync lock: {release}");
            }
            Err(roster_err(e))
        }
    }
}

fn students_sync_status(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let status = roster::sync_status(&store).map_err(store_err)?;
    Ok(json!({ "sync": status }))
}

fn students_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let students = roster::cached_students(&store).map_err(store_err)?;
    Ok(json!({
        "count": students.len(),
        "students": students,
    }))
}

fn students_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let email = get_trimmed_str(params, "email")?.to_lowercase();
    let students = roster::cached_students(&store).map_err(store_err)?;
    let found = students
        .into_iter()
        .find(|row| roster::student_email(row).to_lowercase() == email);
    match found {
        Some(student) => Ok(json!({ "student": student })),
        None => Err(HandlerErr::new(
            "not_found",
            format!("no student with email {email}"),
        )),
    }
}

fn students_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let email = get_trimmed_str(params, "email")?;
    let updates = updates_param(params)?;
    let labs = total_labs(&store)?;
    roster::apply_student_update(&store, &email, &updates, labs).map_err(roster_err)?;
    Ok(json!({ "updated": true }))
}

fn students_bulk_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let Some(updates) = params.get("updates").and_then(Value::as_array) else {
        return Err(bad_params("missing updates array"));
    };
    let labs = total_labs(&store)?;
    let applied = roster::apply_bulk_updates(&store, updates, labs).map_err(roster_err)?;
    Ok(json!({ "updated": applied }))
}

fn students_metrics(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let metrics = roster::latest_metrics(&store).map_err(store_err)?;
    Ok(json!({ "metrics": metrics }))
}

fn students_set_payment_status(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let email = get_trimmed_str(params, "email")?;
    let status = get_trimmed_str(params, "status")?;
    let comment = params.get("comment").and_then(Value::as_str);
    roster::update_payment_status(&store, &email, &status, comment).map_err(roster_err)?;
    Ok(json!({ "updated": true }))
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.sync" => Some(respond(req, students_sync(state, &req.params))),
        "students.syncStatus" => Some(respond(req, students_sync_status(state, &req.params))),
        "students.list" => Some(respond(req, students_list(state, &req.params))),
        "students.get" => Some(respond(req, students_get(state, &req.params))),
        "students.update" => Some(respond(req, students_update(state, &req.params))),
        "students.bulkUpdate" => Some(respond(req, students_bulk_update(state, &req.params))),
        "students.metrics" => Some(respond(req, students_metrics(state, &req.params))),
        "students.setPaymentStatus" => {
            Some(respond(req, students_set_payment_status(state, &req.params)))
        }
        _ => None,
    }
}
