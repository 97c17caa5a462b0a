use serde_json::{json, Value};

use crate::announcements::{self, Announcement};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    announcement_err, get_required_str, get_trimmed_str, require_admin, require_store, store_err,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::StoreError;

fn announcement_json(announcement: &Announcement) -> Result<Value, HandlerErr> {
    serde_json::to_value(announcement).map_err(|e| store_err(StoreError::from(e)))
}

fn create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let title = get_trimmed_str(params, "title")?;
    let body = get_trimmed_str(params, "body")?;
    let author = params
        .get("author")
        .and_then(Value::as_str)
        .unwrap_or("");

    let announcement = announcements::create_announcement(&store, &title, &body, author)
        .map_err(announcement_err)?;
    Ok(json!({ "announcement": announcement_json(&announcement)? }))
}

fn list(state: &AppState) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let announcements = announcements::list_announcements(&store).map_err(store_err)?;
    let announcements: Vec<Value> = announcements
        .iter()
        .map(announcement_json)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "announcements": announcements }))
}

fn delete(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let id = get_required_str(params, "id")?;
    let deleted = announcements::delete_announcement(&store, &id).map_err(store_err)?;
    Ok(json!({ "deleted": deleted }))
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "announcements.create" => Some(respond(req, create(state, &req.params))),
        "announcements.list" => Some(respond(req, list(state))),
        "announcements.delete" => Some(respond(req, delete(state, &req.params))),
        _ => None,
    }
}
