use serde_json::{json, Value};
use uuid::Uuid;

use crate::dashboard::{PollSession, RejectionKind};
use crate::ipc::error::ok;
use crate::ipc::handlers::polls::outcome_json;
use crate::ipc::helpers::{get_trimmed_str, require_store, store_err, vote_err, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::polls::{Identity, Poll};

fn local_poll_json(poll: Option<&Poll>) -> Result<Value, HandlerErr> {
    match poll {
        Some(poll) => serde_json::to_value(poll)
            .map_err(|e| store_err(crate::store::StoreError::from(e))),
        None => Ok(Value::Null),
    }
}

fn poll_open(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let uid = get_trimmed_str(params, "uid")?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let poll_id = get_trimmed_str(params, "pollId")?;

    let session = PollSession::open(&store, Identity { uid, name }, &poll_id).map_err(vote_err)?;
    let poll = local_poll_json(session.poll())?;
    let selected = session.selected().map(str::to_string);

    let session_id = Uuid::new_v4().to_string();
    state.sessions.insert(session_id.clone(), session);
    Ok(json!({
        "sessionId": session_id,
        "poll": poll,
        "selectedOptionId": selected,
    }))
}

fn session_mut<'a>(
    state: &'a mut AppState,
    params: &Value,
) -> Result<(&'a mut PollSession, String), HandlerErr> {
    let session_id = get_trimmed_str(params, "sessionId")?;
    match state.sessions.get_mut(&session_id) {
        Some(session) => Ok((session, session_id)),
        None => Err(HandlerErr::new(
            "not_found",
            format!("unknown session: {session_id}"),
        )),
    }
}

/// Click path: local state is updated first, so the response can carry the
/// reconciled poll without another read. Rejections arrive with local state
/// already rolled back.
fn poll_vote(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let option_id = get_trimmed_str(params, "optionId")?;
    let (session, _) = session_mut(state, params)?;

    match session.vote(&option_id) {
        Ok(outcome) => {
            let mut result = outcome_json(&outcome);
            if let Some(obj) = result.as_object_mut() {
                obj.insert("poll".to_string(), local_poll_json(session.poll())?);
                obj.insert(
                    "selectedOptionId".to_string(),
                    json!(session.selected()),
                );
            }
            Ok(result)
        }
        Err(rejected) => {
            let code = match rejected.kind {
                RejectionKind::Permission => "permission_denied",
                RejectionKind::Generic => "vote_failed",
            };
            Err(HandlerErr::new(code, rejected.message))
        }
    }
}

fn poll_state(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (session, _) = session_mut(state, params)?;
    session.pump().map_err(store_err)?;
    Ok(json!({
        "poll": local_poll_json(session.poll())?,
        "selectedOptionId": session.selected(),
        "pollGone": session.poll().is_none(),
    }))
}

fn poll_close(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let session_id = get_trimmed_str(params, "sessionId")?;
    let closed = state.sessions.remove(&session_id).is_some();
    Ok(json!({ "closed": closed }))
}

fn course_view(state: &mut AppState) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let refreshed = state.course_cache.refresh(&store).map_err(store_err)?;
    Ok(json!({
        "refreshed": refreshed,
        "version": state.course_cache.version(),
        "view": state.course_cache.view(),
    }))
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.pollOpen" => Some(respond(req, poll_open(state, &req.params))),
        "dashboard.pollVote" => Some(respond(req, poll_vote(state, &req.params))),
        "dashboard.pollState" => Some(respond(req, poll_state(state, &req.params))),
        "dashboard.pollClose" => Some(respond(req, poll_close(state, &req.params))),
        "dashboard.courseView" => Some(respond(req, course_view(state))),
        _ => None,
    }
}
