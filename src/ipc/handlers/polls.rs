use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, get_trimmed_str, require_admin, require_store, store_err, vote_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::polls::{self, Identity, Poll, PollOption, VoteOutcome, POLLS};
use crate::store::StoreError;

fn poll_json(poll: &Poll) -> Result<Value, HandlerErr> {
    serde_json::to_value(poll).map_err(|e| store_err(StoreError::from(e)))
}

/// `options` param: a list of at least two non-blank option texts.
fn parse_option_texts(params: &Value) -> Result<Option<Vec<String>>, HandlerErr> {
    match params.get("options") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut texts = Vec::with_capacity(items.len());
            for item in items {
                let Some(text) = item.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(HandlerErr::new(
                        "validation_failed",
                        "poll options must be non-empty strings",
                    ));
                };
                texts.push(text.to_string());
            }
            if texts.len() < 2 {
                return Err(HandlerErr::new(
                    "validation_failed",
                    "a poll needs at least two options",
                ));
            }
            Ok(Some(texts))
        }
        Some(_) => Err(bad_params("options must be a list")),
    }
}

fn identity_from(params: &Value) -> Result<Identity, HandlerErr> {
    let uid = get_trimmed_str(params, "uid")?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    Ok(Identity { uid, name })
}

pub(crate) fn outcome_json(outcome: &VoteOutcome) -> Value {
    match outcome {
        VoteOutcome::Unchanged => json!({ "outcome": "unchanged" }),
        VoteOutcome::Recorded { previous } => {
            json!({ "outcome": "recorded", "previous": previous })
        }
    }
}

fn polls_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let question = get_trimmed_str(params, "question")?;
    let Some(options) = parse_option_texts(params)? else {
        return Err(bad_params("missing options"));
    };

    let poll = Poll::new(&question, &options);
    let doc = poll_json(&poll)?;
    store.run_transaction(|tx| -> Result<(), HandlerErr> {
        tx.read(POLLS, &poll.id)?;
        tx.write(POLLS, &poll.id, doc.clone());
        Ok(())
    })?;
    log::info!("created poll {} with {} options", poll.id, poll.options.len());
    Ok(json!({ "poll": doc }))
}

fn polls_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let poll_id = get_trimmed_str(params, "pollId")?;
    let question = params
        .get("question")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let is_active = match params.get("isActive") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => return Err(bad_params("isActive must be a boolean")),
    };
    let options = parse_option_texts(params)?;

    let poll = store.run_transaction(|tx| -> Result<Poll, HandlerErr> {
        let Some(snap) = tx.read(POLLS, &poll_id)? else {
            return Err(HandlerErr::new(
                "not_found",
                format!("poll not found: {poll_id}"),
            ));
        };
        let mut poll = snap.parse::<Poll>(POLLS)?;
        if options.is_some() && !poll.votes.is_empty() {
            return Err(HandlerErr::new(
                "validation_failed",
                "poll options cannot change once votes exist",
            ));
        }
        if let Some(question) = &question {
            poll.question = question.clone();
        }
        if let Some(active) = is_active {
            poll.is_active = active;
        }
        if let Some(texts) = &options {
            poll.options = texts
                .iter()
                .map(|text| PollOption {
                    id: Uuid::new_v4().to_string(),
                    text: text.clone(),
                    votes: 0,
                })
                .collect();
        }
        tx.write(
            POLLS,
            &poll.id,
            serde_json::to_value(&poll).map_err(StoreError::from)?,
        );
        Ok(poll)
    })?;
    Ok(json!({ "poll": poll_json(&poll)? }))
}

fn polls_set_active(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let poll_id = get_trimmed_str(params, "pollId")?;
    let Some(active) = params.get("isActive").and_then(Value::as_bool) else {
        return Err(bad_params("missing isActive"));
    };

    let poll = store.run_transaction(|tx| -> Result<Poll, HandlerErr> {
        let Some(snap) = tx.read(POLLS, &poll_id)? else {
            return Err(HandlerErr::new(
                "not_found",
                format!("poll not found: {poll_id}"),
            ));
        };
        let mut poll = snap.parse::<Poll>(POLLS)?;
        poll.is_active = active;
        tx.write(
            POLLS,
            &poll.id,
            serde_json::to_value(&poll).map_err(StoreError::from)?,
        );
        Ok(poll)
    })?;
    Ok(json!({ "poll": poll_json(&poll)? }))
}

fn polls_delete(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let poll_id = get_trimmed_str(params, "pollId")?;
    let deleted = store.run_transaction(|tx| -> Result<bool, HandlerErr> {
        if tx.read(POLLS, &poll_id)?.is_none() {
            return Ok(false);
        }
        tx.delete(POLLS, &poll_id);
        Ok(true)
    })?;
    Ok(json!({ "deleted": deleted }))
}

fn polls_list(state: &AppState) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let mut polls = Vec::new();
    for snap in store.list(POLLS).map_err(store_err)? {
        polls.push(snap.parse::<Poll>(POLLS).map_err(store_err)?);
    }
    polls.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    let polls: Vec<Value> = polls
        .iter()
        .map(poll_json)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "polls": polls }))
}

fn polls_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let poll_id = get_trimmed_str(params, "pollId")?;
    let snap = store
        .get_required(POLLS, &poll_id)
        .map_err(store_err)?;
    let poll = snap.parse::<Poll>(POLLS).map_err(store_err)?;
    Ok(json!({ "poll": poll_json(&poll)? }))
}

/// Direct (sessionless) vote; the dashboard session flow in
/// `handlers::dashboard` wraps the same underlying transaction.
fn polls_vote(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let who = identity_from(params)?;
    let poll_id = get_trimmed_str(params, "pollId")?;
    let option_id = get_trimmed_str(params, "optionId")?;

    let outcome = polls::submit_vote(&store, &who, &poll_id, &option_id).map_err(vote_err)?;
    let snap = store.get_required(POLLS, &poll_id).map_err(store_err)?;
    let mut result = outcome_json(&outcome);
    if let Some(obj) = result.as_object_mut() {
        obj.insert("poll".to_string(), snap.body);
    }
    Ok(result)
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "polls.create" => Some(respond(req, polls_create(state, &req.params))),
        "polls.update" => Some(respond(req, polls_update(state, &req.params))),
        "polls.setActive" => Some(respond(req, polls_set_active(state, &req.params))),
        "polls.delete" => Some(respond(req, polls_delete(state, &req.params))),
        "polls.list" => Some(respond(req, polls_list(state))),
        "polls.get" => Some(respond(req, polls_get(state, &req.params))),
        "polls.vote" => Some(respond(req, polls_vote(state, &req.params))),
        _ => None,
    }
}
