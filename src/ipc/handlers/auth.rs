use serde_json::{json, Value};

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    auth_err, get_optional_bool, get_required_str, get_trimmed_str, require_admin, require_store,
    store_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::polls::{UserProfile, PROFILES};
use crate::store::StoreError;

fn profile_json(profile: &UserProfile) -> Result<Value, HandlerErr> {
    serde_json::to_value(profile).map_err(|e| store_err(StoreError::from(e)))
}

fn auth_login(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let key = get_required_str(params, "key")?;
    let session = state.auth.login(&store, &key).map_err(auth_err)?;
    Ok(json!({
        "token": session.token,
        "expiresAt": session.expires_at,
    }))
}

fn auth_check(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let token = get_required_str(params, "token")?;
    let expiry = state
        .auth
        .session_expiry(&store, &token)
        .map_err(store_err)?;
    Ok(match expiry {
        Some(expires_at) => json!({ "valid": true, "expiresAt": expires_at }),
        None => json!({ "valid": false }),
    })
}

fn auth_logout(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let token = get_required_str(params, "token")?;
    let removed = state.auth.logout(&store, &token).map_err(store_err)?;
    Ok(json!({ "loggedOut": removed }))
}

/// Admin management of voter profiles: `canVote` and `role` gate the voting
/// flow's access check.
fn profiles_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let uid = get_trimmed_str(params, "uid")?;
    let name = params.get("name").and_then(Value::as_str).map(str::to_string);
    let role = params.get("role").and_then(Value::as_str).map(str::to_string);
    if let Some(role) = &role {
        if role != "admin" && role != "student" {
            return Err(HandlerErr::new(
                "validation_failed",
                "role must be admin or student",
            ));
        }
    }
    let can_vote = get_optional_bool(params, "canVote")?;

    let profile = store
        .run_transaction(|tx| -> Result<UserProfile, StoreError> {
            let snap = tx.read(PROFILES, &uid)?;
            let mut profile = match &snap {
                Some(s) => s.parse::<UserProfile>(PROFILES)?,
                None => UserProfile::new(&uid, name.as_deref().unwrap_or("")),
            };
            if let Some(name) = &name {
                profile.name = name.clone();
            }
            if let Some(role) = &role {
                profile.role = role.clone();
            }
            if let Some(can_vote) = can_vote {
                profile.can_vote = can_vote;
            }
            tx.write(PROFILES, &uid, serde_json::to_value(&profile)?);
            Ok(profile)
        })
        .map_err(store_err)?;

    Ok(json!({ "profile": profile_json(&profile)? }))
}

fn profiles_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let uid = get_trimmed_str(params, "uid")?;
    match store.get(PROFILES, &uid).map_err(store_err)? {
        Some(snap) => {
            let profile = snap.parse::<UserProfile>(PROFILES).map_err(store_err)?;
            Ok(json!({ "profile": profile_json(&profile)? }))
        }
        None => Ok(json!({ "profile": null })),
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
        "auth.login" => Some(respond(req, auth_login(state, &req.params))),
        "auth.check" => Some(respond(req, auth_check(state, &req.params))),
        "auth.logout" => Some(respond(req, auth_logout(state, &req.params))),
        "profiles.upsert" => Some(respond(req, profiles_upsert(state, &req.params))),
        "profiles.get" => Some(respond(req, profiles_get(state, &req.params))),
        _ => None,
    }
}
