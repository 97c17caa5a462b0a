use serde_json::{json, Value};
use uuid::Uuid;

use crate::courses::{self, CourseError};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, course_err, get_trimmed_str, require_admin, require_store, store_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn id_of(course: &Value) -> Option<&str> {
    course.get("id").and_then(Value::as_str)
}

fn courses_list_mut(catalog: &mut Value) -> Result<&mut Vec<Value>, CourseError> {
    catalog
        .get_mut("courses")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| CourseError::Validation("catalog is malformed".to_string()))
}

fn course_entry_mut<'a>(
    catalog: &'a mut Value,
    course_id: &str,
) -> Result<&'a mut Value, CourseError> {
    courses_list_mut(catalog)?
        .iter_mut()
        .find(|c| id_of(c) == Some(course_id))
        .ok_or_else(|| CourseError::NotFound(format!("course not found: {course_id}")))
}

fn modules_list_mut(course: &mut Value) -> Result<&mut Vec<Value>, CourseError> {
    let Some(obj) = course.as_object_mut() else {
        return Err(CourseError::Validation("course is malformed".to_string()));
    };
    if !obj.get("modules").map_or(false, Value::is_array) {
        obj.insert("modules".to_string(), json!([]));
    }
    obj.get_mut("modules")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| CourseError::Validation("course modules must be a list".to_string()))
}

/// Object param with an `id` filled in when absent.
fn object_with_id(params: &Value, key: &str) -> Result<Value, HandlerErr> {
    let Some(mut obj) = params.get(key).and_then(Value::as_object).cloned() else {
        return Err(bad_params(format!("missing {key}")));
    };
    let has_id = obj
        .get("id")
        .and_then(Value::as_str)
        .map_or(false, |s| !s.trim().is_empty());
    if !has_id {
        obj.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
    }
    Ok(Value::Object(obj))
}

fn course_data(state: &AppState) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let catalog = courses::load_catalog(&store).map_err(store_err)?;
    Ok(courses::public_course_view(&catalog))
}

fn course_version(state: &AppState) -> Result<Value, HandlerErr> {
    let store = require_store(state)?;
    let catalog = courses::load_catalog(&store).map_err(store_err)?;
    Ok(json!({ "version": courses::course_version(&catalog) }))
}

fn admin_data(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let catalog = courses::load_catalog(&store).map_err(store_err)?;
    Ok(json!({ "data": catalog }))
}

fn admin_data_replace(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let Some(data) = params.get("data") else {
        return Err(bad_params("missing data"));
    };
    let replacement = courses::normalize_course_data(data);
    if let Some(list) = replacement.get("courses").and_then(Value::as_array) {
        for course in list {
            courses::validate_course(course).map_err(course_err)?;
        }
    }

    let version = courses::mutate_catalog(&store, |catalog| {
        *catalog = replacement.clone();
        Ok(())
    })
    .map_err(course_err)?;
    Ok(json!({ "version": version }))
}

fn admin_course_add(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let course = object_with_id(params, "course")?;
    courses::validate_course(&course).map_err(course_err)?;
    let id = id_of(&course).unwrap_or_default().to_string();

    let version = courses::mutate_catalog(&store, |catalog| {
        let list = courses_list_mut(catalog)?;
        if list.iter().any(|c| id_of(c) == Some(id.as_str())) {
            return Err(CourseError::Validation(format!(
                "course id already exists: {id}"
            )));
        }
        list.push(course.clone());
        Ok(())
    })
    .map_err(course_err)?;
    Ok(json!({ "version": version, "courseId": id }))
}

fn admin_course_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let course_id = get_trimmed_str(params, "courseId")?;
    let Some(mut replacement) = params.get("course").and_then(Value::as_object).cloned() else {
        return Err(bad_params("missing course"));
    };
    // The id in the path wins; a mismatched body id would orphan the entry.
    replacement.insert("id".to_string(), json!(course_id.clone()));
    let replacement = Value::Object(replacement);
    courses::validate_course(&replacement).map_err(course_err)?;

    let version = courses::mutate_catalog(&store, |catalog| {
        let entry = course_entry_mut(catalog, &course_id)?;
        *entry = replacement.clone();
        Ok(())
    })
    .map_err(course_err)?;
    Ok(json!({ "version": version }))
}

fn admin_course_delete(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let course_id = get_trimmed_str(params, "courseId")?;

    let version = courses::mutate_catalog(&store, |catalog| {
        let list = courses_list_mut(catalog)?;
        let before = list.len();
        list.retain(|c| id_of(c) != Some(course_id.as_str()));
        if list.len() == before {
            return Err(CourseError::NotFound(format!(
                "course not found: {course_id}"
            )));
        }
        Ok(())
    })
    .map_err(course_err)?;
    Ok(json!({ "version": version }))
}

fn admin_module_add(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let course_id = get_trimmed_str(params, "courseId")?;
    let module = object_with_id(params, "module")?;
    courses::validate_module(&module).map_err(course_err)?;
    let module_id = id_of(&module).unwrap_or_default().to_string();

    let version = courses::mutate_catalog(&store, |catalog| {
        let course = course_entry_mut(catalog, &course_id)?;
        let modules = modules_list_mut(course)?;
        if modules.iter().any(|m| id_of(m) == Some(module_id.as_str())) {
            return Err(CourseError::Validation(format!(
                "module id already exists: {module_id}"
            )));
        }
        modules.push(module.clone());
        Ok(())
    })
    .map_err(course_err)?;
    Ok(json!({ "version": version, "moduleId": module_id }))
}

fn admin_module_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let course_id = get_trimmed_str(params, "courseId")?;
    let module_id = get_trimmed_str(params, "moduleId")?;
    let Some(mut replacement) = params.get("module").and_then(Value::as_object).cloned() else {
        return Err(bad_params("missing module"));
    };
    replacement.insert("id".to_string(), json!(module_id.clone()));
    let replacement = Value::Object(replacement);
    courses::validate_module(&replacement).map_err(course_err)?;

    let version = courses::mutate_catalog(&store, |catalog| {
        let course = course_entry_mut(catalog, &course_id)?;
        let modules = modules_list_mut(course)?;
        let Some(entry) = modules
            .iter_mut()
            .find(|m| id_of(m) == Some(module_id.as_str()))
        else {
            return Err(CourseError::NotFound(format!(
                "module not found: {module_id}"
            )));
        };
        *entry = replacement.clone();
        Ok(())
    })
    .map_err(course_err)?;
    Ok(json!({ "version": version }))
}

fn admin_module_delete(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let store = require_admin(state, params)?;
    let course_id = get_trimmed_str(params, "courseId")?;
    let module_id = get_trimmed_str(params, "moduleId")?;

    let version = courses::mutate_catalog(&store, |catalog| {
        let course = course_entry_mut(catalog, &course_id)?;
        let modules = modules_list_mut(course)?;
        let before = modules.len();
        modules.retain(|m| id_of(m) != Some(module_id.as_str()));
        if modules.len() == before {
            return Err(CourseError::NotFound(format!(
                "module not found: {module_id}"
            )));
        }
        Ok(())
    })
    .map_err(course_err)?;
    Ok(json!({ "version": version }))
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "course.data" => Some(respond(req, course_data(state))),
        "course.version" => Some(respond(req, course_version(state))),
        "admin.data" => Some(respond(req, admin_data(state, &req.params))),
        "admin.data.replace" => Some(respond(req, admin_data_replace(state, &req.params))),
        "admin.course.add" => Some(respond(req, admin_course_add(state, &req.params))),
        "admin.course.update" => Some(respond(req, admin_course_update(state, &req.params))),
        "admin.course.delete" => Some(respond(req, admin_course_delete(state, &req.params))),
        "admin.module.add" => Some(respond(req, admin_module_add(state, &req.params))),
        "admin.module.update" => Some(respond(req, admin_module_update(state, &req.params))),
        "admin.module.delete" => Some(respond(req, admin_module_delete(state, &req.params))),
        _ => None,
    }
}
