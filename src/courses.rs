//! Course catalog: normalization, validation, versioning, and the public
//! view served to dashboards.
//!
//! The catalog is one document, `course_data/main`. Older workspaces stored
//! a single course as a bare `{modules, metadata}` object; normalization
//! wraps that legacy shape into the multi-course form before anything else
//! touches it.

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::store::{DocStore, StoreError};

pub const COURSE_DATA: &str = "course_data";
pub const MAIN_DOC: &str = "main";

pub const DEFAULT_MODULE_LABS: i64 = 1;
pub const FALLBACK_TOTAL_LABS: i64 = 2;
pub const MAX_MODULE_LABS: i64 = 100;
pub const MAX_TOTAL_LABS: i64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum CourseError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn empty_catalog() -> Value {
    json!({"version": 0, "courses": []})
}

/// Accept both catalog shapes. The multi-course form passes through; the
/// legacy single-course form is wrapped under a `default-course` entry.
pub fn normalize_course_data(data: &Value) -> Value {
    let Some(obj) = data.as_object() else {
        return empty_catalog();
    };
    if obj.get("courses").map_or(false, Value::is_array) {
        return data.clone();
    }

    let version = obj.get("version").and_then(coerce_int).unwrap_or(0);
    let modules = obj.get("modules").filter(|v| v.is_array()).cloned();
    let metadata = obj.get("metadata").filter(|v| v.is_object()).cloned();
    if modules.is_none() && metadata.is_none() {
        return json!({"version": version, "courses": []});
    }

    json!({
        "version": version,
        "courses": [{
            "id": "default-course",
            "title": "Main Course",
            "isVisible": true,
            "modules": modules.unwrap_or_else(|| json!([])),
            "links": obj.get("links").filter(|v| v.is_object()).cloned().unwrap_or_else(|| json!({})),
            "metadata": metadata.unwrap_or_else(|| json!({})),
        }],
    })
}

/// Loose integer coercion for spreadsheet- and JSON-sourced values: accepts
/// integers, floats, and numeric strings.
pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn nonempty_str(obj: &serde_json::Map<String, Value>, key: &str) -> bool {
    obj.get(key)
        .and_then(Value::as_str)
        .map_or(false, |s| !s.trim().is_empty())
}

pub fn validate_module(module: &Value) -> Result<(), CourseError> {
    let Some(obj) = module.as_object() else {
        return Err(CourseError::Validation("module must be an object".to_string()));
    };
    if !nonempty_str(obj, "title") {
        return Err(CourseError::Validation("module title is required".to_string()));
    }
    match obj.get("hours").and_then(Value::as_f64) {
        Some(h) if h >= 0.0 => {}
        Some(_) => {
            return Err(CourseError::Validation(
                "module hours must be non-negative".to_string(),
            ))
        }
        None => return Err(CourseError::Validation("module hours is required".to_string())),
    }
    if !nonempty_str(obj, "focus") {
        return Err(CourseError::Validation("module focus is required".to_string()));
    }
    if let Some(lab) = obj.get("labCount") {
        if !lab.is_null() {
            let ok = coerce_int(lab).map_or(false, |n| (0..=MAX_MODULE_LABS).contains(&n));
            if !ok {
                return Err(CourseError::Validation(format!(
                    "labCount must be an integer between 0 and {MAX_MODULE_LABS}"
                )));
            }
        }
    }
    if let Some(topics) = obj.get("topics") {
        if !topics.is_null() {
            let ok = topics
                .as_array()
                .map_or(false, |items| items.iter().all(Value::is_string));
            if !ok {
                return Err(CourseError::Validation(
                    "topics must be a list of strings".to_string(),
                ));
            }
        }
    }
    Ok(())
}

pub fn validate_course(course: &Value) -> Result<(), CourseError> {
    let Some(obj) = course.as_object() else {
        return Err(CourseError::Validation("course must be an object".to_string()));
    };
    if !nonempty_str(obj, "title") {
        return Err(CourseError::Validation("course title is required".to_string()));
    }
    if let Some(modules) = obj.get("modules") {
        let Some(items) = modules.as_array() else {
            return Err(CourseError::Validation(
                "course modules must be a list".to_string(),
            ));
        };
        for module in items {
            validate_module(module)?;
        }
    }
    Ok(())
}

fn is_visible(value: &Value) -> bool {
    value.get("isVisible").and_then(Value::as_bool).unwrap_or(true)
}

/// Expected lab count across visible courses and modules. A module without
/// a count contributes 1; per-module and overall totals are capped, and an
/// empty catalog falls back to 2 so grade columns never vanish entirely.
pub fn total_expected_labs(data: &Value) -> i64 {
    let normalized = normalize_course_data(data);
    let mut total = 0i64;
    if let Some(courses) = normalized.get("courses").and_then(Value::as_array) {
        for course in courses.iter().filter(|c| is_visible(c)) {
            let Some(modules) = course.get("modules").and_then(Value::as_array) else {
                continue;
            };
            for module in modules.iter().filter(|m| is_visible(m)) {
                let labs = module
                    .get("labCount")
                    .and_then(coerce_int)
                    .unwrap_or(DEFAULT_MODULE_LABS);
                total += labs.clamp(0, MAX_MODULE_LABS);
            }
        }
    }
    let total = total.clamp(0, MAX_TOTAL_LABS);
    if total > 0 {
        total
    } else {
        FALLBACK_TOTAL_LABS
    }
}

/// Catalog version: the explicit counter when set, otherwise a stable hash
/// of the canonical body so that cache keys still change when the data does.
pub fn course_version(data: &Value) -> i64 {
    if let Some(v) = data.get("version").and_then(coerce_int) {
        if v != 0 {
            return v;
        }
    }
    fallback_version_hash(data)
}

/// sha-256 of the canonical (sorted-key) JSON body, reduced modulo 10^13 so
/// it fits the same numeric range as a millisecond version.
pub fn fallback_version_hash(data: &Value) -> i64 {
    let canonical = data.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut acc: u64 = 0;
    for byte in digest {
        acc = (acc * 256 + u64::from(byte)) % 10_000_000_000_000;
    }
    acc as i64
}

/// The shape dashboards consume: the primary visible course flattened to
/// `{version, modules, links, metadata}`, hidden modules dropped.
pub fn public_course_view(data: &Value) -> Value {
    let normalized = normalize_course_data(data);
    let version = course_version(&normalized);
    let empty = Vec::new();
    let courses = normalized
        .get("courses")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let Some(course) = courses.iter().find(|c| is_visible(c)) else {
        return json!({"version": version, "modules": [], "links": {}, "metadata": {}});
    };

    let modules: Vec<Value> = course
        .get("modules")
        .and_then(Value::as_array)
        .map(|mods| mods.iter().filter(|m| is_visible(m)).cloned().collect())
        .unwrap_or_default();
    json!({
        "version": version,
        "modules": modules,
        "links": course.get("links").cloned().unwrap_or_else(|| json!({})),
        "metadata": course.get("metadata").cloned().unwrap_or_else(|| json!({})),
    })
}

/// Normalized catalog from the store; a workspace with no catalog yet reads
/// as the empty catalog.
pub fn load_catalog(store: &DocStore) -> Result<Value, StoreError> {
    match store.get(COURSE_DATA, MAIN_DOC)? {
        Some(snap) => Ok(normalize_course_data(&snap.body)),
        None => Ok(empty_catalog()),
    }
}

fn next_version(previous: i64) -> i64 {
    let now = Utc::now().timestamp_millis();
    // Rapid successive edits within one millisecond must still produce
    // distinct versions or caches keyed on the counter would go stale.
    if now > previous {
        now
    } else {
        previous + 1
    }
}

/// Read-modify-write of the catalog document: `f` edits the normalized
/// catalog in place, then the version counter is bumped and the result
/// persisted, all inside one store transaction.
pub fn mutate_catalog<F>(store: &DocStore, mut f: F) -> Result<i64, CourseError>
where
    F: FnMut(&mut Value) -> Result<(), CourseError>,
{
    store.run_transaction(|tx| {
        let snap = tx.read(COURSE_DATA, MAIN_DOC)?;
        let mut catalog = match &snap {
            Some(s) => normalize_course_data(&s.body),
            None => empty_catalog(),
        };
        f(&mut catalog)?;

        // `f` may have replaced the whole document (catalog import).
        let mut catalog = normalize_course_data(&catalog);
        let previous = catalog.get("version").and_then(coerce_int).unwrap_or(0);
        let version = next_version(previous);
        if let Some(obj) = catalog.as_object_mut() {
            obj.insert("version".to_string(), json!(version));
        }
        tx.write(COURSE_DATA, MAIN_DOC, catalog);
        Ok(version)
    })
}
