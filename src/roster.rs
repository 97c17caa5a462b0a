//! Spreadsheet-shaped student records.
//!
//! Register and Survey exports arrive as raw header/row tables. The merge
//! treats Register as authoritative for payment data: a key ring indexed by
//! both of its email columns is matched against Survey rows (student email
//! first, then the form's own email), and register-only students are
//! appended afterwards. Merged rows then absorb the per-student operations
//! records kept in the workspace.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::courses;
use crate::store::{DocStore, StoreError};

pub const ADMIN_STUDENTS: &str = "admin_students";
pub const ADMIN_CLASSES: &str = "admin_classes";
pub const STUDENTS_LIST: &str = "operations_students_list";
pub const STUDENTS_LIST_DOC: &str = "main";
pub const METRICS: &str = "operations_metrics";
pub const METRICS_DOC: &str = "latest";
pub const SYNC: &str = "operations_sync";
pub const SYNC_DOC: &str = "status";

pub const SYNC_LOCK_MAX_AGE_MINUTES: i64 = 15;
pub const MAX_BULK_UPDATES: usize = 100;

const PAYMENT_COLUMNS: [&str; 7] = [
    "Choose The Tiered Program.",
    "Payment Method",
    "Add Payment Screenshot",
    "Email Address",
    "Student Email",
    "Onboarding",
    "Payment Status",
];
const INJECTED_FIELDS: [&str; 4] = [
    "Choose The Tiered Program.",
    "Payment Method",
    "Add Payment Screenshot",
    "Onboarding",
];

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Raw spreadsheet export: one header row plus data rows. Short rows read
/// as empty cells.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetTable {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn cell<'a>(row: &'a [String], idx: Option<usize>) -> &'a str {
    idx.and_then(|i| row.get(i)).map(String::as_str).unwrap_or("")
}

fn cell_value(row: &[String], idx: Option<usize>) -> Value {
    match idx.and_then(|i| row.get(i)) {
        Some(s) => json!(s),
        None => Value::Null,
    }
}

fn value_is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

/// First header containing an email-ish keyword, tolerating label variants.
pub fn find_email_column(headers: &[String]) -> Option<usize> {
    let keywords = ["email", "e-mail", "email address"];
    headers.iter().position(|h| {
        let lower = h.to_lowercase();
        keywords.iter().any(|k| lower.contains(k))
    })
}

pub fn find_student_email_column(headers: &[String]) -> Option<usize> {
    let keywords = ["student email", "student_email", "student e-mail"];
    headers.iter().position(|h| {
        let lower = h.to_lowercase();
        keywords.iter().any(|k| lower.contains(k))
    })
}

fn match_column(headers: &[String], names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let norm = h.trim().to_lowercase().replace('.', "");
        names
            .iter()
            .any(|n| n.trim().to_lowercase().replace('.', "") == norm)
    })
}

pub fn row_to_map(headers: &[String], row: &[String]) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, header) in headers.iter().enumerate() {
        if header.trim().is_empty() {
            continue;
        }
        map.insert(header.clone(), cell_value(row, Some(i)));
    }
    map
}

struct KeyRingEntry {
    fields: Map<String, Value>,
    register_key: String,
}

/// Register rows indexed by every email they carry. Later rows with the
/// same email replace earlier ones.
struct KeyRing {
    entries: Vec<KeyRingEntry>,
    by_email: HashMap<String, usize>,
}

impl KeyRing {
    fn lookup(&self, email: &str) -> Option<&KeyRingEntry> {
        self.by_email.get(email).map(|&i| &self.entries[i])
    }
}

fn build_register_key_ring(
    register: &SheetTable,
    email_idx: Option<usize>,
    student_email_idx: Option<usize>,
) -> KeyRing {
    let tier_idx = match_column(&register.headers, &["choose the tiered program"]);
    let method_idx = match_column(&register.headers, &["payment method"]);
    let screenshot_idx = match_column(&register.headers, &["add payment screenshot"]);
    let onboarding_idx = match_column(&register.headers, &["onboarding"]);

    let mut entries = Vec::new();
    let mut by_email = HashMap::new();
    for row in &register.rows {
        let mut fields = Map::new();
        fields.insert(
            "Choose The Tiered Program.".to_string(),
            cell_value(row, tier_idx),
        );
        fields.insert("Payment Method".to_string(), cell_value(row, method_idx));
        fields.insert(
            "Add Payment Screenshot".to_string(),
            cell_value(row, screenshot_idx),
        );
        fields.insert("Onboarding".to_string(), cell_value(row, onboarding_idx));
        fields.insert("Email Address".to_string(), cell_value(row, email_idx));
        fields.insert(
            "Student Email".to_string(),
            cell_value(row, student_email_idx),
        );

        let primary = normalize_email(cell(row, email_idx));
        let student = normalize_email(cell(row, student_email_idx));
        let register_key = if !primary.is_empty() {
            primary.clone()
        } else {
            student.clone()
        };
        // Rows without any parseable email cannot be matched or listed.
        if register_key.is_empty() {
            continue;
        }

        let idx = entries.len();
        entries.push(KeyRingEntry {
            fields,
            register_key,
        });
        if !primary.is_empty() {
            by_email.insert(primary, idx);
        }
        if !student.is_empty() {
            by_email.insert(student, idx);
        }
    }
    KeyRing { entries, by_email }
}

fn payment_status_from(screenshot: Option<&Value>) -> Value {
    if value_is_blank(screenshot) {
        json!("Unpaid")
    } else {
        json!("Paid")
    }
}

fn merge_survey_rows(
    survey: &SheetTable,
    email_idx: Option<usize>,
    student_email_idx: Option<usize>,
    ring: &KeyRing,
) -> (Vec<Map<String, Value>>, HashSet<String>) {
    let mut rows = Vec::new();
    let mut matched = HashSet::new();

    for raw in &survey.rows {
        let mut map = row_to_map(&survey.headers, raw);
        map.insert("Has Survey Response".to_string(), json!(true));
        for col in PAYMENT_COLUMNS {
            map.entry(col.to_string()).or_insert(Value::Null);
        }

        let student_email = normalize_email(cell(raw, student_email_idx));
        let google_email = normalize_email(cell(raw, email_idx));

        let mut hit = None;
        if !student_email.is_empty() {
            hit = ring.lookup(&student_email);
        }
        if hit.is_none() && !google_email.is_empty() {
            hit = ring.lookup(&google_email);
        }

        if let Some(entry) = hit {
            for field in INJECTED_FIELDS {
                map.insert(
                    field.to_string(),
                    entry.fields.get(field).cloned().unwrap_or(Value::Null),
                );
            }
            if value_is_blank(map.get("Email Address")) {
                map.insert(
                    "Email Address".to_string(),
                    entry
                        .fields
                        .get("Email Address")
                        .cloned()
                        .unwrap_or(Value::Null),
                );
            }
            if value_is_blank(map.get("Student Email")) {
                map.insert(
                    "Student Email".to_string(),
                    entry
                        .fields
                        .get("Student Email")
                        .cloned()
                        .unwrap_or(Value::Null),
                );
            }
            map.insert(
                "Payment Status".to_string(),
                payment_status_from(entry.fields.get("Add Payment Screenshot")),
            );
            matched.insert(entry.register_key.clone());
        } else {
            map.insert("Payment Status".to_string(), json!("Unpaid"));
        }

        if value_is_blank(map.get("Email Address")) {
            let fallback = cell(raw, email_idx);
            if !fallback.trim().is_empty() {
                map.insert("Email Address".to_string(), json!(fallback));
            }
        }
        rows.push(map);
    }
    (rows, matched)
}

fn register_only_rows(ring: &KeyRing, matched: &HashSet<String>) -> Vec<Map<String, Value>> {
    let reachable: HashSet<usize> = ring.by_email.values().copied().collect();
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (idx, entry) in ring.entries.iter().enumerate() {
        if !reachable.contains(&idx) || matched.contains(&entry.register_key) {
            continue;
        }
        if !seen.insert(entry.register_key.clone()) {
            continue;
        }
        let mut map = entry.fields.clone();
        map.insert(
            "Payment Status".to_string(),
            payment_status_from(map.get("Add Payment Screenshot")),
        );
        map.insert("Has Survey Response".to_string(), json!(false));
        rows.push(map);
    }
    rows
}

fn normalize_name_columns(mut rows: Vec<Map<String, Value>>) -> Vec<Map<String, Value>> {
    for row in &mut rows {
        if !value_is_blank(row.get("Name")) {
            continue;
        }
        let mut name = None;
        for key in ["Student Full Name", "Student Name", "Full Name"] {
            if let Some(s) = row.get(key).and_then(Value::as_str) {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    name = Some(trimmed.to_string());
                    break;
                }
            }
        }
        if name.is_none() {
            let first = row
                .get("First Name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            let last = row
                .get("Last Name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            let full = format!("{first} {last}").trim().to_string();
            if !full.is_empty() {
                name = Some(full);
            }
        }
        if let Some(name) = name {
            row.insert("Name".to_string(), json!(name));
        }
    }
    rows
}

/// Merge the Register and Survey exports into one roster. Survey rows are
/// primary; Register supplies payment data and any students who never
/// answered the Survey.
pub fn merge_register_survey(
    register: &SheetTable,
    survey: &SheetTable,
) -> Result<Vec<Map<String, Value>>, RosterError> {
    if register.rows.is_empty() && survey.rows.is_empty() {
        return Ok(Vec::new());
    }

    let register_email_idx = find_email_column(&register.headers);
    let register_student_idx = find_student_email_column(&register.headers);
    let survey_email_idx = find_email_column(&survey.headers);

    if register.rows.is_empty() {
        let mut rows = Vec::new();
        for raw in &survey.rows {
            let mut map = row_to_map(&survey.headers, raw);
            map.insert("Payment Status".to_string(), json!("Unpaid"));
            map.insert("Has Survey Response".to_string(), json!(true));
            rows.push(map);
        }
        return Ok(normalize_name_columns(rows));
    }

    if survey.rows.is_empty() || survey_email_idx.is_none() {
        let ring = build_register_key_ring(register, register_email_idx, register_student_idx);
        return Ok(normalize_name_columns(register_only_rows(
            &ring,
            &HashSet::new(),
        )));
    }

    if register_email_idx.is_none() {
        return Err(RosterError::Validation(
            "register sheet must have an email address column".to_string(),
        ));
    }

    let survey_student_idx = find_student_email_column(&survey.headers);
    let ring = build_register_key_ring(register, register_email_idx, register_student_idx);
    let (mut rows, matched) = merge_survey_rows(survey, survey_email_idx, survey_student_idx, &ring);
    rows.extend(register_only_rows(&ring, &matched));
    Ok(normalize_name_columns(rows))
}

/// Email for a merged row, tolerating the field-name variants the exports
/// use.
pub fn student_email(row: &Map<String, Value>) -> String {
    for key in ["Email Address", "Email", "email", "email_address"] {
        if let Some(s) = row.get(key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

pub fn resume_link(row: &Map<String, Value>) -> String {
    for key in [
        "Resume Link",
        "Resume",
        "Upload your Resume / CV (PDF preferred)",
        "Upload your Resume / CV (PDF preferred) ",
    ] {
        if let Some(s) = row.get(key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

pub fn has_resume(link: &str) -> bool {
    let trimmed = link.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("n/a")
}

pub fn assignment_grade_fields(total_labs: i64) -> Vec<String> {
    (1..=total_labs.max(0))
        .map(|i| format!("Assignment {i} Grade"))
        .collect()
}

pub fn allowed_update_fields(total_labs: i64) -> Vec<String> {
    let mut fields = vec![
        "Name".to_string(),
        "Student Name".to_string(),
        "Attendance".to_string(),
        "Teacher Evaluation".to_string(),
    ];
    fields.extend(assignment_grade_fields(total_labs));
    fields
}

/// Attendance values are stored as objects but historically arrived as JSON
/// strings; accept both, anything else reads as empty.
pub fn parse_attendance(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default(),
        _ => Map::new(),
    }
}

pub fn validate_attendance(value: &Value) -> Result<(), String> {
    match value {
        Value::Null | Value::Object(_) => Ok(()),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map(|_| ())
            .map_err(|_| "invalid Attendance format, must be JSON string or object".to_string()),
        _ => Err("Attendance must be a dictionary or JSON string".to_string()),
    }
}

pub fn validate_grade(value: &Value) -> Result<(), String> {
    match value {
        Value::Null | Value::String(_) | Value::Number(_) => Ok(()),
        _ => Err("grade must be a string or number".to_string()),
    }
}

fn apply_admin_defaults(
    row: &mut Map<String, Value>,
    record: Option<&Map<String, Value>>,
    grade_fields: &[String],
) {
    let from_admin = |key: &str| record.and_then(|r| r.get(key)).cloned();

    if value_is_blank(row.get("Name")) {
        if let Some(name) = from_admin("Name") {
            if !value_is_blank(Some(&name)) {
                row.insert("Name".to_string(), name);
            }
        }
    }

    // An admin-set payment status overrides the screenshot-derived one.
    if let Some(status) = from_admin("Payment Status") {
        if !value_is_blank(Some(&status)) {
            row.insert("Payment Status".to_string(), status);
        }
    }
    if value_is_blank(row.get("Payment Status")) {
        row.insert("Payment Status".to_string(), json!("Unpaid"));
    }

    let comment = from_admin("Payment Comment")
        .filter(|v| !value_is_blank(Some(v)))
        .unwrap_or_else(|| json!(""));
    row.insert("Payment Comment".to_string(), comment);

    let evaluation = from_admin("Teacher Evaluation")
        .filter(|v| !value_is_blank(Some(v)))
        .or_else(|| {
            row.get("Teacher Evaluation")
                .cloned()
                .filter(|v| !value_is_blank(Some(v)))
        })
        .unwrap_or_else(|| json!(""));
    row.insert("Teacher Evaluation".to_string(), evaluation);

    let attendance = record
        .and_then(|r| r.get("Attendance"))
        .map(parse_attendance)
        .unwrap_or_default();
    row.insert("Attendance".to_string(), Value::Object(attendance));

    for field in grade_fields {
        let grade = from_admin(field)
            .filter(|v| !value_is_blank(Some(v)))
            .or_else(|| row.get(field).cloned().filter(|v| !value_is_blank(Some(v))))
            .unwrap_or_else(|| json!(""));
        row.insert(field.clone(), grade);
    }
}

/// Fold the per-student operations records into the merged roster, padding
/// assignment-grade columns to the expected lab count. Students present
/// only in the operations records are appended.
pub fn attach_admin_records(
    mut rows: Vec<Map<String, Value>>,
    admin: &[(String, Map<String, Value>)],
    total_labs: i64,
) -> Vec<Map<String, Value>> {
    let by_email: HashMap<&str, &Map<String, Value>> =
        admin.iter().map(|(e, m)| (e.as_str(), m)).collect();
    let grade_fields = assignment_grade_fields(total_labs);
    let mut matched = HashSet::new();

    for row in &mut rows {
        let email = normalize_email(&student_email(row));
        let record = if email.is_empty() {
            None
        } else {
            by_email.get(email.as_str()).copied()
        };
        if record.is_some() {
            matched.insert(email);
        }
        apply_admin_defaults(row, record, &grade_fields);
    }

    for (email, record) in admin {
        if matched.contains(email) {
            continue;
        }
        let mut row = Map::new();
        row.insert("Email Address".to_string(), json!(email));
        row.insert("Has Survey Response".to_string(), json!(false));
        apply_admin_defaults(&mut row, Some(record), &grade_fields);
        rows.push(row);
    }
    rows
}

pub fn calculate_metrics(students: &[Map<String, Value>]) -> Value {
    let total = students.len();
    let mut paid = 0usize;
    let mut resumes = 0usize;
    let mut surveys = 0usize;
    for student in students {
        let status = student
            .get("Payment Status")
            .and_then(Value::as_str)
            .unwrap_or("");
        if status.eq_ignore_ascii_case("paid") {
            paid += 1;
        }
        if has_resume(&resume_link(student)) {
            resumes += 1;
        }
        if student
            .get("Has Survey Response")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            surveys += 1;
        }
    }
    let onboarding = if total > 0 {
        resumes as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    json!({
        "totalStudents": total,
        "paidCount": paid,
        "unpaidCount": total - paid,
        "hasResumeCount": resumes,
        "onboardingPercentage": (onboarding * 100.0).round() / 100.0,
        "surveyFilledCount": surveys,
        "surveyNotFilledCount": total - surveys,
    })
}

pub fn load_admin_records(store: &DocStore) -> Result<Vec<(String, Map<String, Value>)>, StoreError> {
    let snaps = store.list(ADMIN_STUDENTS)?;
    Ok(snaps
        .into_iter()
        .map(|snap| {
            let body = snap.body.as_object().cloned().unwrap_or_default();
            (snap.doc_id, body)
        })
        .collect())
}

pub fn cached_students(store: &DocStore) -> Result<Vec<Map<String, Value>>, StoreError> {
    let Some(snap) = store.get(STUDENTS_LIST, STUDENTS_LIST_DOC)? else {
        return Ok(Vec::new());
    };
    Ok(snap
        .body
        .get("students")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(|r| r.as_object().cloned()).collect())
        .unwrap_or_default())
}

pub fn latest_metrics(store: &DocStore) -> Result<Option<Value>, StoreError> {
    Ok(store.get(METRICS, METRICS_DOC)?.map(|snap| snap.body))
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub student_count: usize,
    pub metrics: Value,
}

/// One sync pass: merge the exports, fold in operations records, compute
/// metrics, and persist the cached list and metrics documents atomically.
/// Callers are expected to hold the sync lock.
pub fn run_sync(
    store: &DocStore,
    register: &SheetTable,
    survey: &SheetTable,
) -> Result<SyncReport, RosterError> {
    let merged = merge_register_survey(register, survey)?;
    let admin = load_admin_records(store)?;
    let catalog = courses::load_catalog(store)?;
    let total_labs = courses::total_expected_labs(&catalog);
    let students = attach_admin_records(merged, &admin, total_labs);
    let metrics = calculate_metrics(&students);

    let now = Utc::now().to_rfc3339();
    store.run_transaction(|tx| -> Result<(), StoreError> {
        tx.read(STUDENTS_LIST, STUDENTS_LIST_DOC)?;
        tx.read(METRICS, METRICS_DOC)?;
        tx.write(
            STUDENTS_LIST,
            STUDENTS_LIST_DOC,
            json!({"students": students, "updatedAt": now}),
        );
        let mut stamped = metrics.clone();
        if let Some(obj) = stamped.as_object_mut() {
            obj.insert("lastSynced".to_string(), json!(now));
        }
        tx.write(METRICS, METRICS_DOC, stamped);
        Ok(())
    })?;

    log::info!(
        "synced {} students into the operations cache",
        students.len()
    );
    Ok(SyncReport {
        student_count: students.len(),
        metrics,
    })
}

/// Flip the sync status document to IN_PROGRESS unless an unexpired run
/// already holds it. A crashed run's stale claim is stealable after the
/// age limit.
pub fn acquire_sync_lock(store: &DocStore) -> Result<bool, StoreError> {
    store.run_transaction(|tx| {
        let snap = tx.read(SYNC, SYNC_DOC)?;
        let now = Utc::now();
        if let Some(snap) = &snap {
            let status = snap
                .body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("IDLE");
            let started = snap
                .body
                .get("startedAt")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
            let too_recent = started.map_or(false, |t| {
                now.signed_duration_since(t.with_timezone(&Utc))
                    < chrono::Duration::minutes(SYNC_LOCK_MAX_AGE_MINUTES)
            });
            if status == "IN_PROGRESS" && too_recent {
                return Ok(false);
            }
        }
        tx.write(
            SYNC,
            SYNC_DOC,
            json!({
                "status": "IN_PROGRESS",
                "startedAt": now.to_rfc3339(),
                "finishedAt": null,
                "lastError": null,
            }),
        );
        Ok(true)
    })
}

pub fn release_sync_lock(
    store: &DocStore,
    success: bool,
    error: Option<&str>,
) -> Result<(), StoreError> {
    store.run_transaction(|tx| {
        let snap = tx.read(SYNC, SYNC_DOC)?;
        let mut body = snap.map(|s| s.body).unwrap_or_else(|| json!({}));
        if let Some(obj) = body.as_object_mut() {
            obj.insert("finishedAt".to_string(), json!(Utc::now().to_rfc3339()));
            if success {
                obj.insert("status".to_string(), json!("IDLE"));
                obj.insert("lastError".to_string(), Value::Null);
            } else {
                obj.insert("status".to_string(), json!("ERROR"));
                obj.insert(
                    "lastError".to_string(),
                    json!(error.unwrap_or("unknown error")),
                );
            }
        }
        tx.write(SYNC, SYNC_DOC, body);
        Ok(())
    })
}

pub fn sync_status(store: &DocStore) -> Result<Value, StoreError> {
    Ok(store.get(SYNC, SYNC_DOC)?.map(|s| s.body).unwrap_or_else(|| {
        json!({
            "status": "IDLE",
            "startedAt": null,
            "finishedAt": null,
            "lastError": null,
        })
    }))
}

/// Per-class in-flight markers for attendance marking. A second request for
/// a class whose marking is still running is rejected, not queued.
#[derive(Default)]
pub struct ClassLocks {
    busy: Mutex<HashSet<String>>,
}

pub struct ClassLockGuard<'a> {
    locks: &'a ClassLocks,
    class_id: String,
}

impl ClassLocks {
    pub fn new() -> ClassLocks {
        ClassLocks::default()
    }

    pub fn try_acquire(&self, class_id: &str) -> Option<ClassLockGuard<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !busy.insert(class_id.to_string()) {
            return None;
        }
        Some(ClassLockGuard {
            locks: self,
            class_id: class_id.to_string(),
        })
    }
}

impl Drop for ClassLockGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self
            .locks
            .busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        busy.remove(&self.class_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Completed,
    NoChanges,
    DuplicateRequest,
    Failed,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Completed => "completed",
            AttendanceStatus::NoChanges => "no_changes",
            AttendanceStatus::DuplicateRequest => "duplicate_request",
            AttendanceStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceOutcome {
    pub status: AttendanceStatus,
    pub updated: usize,
    pub skipped: usize,
}

/// Mark one class across every operations record: present students get
/// `true`, everyone else `false`. Records already carrying the desired flag
/// are skipped, so re-marking the same roster is a no-op.
pub fn bulk_mark_attendance(
    store: &DocStore,
    locks: &ClassLocks,
    class_id: &str,
    present_emails: &[String],
) -> Result<AttendanceOutcome, RosterError> {
    if class_id.trim().is_empty() {
        return Err(RosterError::Validation("class id is required".to_string()));
    }
    let Some(_guard) = locks.try_acquire(class_id) else {
        log::warn!("attendance marking already in progress for class {class_id}");
        return Ok(AttendanceOutcome {
            status: AttendanceStatus::DuplicateRequest,
            updated: 0,
            skipped: 0,
        });
    };

    let present: HashSet<String> = present_emails
        .iter()
        .map(|e| normalize_email(e))
        .filter(|e| !e.is_empty())
        .collect();

    let ids: Vec<String> = store
        .list(ADMIN_STUDENTS)?
        .into_iter()
        .map(|snap| snap.doc_id)
        .collect();
    if ids.is_empty() {
        log::warn!("no student records to mark attendance for class {class_id}");
        return Ok(AttendanceOutcome {
            status: AttendanceStatus::Failed,
            updated: 0,
            skipped: 0,
        });
    }

    let (updated, skipped) = store.run_transaction(|tx| -> Result<(usize, usize), StoreError> {
        let mut snaps = Vec::with_capacity(ids.len());
        for id in &ids {
            snaps.push((id.clone(), tx.read(ADMIN_STUDENTS, id)?));
        }
        let mut updated = 0;
        let mut skipped = 0;
        for (id, snap) in snaps {
            let mut record = snap
                .map(|s| s.body.as_object().cloned().unwrap_or_default())
                .unwrap_or_default();
            let mut attendance = record
                .get("Attendance")
                .map(parse_attendance)
                .unwrap_or_default();
            let current = attendance
                .get(class_id)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let desired = present.contains(&id);
            if current == desired {
                skipped += 1;
                continue;
            }
            attendance.insert(class_id.to_string(), json!(desired));
            record.insert("Attendance".to_string(), Value::Object(attendance));
            tx.write(ADMIN_STUDENTS, &id, Value::Object(record));
            updated += 1;
        }
        Ok((updated, skipped))
    })?;

    let status = if updated == 0 {
        AttendanceStatus::NoChanges
    } else {
        AttendanceStatus::Completed
    };
    log::info!(
        "attendance for class {class_id}: {updated} updated, {skipped} already correct"
    );
    Ok(AttendanceOutcome {
        status,
        updated,
        skipped,
    })
}

/// Update one operations record, restricted to the editable fields.
/// Unknown fields are dropped; an update with nothing left is rejected.
pub fn apply_student_update(
    store: &DocStore,
    email: &str,
    updates: &Map<String, Value>,
    total_labs: i64,
) -> Result<(), RosterError> {
    let norm = normalize_email(email);
    if norm.is_empty() {
        return Err(RosterError::Validation(
            "email address is required".to_string(),
        ));
    }
    let allowed = allowed_update_fields(total_labs);
    let mut fields = Map::new();
    for (key, value) in updates {
        if !allowed.iter().any(|a| a == key) {
            continue;
        }
        if key == "Attendance" {
            validate_attendance(value).map_err(RosterError::Validation)?;
            fields.insert(key.clone(), Value::Object(parse_attendance(value)));
        } else if key.starts_with("Assignment") {
            validate_grade(value)
                .map_err(|e| RosterError::Validation(format!("{key}: {e}")))?;
            fields.insert(key.clone(), value.clone());
        } else {
            fields.insert(key.clone(), value.clone());
        }
    }
    if fields.is_empty() {
        return Err(RosterError::Validation(format!(
            "no valid fields to update; allowed fields: {}",
            allowed.join(", ")
        )));
    }

    store.run_transaction(|tx| -> Result<(), StoreError> {
        let snap = tx.read(ADMIN_STUDENTS, &norm)?;
        let mut record = snap
            .map(|s| s.body.as_object().cloned().unwrap_or_default())
            .unwrap_or_default();
        record.insert("Email Address".to_string(), json!(norm));
        for (key, value) in &fields {
            record.insert(key.clone(), value.clone());
        }
        tx.write(ADMIN_STUDENTS, &norm, Value::Object(record));
        Ok(())
    })?;
    Ok(())
}

/// Validate-then-apply for bulk edits; any bad entry rejects the whole
/// batch before a single write.
pub fn apply_bulk_updates(
    store: &DocStore,
    updates: &[Value],
    total_labs: i64,
) -> Result<usize, RosterError> {
    if updates.is_empty() {
        return Err(RosterError::Validation(
            "updates array cannot be empty".to_string(),
        ));
    }
    if updates.len() > MAX_BULK_UPDATES {
        return Err(RosterError::Validation(format!(
            "cannot update more than {MAX_BULK_UPDATES} students at once"
        )));
    }

    let allowed = allowed_update_fields(total_labs);
    let mut parsed: Vec<(String, Map<String, Value>)> = Vec::new();
    for (i, update) in updates.iter().enumerate() {
        let Some(obj) = update.as_object() else {
            return Err(RosterError::Validation(format!(
                "update at index {i} must be an object"
            )));
        };
        let email = obj
            .get("email")
            .and_then(Value::as_str)
            .map(normalize_email)
            .unwrap_or_default();
        if email.is_empty() {
            return Err(RosterError::Validation(format!(
                "update at index {i} must have an \"email\" field"
            )));
        }
        let invalid: Vec<&str> = obj
            .keys()
            .filter(|k| *k != "email" && !allowed.iter().any(|a| a == *k))
            .map(String::as_str)
            .collect();
        if !invalid.is_empty() {
            return Err(RosterError::Validation(format!(
                "update at index {i} has invalid fields: {}",
                invalid.join(", ")
            )));
        }
        let mut fields = Map::new();
        for (key, value) in obj {
            if key == "email" {
                continue;
            }
            if key == "Attendance" {
                validate_attendance(value).map_err(RosterError::Validation)?;
                fields.insert(key.clone(), Value::Object(parse_attendance(value)));
            } else if key.starts_with("Assignment") {
                validate_grade(value)
                    .map_err(|e| RosterError::Validation(format!("{key}: {e}")))?;
                fields.insert(key.clone(), value.clone());
            } else {
                fields.insert(key.clone(), value.clone());
            }
        }
        parsed.push((email, fields));
    }

    let count = parsed.len();
    store.run_transaction(|tx| -> Result<(), StoreError> {
        let mut snaps = Vec::with_capacity(parsed.len());
        for (email, _) in &parsed {
            snaps.push(tx.read(ADMIN_STUDENTS, email)?);
        }
        for ((email, fields), snap) in parsed.iter().zip(snaps) {
            let mut record = snap
                .map(|s| s.body.as_object().cloned().unwrap_or_default())
                .unwrap_or_default();
            record.insert("Email Address".to_string(), json!(email));
            for (key, value) in fields {
                record.insert(key.clone(), value.clone());
            }
            tx.write(ADMIN_STUDENTS, email, Value::Object(record));
        }
        Ok(())
    })?;
    Ok(count)
}

/// Admin-set payment override, consulted ahead of the screenshot-derived
/// status during merges.
pub fn update_payment_status(
    store: &DocStore,
    email: &str,
    status: &str,
    comment: Option<&str>,
) -> Result<(), RosterError> {
    let norm = normalize_email(email);
    if norm.is_empty() {
        return Err(RosterError::Validation(
            "email address is required".to_string(),
        ));
    }
    let canonical = match status.trim().to_lowercase().as_str() {
        "paid" => "Paid",
        "unpaid" => "Unpaid",
        _ => {
            return Err(RosterError::Validation(
                "payment status must be Paid or Unpaid".to_string(),
            ))
        }
    };

    store.run_transaction(|tx| -> Result<(), StoreError> {
        let snap = tx.read(ADMIN_STUDENTS, &norm)?;
        let mut record = snap
            .map(|s| s.body.as_object().cloned().unwrap_or_default())
            .unwrap_or_default();
        record.insert("Email Address".to_string(), json!(norm));
        record.insert("Payment Status".to_string(), json!(canonical));
        if let Some(comment) = comment {
            record.insert("Payment Comment".to_string(), json!(comment));
        }
        tx.write(ADMIN_STUDENTS, &norm, Value::Object(record));
        Ok(())
    })?;
    Ok(())
}

pub fn list_classes(store: &DocStore) -> Result<Vec<Value>, StoreError> {
    Ok(store
        .list(ADMIN_CLASSES)?
        .into_iter()
        .map(|snap| snap.body)
        .collect())
}

pub fn add_class(store: &DocStore, class: Value) -> Result<Value, RosterError> {
    let Some(mut obj) = class.as_object().cloned() else {
        return Err(RosterError::Validation("class must be an object".to_string()));
    };
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    obj.insert("id".to_string(), json!(id));
    let body = Value::Object(obj);

    store.run_transaction(|tx| -> Result<(), StoreError> {
        tx.read(ADMIN_CLASSES, &id)?;
        tx.write(ADMIN_CLASSES, &id, body.clone());
        Ok(())
    })?;
    Ok(body)
}

pub fn delete_class(store: &DocStore, class_id: &str) -> Result<bool, StoreError> {
    store.run_transaction(|tx| {
        if tx.read(ADMIN_CLASSES, class_id)?.is_none() {
            return Ok(false);
        }
        tx.delete(ADMIN_CLASSES, class_id);
        Ok(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::courses::CourseError;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_store(prefix: &str) -> (DocStore, PathBuf) {
        let ws = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&ws).expect("create temp dir");
        let store = DocStore::open(&ws).expect("open store");
        (store, ws)
    }

    fn table(headers: &[&str], rows: &[&[&str]]) -> SheetTable {
        SheetTable {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    fn row_for<'a>(
        rows: &'a [Map<String, Value>],
        email: &str,
    ) -> &'a Map<String, Value> {
        rows.iter()
            .find(|r| student_email(r).eq_ignore_ascii_case(email))
            .unwrap_or_else(|| panic!("no row for {email}"))
    }

    fn seed_admin_record(store: &DocStore, email: &str, record: Value) {
        store
            .run_transaction(|tx| -> Result<(), StoreError> {
                tx.read(ADMIN_STUDENTS, email)?;
                tx.write(ADMIN_STUDENTS, email, record.clone());
                Ok(())
            })
            .expect("seed admin record");
    }

    #[test]
    fn email_columns_are_discovered_by_keyword() {
        let headers = vec![
            "Timestamp".to_string(),
            "Your E-Mail".to_string(),
            "Student Email ".to_string(),
        ];
        assert_eq!(find_email_column(&headers), Some(1));
        assert_eq!(find_student_email_column(&headers), Some(2));
        assert_eq!(find_email_column(&["Name".to_string()]), None);
    }

    #[test]
    fn same_email_links_register_and_survey() {
        let register = table(
            &["Email Address", "Payment Method", "Add Payment Screenshot."],
            &[&["ana@example.com", "Bank", "shot.png"]],
        );
        let survey = table(
            &["Email Address", "Full Name"],
            &[&["ana@example.com", "Ana A"]],
        );
        let rows = merge_register_survey(&register, &survey).expect("merge");
        assert_eq!(rows.len(), 1);
        let ana = row_for(&rows, "ana@example.com");
        assert_eq!(ana["Payment Status"], "Paid");
        assert_eq!(ana["Payment Method"], "Bank");
        assert_eq!(ana["Has Survey Response"], true);
        assert_eq!(ana["Name"], "Ana A");
    }

    #[test]
    fn google_email_links_when_typed_email_missing() {
        let register = table(
            &["Email Address", "Student Email", "Add Payment Screenshot"],
            &[&["g.ben@example.com", "", "pay.jpg"]],
        );
        let survey = table(
            &["Email Address", "Student Email", "Name"],
            &[&["g.ben@example.com", "", "Ben"]],
        );
        let rows = merge_register_survey(&register, &survey).expect("merge");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Payment Status"], "Paid");
    }

    #[test]
    fn one_overlapping_email_is_enough() {
        // Register knows the student by two addresses; the survey was filled
        // from a different Google account but typed the shared one.
        let register = table(
            &["Email Address", "Student Email", "Add Payment Screenshot"],
            &[&["google.cara@example.com", "cara@school.edu", "img.png"]],
        );
        let survey = table(
            &["Email Address", "Student Email", "Name"],
            &[&["other.cara@example.com", "cara@school.edu", "Cara"]],
        );
        let rows = merge_register_survey(&register, &survey).expect("merge");
        assert_eq!(rows.len(), 1, "register row must not be re-appended");
        assert_eq!(rows[0]["Payment Status"], "Paid");
        assert_eq!(rows[0]["Has Survey Response"], true);
    }

    #[test]
    fn unmatched_rows_from_both_sides_survive() {
        let register = table(
            &["Email Address", "Add Payment Screenshot"],
            &[&["paidonly@example.com", "s.png"]],
        );
        let survey = table(
            &["Email Address", "Name"],
            &[&["surveyonly@example.com", "Sol"]],
        );
        let rows = merge_register_survey(&register, &survey).expect("merge");
        assert_eq!(rows.len(), 2);

        let sol = row_for(&rows, "surveyonly@example.com");
        assert_eq!(sol["Payment Status"], "Unpaid");
        assert_eq!(sol["Has Survey Response"], true);

        let paid = row_for(&rows, "paidonly@example.com");
        assert_eq!(paid["Payment Status"], "Paid");
        assert_eq!(paid["Has Survey Response"], false);
    }

    #[test]
    fn register_only_student_with_two_emails_appears_once() {
        let register = table(
            &["Email Address", "Student Email", "Add Payment Screenshot"],
            &[&["dora@gmail.example", "dora@school.edu", ""]],
        );
        let survey = table(&["Email Address"], &[&["someone.else@example.com"]]);
        let rows = merge_register_survey(&register, &survey).expect("merge");
        let dora_rows = rows
            .iter()
            .filter(|r| student_email(r).starts_with("dora@"))
            .count();
        assert_eq!(dora_rows, 1);
    }

    #[test]
    fn survey_only_roster_is_all_unpaid() {
        let register = SheetTable::default();
        let survey = table(
            &["Email Address", "First Name", "Last Name"],
            &[&["eli@example.com", "Eli", "Stone"]],
        );
        let rows = merge_register_survey(&register, &survey).expect("merge");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Payment Status"], "Unpaid");
        assert_eq!(rows[0]["Name"], "Eli Stone");
    }

    #[test]
    fn later_register_rows_win() {
        let register = table(
            &["Email Address", "Add Payment Screenshot"],
            &[
                &["fay@example.com", ""],
                &["fay@example.com", "receipt.png"],
            ],
        );
        let survey = table(&["Email Address"], &[&["fay@example.com"]]);
        let rows = merge_register_survey(&register, &survey).expect("merge");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Payment Status"], "Paid");
    }

    #[test]
    fn admin_records_override_and_pad() {
        let merged = vec![{
            let mut m = Map::new();
            m.insert("Email Address".to_string(), json!("gia@example.com"));
            m.insert("Name".to_string(), json!("Gia"));
            m.insert("Payment Status".to_string(), json!("Unpaid"));
            m.insert("Has Survey Response".to_string(), json!(true));
            m
        }];
        let mut record = Map::new();
        record.insert("Payment Status".to_string(), json!("Paid"));
        record.insert("Teacher Evaluation".to_string(), json!("Strong"));
        record.insert("Attendance".to_string(), json!({"c1": true}));
        record.insert("Assignment 1 Grade".to_string(), json!("95"));
        let admin = vec![
            ("gia@example.com".to_string(), record),
            ("manual@example.com".to_string(), {
                let mut m = Map::new();
                m.insert("Name".to_string(), json!("Manu Al"));
                m
            }),
        ];

        let rows = attach_admin_records(merged, &admin, 2);
        assert_eq!(rows.len(), 2);

        let gia = row_for(&rows, "gia@example.com");
        assert_eq!(gia["Payment Status"], "Paid");
        assert_eq!(gia["Teacher Evaluation"], "Strong");
        assert_eq!(gia["Attendance"]["c1"], true);
        assert_eq!(gia["Assignment 1 Grade"], "95");
        assert_eq!(gia["Assignment 2 Grade"], "");

        let manual = row_for(&rows, "manual@example.com");
        assert_eq!(manual["Name"], "Manu Al");
        assert_eq!(manual["Payment Status"], "Unpaid");
        assert_eq!(manual["Has Survey Response"], false);
        assert_eq!(manual["Attendance"], json!({}));
    }

    #[test]
    fn metrics_count_and_round() {
        let mut rows = Vec::new();
        for (email, status, resume, survey) in [
            ("a@x.com", "Paid", "cv.pdf", true),
            ("b@x.com", "Unpaid", "", true),
            ("c@x.com", "Paid", "N/A", false),
        ] {
            let mut m = Map::new();
            m.insert("Email Address".to_string(), json!(email));
            m.insert("Payment Status".to_string(), json!(status));
            m.insert("Resume Link".to_string(), json!(resume));
            m.insert("Has Survey Response".to_string(), json!(survey));
            rows.push(m);
        }
        let metrics = calculate_metrics(&rows);
        assert_eq!(metrics["totalStudents"], 3);
        assert_eq!(metrics["paidCount"], 2);
        assert_eq!(metrics["unpaidCount"], 1);
        assert_eq!(metrics["hasResumeCount"], 1);
        assert_eq!(metrics["onboardingPercentage"], 33.33);
        assert_eq!(metrics["surveyFilledCount"], 2);
        assert_eq!(metrics["surveyNotFilledCount"], 1);
    }

    #[test]
    fn attendance_marking_is_idempotent_per_class() {
        let (store, ws) = temp_store("coursedesk-roster-attendance");
        let locks = ClassLocks::new();
        for email in ["a@x.com", "b@x.com", "c@x.com"] {
            seed_admin_record(&store, email, json!({"Email Address": email}));
        }

        let out = bulk_mark_attendance(&store, &locks, "c1", &["a@x.com".to_string()])
            .expect("mark");
        assert_eq!(out.status, AttendanceStatus::Completed);
        // Only a@x.com changed; b and c were already absent-by-default.
        assert_eq!(out.updated, 1);
        assert_eq!(out.skipped, 2);

        let again = bulk_mark_attendance(&store, &locks, "c1", &["a@x.com".to_string()])
            .expect("mark again");
        assert_eq!(again.status, AttendanceStatus::NoChanges);
        assert_eq!(again.updated, 0);
        assert_eq!(again.skipped, 3);

        let flipped =
            bulk_mark_attendance(&store, &locks, "c1", &["b@x.com".to_string()]).expect("flip");
        assert_eq!(flipped.status, AttendanceStatus::Completed);
        assert_eq!(flipped.updated, 2);
        assert_eq!(flipped.skipped, 1);

        let record = store
            .get_required(ADMIN_STUDENTS, "b@x.com")
            .expect("record");
        assert_eq!(record.body["Attendance"]["c1"], true);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn concurrent_marking_of_same_class_is_rejected() {
        let (store, ws) = temp_store("coursedesk-roster-duplicate");
        let locks = ClassLocks::new();
        seed_admin_record(&store, "a@x.com", json!({"Email Address": "a@x.com"}));

        let held = locks.try_acquire("c1").expect("acquire");
        let out = bulk_mark_attendance(&store, &locks, "c1", &[]).expect("mark");
        assert_eq!(out.status, AttendanceStatus::DuplicateRequest);

        // A different class is unaffected.
        let other = bulk_mark_attendance(&store, &locks, "c2", &[]).expect("mark other");
        assert_ne!(other.status, AttendanceStatus::DuplicateRequest);

        drop(held);
        let retried = bulk_mark_attendance(&store, &locks, "c1", &[]).expect("retry");
        assert_ne!(retried.status, AttendanceStatus::DuplicateRequest);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn sync_lock_blocks_until_released_or_stale() {
        let (store, ws) = temp_store("coursedesk-roster-sync");
        assert!(acquire_sync_lock(&store).expect("first acquire"));
        assert!(!acquire_sync_lock(&store).expect("second acquire"));

        release_sync_lock(&store, true, None).expect("release");
        let status = sync_status(&store).expect("status");
        assert_eq!(status["status"], "IDLE");
        assert!(acquire_sync_lock(&store).expect("reacquire"));

        release_sync_lock(&store, false, Some("merge exploded")).expect("release error");
        let status = sync_status(&store).expect("status");
        assert_eq!(status["status"], "ERROR");
        assert_eq!(status["lastError"], "merge exploded");
        // ERROR state does not block the next run.
        assert!(acquire_sync_lock(&store).expect("after error"));

        // A crashed run's IN_PROGRESS claim is stealable once expired.
        let stale = (Utc::now() - chrono::Duration::minutes(SYNC_LOCK_MAX_AGE_MINUTES + 5))
            .to_rfc3339();
        store
            .run_transaction(|tx| -> Result<(), StoreError> {
                tx.read(SYNC, SYNC_DOC)?;
                tx.write(
                    SYNC,
                    SYNC_DOC,
                    json!({"status": "IN_PROGRESS", "startedAt": stale}),
                );
                Ok(())
            })
            .expect("force stale");
        assert!(acquire_sync_lock(&store).expect("steal stale"));

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn run_sync_populates_cache_and_metrics() {
        let (store, ws) = temp_store("coursedesk-roster-runsync");
        courses::mutate_catalog(&store, |catalog| {
            catalog["courses"] = json!([{
                "id": "c1", "title": "Main", "isVisible": true,
                "modules": [
                    {"id": "m1", "title": "Intro", "hours": 2, "focus": "F", "labCount": 1},
                    {"id": "m2", "title": "Deep", "hours": 2, "focus": "F", "labCount": 1},
                ],
            }]);
            Ok::<(), CourseError>(())
        })
        .expect("seed catalog");
        seed_admin_record(
            &store,
            "ana@example.com",
            json!({"Payment Status": "Paid", "Assignment 1 Grade": "88"}),
        );

        let register = table(
            &["Email Address", "Add Payment Screenshot"],
            &[&["ana@example.com", ""]],
        );
        let survey = table(
            &["Email Address", "Name"],
            &[&["ana@example.com", "Ana A"]],
        );
        let report = run_sync(&store, &register, &survey).expect("sync");
        assert_eq!(report.student_count, 1);
        assert_eq!(report.metrics["paidCount"], 1);

        let cached = cached_students(&store).expect("cached");
        assert_eq!(cached.len(), 1);
        // Admin override beats the missing screenshot.
        assert_eq!(cached[0]["Payment Status"], "Paid");
        assert_eq!(cached[0]["Assignment 1 Grade"], "88");
        assert_eq!(cached[0]["Assignment 2 Grade"], "");

        let metrics = latest_metrics(&store).expect("metrics").expect("present");
        assert_eq!(metrics["totalStudents"], 1);
        assert!(metrics.get("lastSynced").is_some());

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn student_updates_respect_allow_list() {
        let (store, ws) = temp_store("coursedesk-roster-update");
        let mut updates = Map::new();
        updates.insert("Teacher Evaluation".to_string(), json!("Solid"));
        updates.insert("Payment Status".to_string(), json!("Paid"));
        updates.insert("Attendance".to_string(), json!("{\"c1\": true}"));
        apply_student_update(&store, "Hana@Example.com ", &updates, 2).expect("update");

        let record = store
            .get_required(ADMIN_STUDENTS, "hana@example.com")
            .expect("record");
        assert_eq!(record.body["Teacher Evaluation"], "Solid");
        // Payment Status is not an editable field here.
        assert!(record.body.get("Payment Status").is_none());
        assert_eq!(record.body["Attendance"]["c1"], true);

        let mut bogus = Map::new();
        bogus.insert("Favorite Color".to_string(), json!("red"));
        let err = apply_student_update(&store, "hana@example.com", &bogus, 2)
            .expect_err("nothing editable");
        assert!(matches!(err, RosterError::Validation(_)));

        let mut bad_grade = Map::new();
        bad_grade.insert("Assignment 1 Grade".to_string(), json!({"nope": 1}));
        let err = apply_student_update(&store, "hana@example.com", &bad_grade, 2)
            .expect_err("bad grade");
        assert!(matches!(err, RosterError::Validation(_)));

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn bulk_updates_validate_before_writing() {
        let (store, ws) = temp_store("coursedesk-roster-bulk");
        let updates = vec![
            json!({"email": "a@x.com", "Teacher Evaluation": "Good"}),
            json!({"email": "b@x.com", "Favorite Color": "red"}),
        ];
        let err = apply_bulk_updates(&store, &updates, 2).expect_err("invalid field");
        match err {
            RosterError::Validation(msg) => {
                assert!(msg.contains("index 1"), "got: {msg}");
                assert!(msg.contains("Favorite Color"), "got: {msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing was written for the valid first entry either.
        assert!(store.get(ADMIN_STUDENTS, "a@x.com").expect("get").is_none());

        let good = vec![
            json!({"email": "a@x.com", "Teacher Evaluation": "Good"}),
            json!({"email": "b@x.com", "Assignment 2 Grade": 77}),
        ];
        assert_eq!(apply_bulk_updates(&store, &good, 2).expect("bulk"), 2);
        let b = store.get_required(ADMIN_STUDENTS, "b@x.com").expect("b");
        assert_eq!(b.body["Assignment 2 Grade"], 77);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn payment_override_is_validated_and_stored() {
        let (store, ws) = temp_store("coursedesk-roster-payment");
        update_payment_status(&store, "ira@example.com", "paid", Some("wire ref 991"))
            .expect("set status");
        let record = store
            .get_required(ADMIN_STUDENTS, "ira@example.com")
            .expect("record");
        assert_eq!(record.body["Payment Status"], "Paid");
        assert_eq!(record.body["Payment Comment"], "wire ref 991");

        let err = update_payment_status(&store, "ira@example.com", "maybe", None)
            .expect_err("bad status");
        assert!(matches!(err, RosterError::Validation(_)));

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn classes_crud_round_trip() {
        let (store, ws) = temp_store("coursedesk-roster-classes");
        let created = add_class(&store, json!({"name": "Week 1", "date": "2026-02-07"}))
            .expect("add");
        let id = created["id"].as_str().expect("id").to_string();
        assert!(!id.is_empty());

        let classes = list_classes(&store).expect("list");
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0]["name"], "Week 1");

        assert!(delete_class(&store, &id).expect("delete"));
        assert!(!delete_class(&store, &id).expect("delete again"));
        assert!(list_classes(&store).expect("list").is_empty());

        let _ = std::fs::remove_dir_all(ws);
    }
}
