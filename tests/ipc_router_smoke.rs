use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

const ADMIN_KEY: &str = "smoke-admin-key";

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coursedeskd");
    let mut child = Command::new(exe)
        .env("COURSEDESK_ADMIN_KEY", ADMIN_KEY)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn coursedeskd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("coursedesk-router-smoke");
    let bundle_out = workspace.join("smoke-backup.cdbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let login = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "key": ADMIN_KEY }),
    );
    let token = login
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.check",
        json!({ "token": token }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "profiles.upsert",
        json!({ "token": token, "uid": "u-smoke", "name": "Smoke Student" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "profiles.get",
        json!({ "token": token, "uid": "u-smoke" }),
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "admin.course.add",
        json!({
            "token": token,
            "course": { "title": "Smoke Course", "isVisible": true }
        }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();
    let module = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "admin.module.add",
        json!({
            "token": token,
            "courseId": course_id,
            "module": { "title": "Intro", "hours": 2, "focus": "Basics", "labCount": 1 }
        }),
    );
    let module_id = module
        .get("moduleId")
        .and_then(|v| v.as_str())
        .expect("moduleId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "9", "course.data", json!({}));
    let _ = request_ok(&mut stdin, &mut reader, "10", "course.version", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "admin.data",
        json!({ "token": token }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "admin.module.update",
        json!({
            "token": token,
            "courseId": course_id,
            "moduleId": module_id,
            "module": { "title": "Intro v2", "hours": 3, "focus": "Basics" }
        }),
    );

    let poll = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "polls.create",
        json!({
            "token": token,
            "question": "Which track?",
            "options": ["Backend", "Frontend"]
        }),
    );
    let poll_id = poll
        .pointer("/poll/id")
        .and_then(|v| v.as_str())
        .expect("poll id")
        .to_string();
    let option_id = poll
        .pointer("/poll/options/0/id")
        .and_then(|v| v.as_str())
        .expect("option id")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "14", "polls.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "polls.get",
        json!({ "pollId": poll_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "polls.vote",
        json!({
            "uid": "u-smoke",
            "name": "Smoke Student",
            "pollId": poll_id,
            "optionId": option_id
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "polls.setActive",
        json!({ "token": token, "pollId": poll_id, "isActive": true }),
    );

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "dashboard.pollOpen",
        json!({ "uid": "u-dash", "name": "Dash Student", "pollId": poll_id }),
    );
    let session_id = session
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "dashboard.pollVote",
        json!({ "sessionId": session_id, "optionId": option_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "dashboard.pollState",
        json!({ "sessionId": session_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "dashboard.courseView",
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "dashboard.pollClose",
        json!({ "sessionId": session_id }),
    );

    let announcement = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "announcements.create",
        json!({ "token": token, "title": "Welcome", "body": "First cohort starts Monday." }),
    );
    let announcement_id = announcement
        .pointer("/announcement/id")
        .and_then(|v| v.as_str())
        .expect("announcement id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "announcements.list",
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "announcements.delete",
        json!({ "token": token, "id": announcement_id }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "26",
        "students.sync",
        json!({
            "token": token,
            "register": {
                "headers": ["Email Address", "Add Payment Screenshot"],
                "rows": [["ada@example.com", "shot.png"]]
            },
            "survey": {
                "headers": ["Email Address", "Student Full Name"],
                "rows": [["ada@example.com", "Ada Lovelace"]]
            }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "27",
        "students.syncStatus",
        json!({ "token": token }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "28",
        "students.list",
        json!({ "token": token }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "29",
        "students.get",
        json!({ "token": token, "email": "ada@example.com" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "30",
        "students.update",
        json!({
            "token": token,
            "email": "ada@example.com",
            "updates": { "Teacher Evaluation": "strong" }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "31",
        "students.bulkUpdate",
        json!({
            "token": token,
            "updates": [{ "email": "ada@example.com", "Name": "Ada L." }]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "32",
        "students.metrics",
        json!({ "token": token }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "33",
        "students.setPaymentStatus",
        json!({ "token": token, "email": "ada@example.com", "status": "paid" }),
    );

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "34",
        "classes.add",
        json!({ "token": token, "class": { "name": "Week 1" } }),
    );
    let class_id = class
        .pointer("/class/id")
        .and_then(|v| v.as_str())
        .expect("class id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "35",
        "classes.list",
        json!({ "token": token }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "36",
        "classes.markAttendance",
        json!({
            "token": token,
            "classId": class_id,
            "presentEmails": ["ada@example.com"]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "37",
        "classes.delete",
        json!({ "token": token, "classId": class_id }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "38",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "39",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "40",
        "polls.delete",
        json!({ "token": token, "pollId": poll_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "41",
        "admin.course.delete",
        json!({ "token": token, "courseId": course_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "42",
        "auth.logout",
        json!({ "token": token }),
    );

    let unknown = request(
        &mut stdin,
        &mut reader,
        "43",
        "auth.check",
        json!({ "token": token }),
    );
    assert_eq!(
        unknown.pointer("/result/valid").and_then(|v| v.as_bool()),
        Some(false)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unparseable_lines_and_unknown_methods_answer_on_the_wire() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let reply: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(reply.get("id").map_or(false, |id| id.is_null()));
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        reply.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_json")
    );

    // The daemon keeps serving after a garbage line.
    let payload = json!({ "id": "u1", "method": "game.highScores", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush");
    line.clear();
    reader.read_line(&mut line).expect("read response line");
    let reply: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(reply.get("id").and_then(|v| v.as_str()), Some("u1"));
    assert_eq!(
        reply.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
}
