use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_data_dir(prefix: &str) -> PathBuf {
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

fn spawn_daemon(data_dir: &Path) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_dojangd");
    let mut child = Command::new(exe)
        .arg("--data-dir")
        .arg(data_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn dojangd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(t) = token {
        payload["token"] = json!(t);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, token, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn err_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
    password: &str,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        "login",
        "auth.login",
        None,
        json!({ "username": username, "password": password }),
    );
    result
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string()
}

fn make_branch(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    name: &str,
) -> String {
    let branch = request_ok(
        stdin,
        reader,
        &format!("branch-{name}"),
        "branches.create",
        Some(token),
        json!({ "name": name }),
    );
    branch["branch"]["id"].as_str().expect("branch id").to_string()
}

fn make_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    branch_id: &str,
    first: &str,
) -> String {
    let student = request_ok(
        stdin,
        reader,
        &format!("student-{first}"),
        "students.create",
        Some(token),
        json!({ "firstName": first, "lastName": "Park", "branchId": branch_id }),
    );
    student["student"]["id"].as_str().expect("student id").to_string()
}

#[test]
fn soft_delete_hides_from_list_but_not_get() {
    let data_dir = temp_data_dir("dojangd-students-soft");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let admin = login(&mut stdin, &mut reader, "admin", "admin123");
    let branch_id = make_branch(&mut stdin, &mut reader, &admin, "North Dojang");
    let student_id = make_student(&mut stdin, &mut reader, &admin, &branch_id, "Ha-eun");

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "students.delete",
        Some(&admin),
        json!({ "id": student_id }),
    );
    assert_eq!(deleted["permanent"].as_bool(), Some(false));

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "students.list",
        Some(&admin),
        json!({}),
    );
    assert_eq!(listing["students"].as_array().map(|a| a.len()), Some(0));

    // Still fetchable by id, flagged inactive.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "students.get",
        Some(&admin),
        json!({ "id": student_id }),
    );
    assert_eq!(fetched["student"]["isActive"].as_bool(), Some(false));

    let inactive = request_ok(
        &mut stdin,
        &mut reader,
        "inactive",
        "students.listInactive",
        Some(&admin),
        json!({}),
    );
    assert_eq!(inactive["students"].as_array().map(|a| a.len()), Some(1));

    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "restore",
        "students.restore",
        Some(&admin),
        json!({ "id": student_id }),
    );
    assert_eq!(restored["student"]["isActive"].as_bool(), Some(true));
    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "list2",
        "students.list",
        Some(&admin),
        json!({}),
    );
    assert_eq!(listing["students"].as_array().map(|a| a.len()), Some(1));
}

#[test]
fn permanent_delete_cascades_dependents() {
    let data_dir = temp_data_dir("dojangd-students-hard");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let admin = login(&mut stdin, &mut reader, "admin", "admin123");
    let branch_id = make_branch(&mut stdin, &mut reader, &admin, "South Dojang");
    let student_id = make_student(&mut stdin, &mut reader, &admin, &branch_id, "Seo-yeon");

    request_ok(
        &mut stdin,
        &mut reader,
        "att",
        "attendance.record",
        Some(&admin),
        json!({ "studentId": student_id, "date": "2026-03-02", "status": "present" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "fee",
        "fees.record",
        Some(&admin),
        json!({ "studentId": student_id, "month": "2026-03", "feeType": "tuition", "amount": 80.0 }),
    );

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "students.delete",
        Some(&admin),
        json!({ "id": student_id, "permanent": true }),
    );
    assert_eq!(deleted["permanent"].as_bool(), Some(true));

    let fetched = request(
        &mut stdin,
        &mut reader,
        "get",
        "students.get",
        Some(&admin),
        json!({ "id": student_id }),
    );
    assert_eq!(err_code(&fetched), "not_found");

    let attendance = request_ok(
        &mut stdin,
        &mut reader,
        "att-list",
        "attendance.list",
        Some(&admin),
        json!({}),
    );
    assert_eq!(attendance["attendance"].as_array().map(|a| a.len()), Some(0));
    let fees = request_ok(
        &mut stdin,
        &mut reader,
        "fees-list",
        "fees.list",
        Some(&admin),
        json!({}),
    );
    assert_eq!(fees["fees"].as_array().map(|a| a.len()), Some(0));
}

#[test]
fn permanent_delete_is_admin_only() {
    let data_dir = temp_data_dir("dojangd-students-hard-denied");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let admin = login(&mut stdin, &mut reader, "admin", "admin123");
    let branch_id = make_branch(&mut stdin, &mut reader, &admin, "East Dojang");
    let student_id = make_student(&mut stdin, &mut reader, &admin, &branch_id, "Joon");

    request_ok(
        &mut stdin,
        &mut reader,
        "mk-inst",
        "instructors.create",
        Some(&admin),
        json!({
            "username": "choi",
            "password": "choi-secret",
            "firstName": "Choi",
            "lastName": "Instructor",
            "branchId": branch_id,
        }),
    );
    let choi = login(&mut stdin, &mut reader, "choi", "choi-secret");

    let denied = request(
        &mut stdin,
        &mut reader,
        "del",
        "students.delete",
        Some(&choi),
        json!({ "id": student_id, "permanent": true }),
    );
    assert_eq!(err_code(&denied), "forbidden");

    // Soft delete inside their own branch is allowed.
    let soft = request_ok(
        &mut stdin,
        &mut reader,
        "soft",
        "students.delete",
        Some(&choi),
        json!({ "id": student_id }),
    );
    assert_eq!(soft["permanent"].as_bool(), Some(false));
}

#[test]
fn create_requires_fields_and_known_branch() {
    let data_dir = temp_data_dir("dojangd-students-validate");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let admin = login(&mut stdin, &mut reader, "admin", "admin123");

    let missing = request(
        &mut stdin,
        &mut reader,
        "missing",
        "students.create",
        Some(&admin),
        json!({ "firstName": "No" }),
    );
    assert_eq!(err_code(&missing), "validation_error");

    let bad_branch = request(
        &mut stdin,
        &mut reader,
        "bad-branch",
        "students.create",
        Some(&admin),
        json!({ "firstName": "No", "lastName": "Branch", "branchId": "nope" }),
    );
    assert_eq!(err_code(&bad_branch), "not_found");
}
