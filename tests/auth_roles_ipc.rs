use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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
    let exe = env!("CARGO_BIN_EXE_examhalld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examhalld");
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

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

fn str_at(v: &serde_json::Value, pointer: &str) -> String {
    v.pointer(pointer)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", pointer, v))
        .to_string()
}

#[test]
fn bootstrap_logins_and_role_gates() {
    let workspace = temp_dir("examhall-auth");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let mut n = 0;
    let mut next_id = || {
        n += 1;
        n.to_string()
    };

    request_ok(&mut stdin, &mut reader, &next_id(), "workspace.select",
        json!({ "path": workspace.to_string_lossy() }));

    let me = request_ok(&mut stdin, &mut reader, &next_id(), "auth.whoami", json!({}));
    assert!(me["session"].is_null());

    let short = request_err(&mut stdin, &mut reader, &next_id(), "auth.bootstrapAdmin",
        json!({ "username": "admin", "password": "abc" }));
    assert_eq!(short["code"], "bad_params");

    let admin = request_ok(&mut stdin, &mut reader, &next_id(), "auth.bootstrapAdmin",
        json!({ "username": "admin", "password": "admin123" }));
    assert_eq!(admin["role"], "admin");
    assert!(admin["profileId"].is_null());

    let again = request_err(&mut stdin, &mut reader, &next_id(), "auth.bootstrapAdmin",
        json!({ "username": "admin2", "password": "admin123" }));
    assert_eq!(again["code"], "conflict");

    let dept = request_ok(&mut stdin, &mut reader, &next_id(), "departments.create",
        json!({ "name": "Computer Science" }));
    let dept_id = str_at(&dept, "/departmentId");
    let teacher = request_ok(&mut stdin, &mut reader, &next_id(), "teachers.create",
        json!({ "employeeId": "T100", "username": "tina", "password": "teach1",
                "departmentId": dept_id, "subject": "Algorithms" }));
    let teacher_id = str_at(&teacher, "/teacherId");
    let student = request_ok(&mut stdin, &mut reader, &next_id(), "students.create",
        json!({ "rollNo": "24CSE001", "username": "sam", "password": "stud1",
                "departmentId": dept_id }));
    let student_id = str_at(&student, "/studentId");

    let dup = request_err(&mut stdin, &mut reader, &next_id(), "students.create",
        json!({ "rollNo": "24CSE002", "username": "tina", "password": "stud2",
                "departmentId": dept_id }));
    assert_eq!(dup["code"], "conflict");
    assert_eq!(dup["details"]["field"], "username");

    let out = request_ok(&mut stdin, &mut reader, &next_id(), "auth.logout", json!({}));
    assert_eq!(out["loggedOut"], true);
    let anon = request_err(&mut stdin, &mut reader, &next_id(), "halls.list", json!({}));
    assert_eq!(anon["code"], "unauthenticated");

    // Role must match the login flavour.
    let wrong_role = request_err(&mut stdin, &mut reader, &next_id(), "auth.adminLogin",
        json!({ "username": "tina", "password": "teach1" }));
    assert_eq!(wrong_role["code"], "unauthenticated");
    let bad_pw = request_err(&mut stdin, &mut reader, &next_id(), "auth.teacherLogin",
        json!({ "username": "tina", "password": "nope" }));
    assert_eq!(bad_pw["code"], "unauthenticated");

    let t = request_ok(&mut stdin, &mut reader, &next_id(), "auth.teacherLogin",
        json!({ "username": "tina", "password": "teach1" }));
    assert_eq!(t["role"], "teacher");
    assert_eq!(t["profileId"], teacher_id.as_str());
    let forbidden = request_err(&mut stdin, &mut reader, &next_id(), "departments.list", json!({}));
    assert_eq!(forbidden["code"], "forbidden");
    let dash = request_ok(&mut stdin, &mut reader, &next_id(), "dashboard.teacher", json!({}));
    assert_eq!(dash["assignments"].as_array().map(|a| a.len()), Some(0));

    let unknown_roll = request_err(&mut stdin, &mut reader, &next_id(), "auth.studentLogin",
        json!({ "rollNo": "24CSE999", "password": "stud1" }));
    assert_eq!(unknown_roll["code"], "not_found");
    let wrong_pw = request_err(&mut stdin, &mut reader, &next_id(), "auth.studentLogin",
        json!({ "rollNo": "24CSE001", "password": "wrong" }));
    assert_eq!(wrong_pw["code"], "unauthenticated");

    let s = request_ok(&mut stdin, &mut reader, &next_id(), "auth.studentLogin",
        json!({ "rollNo": "24CSE001", "password": "stud1" }));
    assert_eq!(s["role"], "student");
    assert_eq!(s["username"], "sam");
    assert_eq!(s["profileId"], student_id.as_str());
    let me = request_ok(&mut stdin, &mut reader, &next_id(), "auth.whoami", json!({}));
    assert_eq!(me["session"]["role"], "student");
    let no_admin = request_err(&mut stdin, &mut reader, &next_id(), "dashboard.admin", json!({}));
    assert_eq!(no_admin["code"], "forbidden");
    let no_sheet = request_err(&mut stdin, &mut reader, &next_id(), "seating.overview",
        json!({ "examId": "x" }));
    assert_eq!(no_sheet["code"], "forbidden");

    // The public home view needs a workspace but no login.
    request_ok(&mut stdin, &mut reader, &next_id(), "auth.logout", json!({}));
    let home = request_ok(&mut stdin, &mut reader, &next_id(), "dashboard.home", json!({}));
    assert_eq!(home["students"], 1);
    assert_eq!(home["teachers"], 1);
    assert_eq!(home["halls"], 0);

    let admin = request_ok(&mut stdin, &mut reader, &next_id(), "auth.adminLogin",
        json!({ "username": "admin", "password": "admin123" }));
    assert_eq!(admin["role"], "admin");
    request_ok(&mut stdin, &mut reader, &next_id(), "students.update",
        json!({ "studentId": student_id, "password": "" }));
    request_ok(&mut stdin, &mut reader, &next_id(), "auth.studentLogin",
        json!({ "rollNo": "24CSE001", "password": "stud1" }));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
