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

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    seq: usize,
}

impl Sidecar {
    fn admin(workspace: &std::path::Path) -> Self {
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Sidecar { child, stdin, reader, seq: 0 };
        s.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        s.ok("auth.bootstrapAdmin", json!({ "username": "admin", "password": "admin123" }));
        s
    }

    fn next(&mut self) -> String {
        self.seq += 1;
        self.seq.to_string()
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn err(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next();
        request_err(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn department(&mut self, name: &str) -> String {
        str_at(&self.ok("departments.create", json!({ "name": name })), "/departmentId")
    }

    fn hall(&mut self, name: &str, rows: u32, columns: u32) -> String {
        str_at(
            &self.ok("halls.create", json!({ "name": name, "rows": rows, "columns": columns })),
            "/hallId",
        )
    }

    fn students(&mut self, dept_id: &str, prefix: &str, n: usize) {
        for i in 1..=n {
            let roll = format!("{}{:03}", prefix, i);
            self.ok(
                "students.create",
                json!({ "rollNo": roll, "username": roll.to_lowercase(), "password": "pass1",
                        "departmentId": dept_id }),
            );
        }
    }

    fn close(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn exam(name: &str, start: &str, end: &str, depts: &[&str], halls: &[&str]) -> serde_json::Value {
    json!({
        "name": name,
        "date": "2031-03-10",
        "startTime": start,
        "endTime": end,
        "departmentIds": depts,
        "hallIds": halls,
    })
}


fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_examhalld"))
        .args(args)
        .output()
        .expect("run examhalld")
}

#[test]
fn regenerate_command_reseats_every_exam() {
    let workspace = temp_dir("examhall-cli");
    let mut sc = Sidecar::admin(&workspace);
    let cs = sc.department("CS");
    let hall = sc.hall("Hall A", 2, 2);
    sc.students(&cs, "24CSE", 3);
    let exam_id = str_at(&sc.ok("exams.create", exam("Maths", "09:00", "12:00", &[&cs], &[&hall])), "/examId");
    sc.close();

    let ws = workspace.to_string_lossy().to_string();
    let out = run_cli(&["regenerate", "--workspace", &ws, "--all"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        stdout.contains(&format!("ok {}: allocated 3 students across 1 halls", exam_id)),
        "stdout: {}",
        stdout
    );

    let out = run_cli(&["regenerate", "--workspace", &ws, "--exam-id", "missing"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("failed missing:"));

    // Exactly one of --exam-id / --all.
    let out = run_cli(&["regenerate", "--workspace", &ws]);
    assert!(!out.status.success());

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn workspace_flag_opens_before_serving() {
    let workspace = temp_dir("examhall-cli-serve");
    let ws = workspace.to_string_lossy().to_string();
    let mut child = Command::new(env!("CARGO_BIN_EXE_examhalld"))
        .args(["--workspace", ws.as_str()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examhalld");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("child stdout"));
    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["workspacePath"], ws.as_str());
    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
