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

#[test]
fn combined_session_is_seated_without_neighbouring_departments() {
    let workspace = temp_dir("examhall-combined");
    let mut sc = Sidecar::admin(&workspace);
    let cs = sc.department("CS");
    let me = sc.department("ME");
    let hall = sc.hall("Hall A", 2, 4);
    sc.students(&cs, "24CSE", 4);
    sc.students(&me, "24MEC", 4);

    let maths = sc.ok("exams.create", exam("Maths", "09:00", "12:00", &[&cs], &[&hall]));
    let maths_id = str_at(&maths, "/examId");
    assert_eq!(maths["allocation"]["placed"], 4);
    assert_eq!(maths["allocation"]["constraintApplied"], false);

    let drawing = sc.ok("exams.create", exam("Drawing", "09:00", "12:00", &[&me], &[&hall]));
    let drawing_id = str_at(&drawing, "/examId");
    let alloc = &drawing["allocation"];
    assert_eq!(alloc["placed"], 8);
    assert_eq!(alloc["hallCount"], 1);
    assert_eq!(alloc["groupCount"], 2);
    assert_eq!(alloc["constraintApplied"], true);
    assert_eq!(alloc["emptySeats"], 0);
    assert_eq!(alloc["examIds"].as_array().map(|a| a.len()), Some(2));
    assert!(alloc["message"]
        .as_str()
        .unwrap_or("")
        .starts_with("allocated 8 students across 1 halls"));

    let plan = sc.ok("seating.hallPlan", json!({ "examId": maths_id, "hallId": hall }));
    assert_eq!(plan["title"], "Combined Session: Hall A - Seating Plan");
    assert_eq!(plan["allocated"], 8);
    assert_eq!(plan["violations"], 0);
    assert_eq!(plan["departmentDetails"], json!(["CS (Maths)", "ME (Drawing)"]));
    let seats = plan["seats"].as_array().expect("seats");
    assert_eq!(seats.len(), 8);
    // Column-major: the first two cells are column 1.
    assert_eq!(seats[0]["col"], 1);
    assert_eq!(seats[1]["col"], 1);
    assert_eq!(seats[1]["row"], 2);
    assert_eq!(seats[0]["seatLabel"], "S1");
    assert!(seats.iter().all(|s| s["occupied"] == true));

    let overview = sc.ok("seating.overview", json!({ "examId": drawing_id }));
    assert_eq!(overview["totalCapacity"], 8);
    assert_eq!(overview["totalAllocated"], 8);
    assert_eq!(overview["halls"][0]["occupancyPercent"], 100.0);

    let got = sc.ok("exams.get", json!({ "examId": maths_id }));
    assert_eq!(got["exam"]["allocatedCount"], 4);
    assert_eq!(got["exam"]["totalStudents"], 4);

    // CS already sits this slot.
    let clash = sc.err("exams.create", exam("Physics", "09:00", "12:00", &[&cs], &[&hall]));
    assert_eq!(clash["code"], "conflict");

    sc.close();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn failed_allocation_rolls_back_the_exam() {
    let workspace = temp_dir("examhall-infeasible");
    let mut sc = Sidecar::admin(&workspace);
    let cs = sc.department("CS");
    let me = sc.department("ME");
    let row = sc.hall("Row Hall", 1, 4);
    let tiny = sc.hall("Tiny Hall", 1, 2);
    sc.students(&cs, "24CSE", 3);
    sc.students(&me, "24MEC", 1);

    let e = sc.err("exams.create", exam("Mixed", "09:00", "11:00", &[&cs, &me], &[&row]));
    assert_eq!(e["code"], "allocation_failed");
    assert_eq!(e["details"]["reason"], "infeasible");
    assert_eq!(e["details"]["unplaced"], 1);

    let e = sc.err("exams.create", exam("Crowded", "13:00", "15:00", &[&cs], &[&tiny]));
    assert_eq!(e["code"], "allocation_failed");
    assert_eq!(e["details"]["reason"], "insufficientCapacity");
    assert_eq!(e["details"]["students"], 3);
    assert_eq!(e["details"]["capacity"], 2);

    let list = sc.ok("exams.list", json!({ "today": "2031-01-01" }));
    assert_eq!(list["exams"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(list["stats"]["total"], 0);

    let bad_time = sc.err("exams.create", exam("Backwards", "11:00", "09:00", &[&cs], &[&row]));
    assert_eq!(bad_time["code"], "bad_params");
    let no_halls = sc.err("exams.create", exam("Nowhere", "09:00", "10:00", &[&cs], &[]));
    assert_eq!(no_halls["code"], "bad_params");

    sc.close();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn overlapping_and_department_conflicts_are_reported() {
    let workspace = temp_dir("examhall-conflicts");
    let mut sc = Sidecar::admin(&workspace);
    let cs = sc.department("CS");
    let civil = sc.department("Civil");
    let h1 = sc.hall("Hall 1", 2, 2);
    let h2 = sc.hall("Hall 2", 2, 2);
    sc.students(&cs, "24CSE", 2);

    sc.ok("exams.create", exam("Maths", "09:00", "12:00", &[&cs], &[&h1]));
    let overlap = sc.err("exams.create", exam("Physics", "10:00", "11:00", &[&cs], &[&h2]));
    assert_eq!(overlap["code"], "conflict");
    assert_eq!(overlap["details"]["kind"], "studentOverlap");
    let students = overlap["details"]["students"].as_array().expect("students");
    assert_eq!(students.len(), 2);
    assert_eq!(students[0]["rollNo"], "24CSE001");
    assert_eq!(
        students[0]["details"][0],
        "Conflict with exam 'Maths' (09:00 - 12:00) in Hall 1."
    );

    // Back-to-back is fine.
    sc.ok("exams.create", exam("Chemistry", "12:00", "13:00", &[&cs], &[&h2]));

    sc.ok("exams.create", exam("Surveying", "14:00", "15:00", &[&civil], &[&h1]));
    let dept = sc.err("exams.create", exam("Geology", "14:00", "15:00", &[&civil], &[&h1, &h2]));
    assert_eq!(dept["code"], "conflict");
    assert_eq!(dept["details"]["kind"], "departmentConflict");
    assert_eq!(dept["details"]["existingExam"], "Surveying");
    assert_eq!(dept["details"]["departments"], json!(["Civil"]));
    assert_eq!(dept["details"]["halls"], json!(["Hall 1"]));

    let list = sc.ok("exams.list", json!({ "today": "2031-01-01" }));
    assert_eq!(list["stats"]["total"], 3);
    assert_eq!(list["stats"]["upcoming"], 3);
    let later = sc.ok("exams.list", json!({ "today": "2031-12-31" }));
    assert_eq!(later["stats"]["completed"], 3);
    let civil_only = sc.ok("exams.list", json!({ "departmentId": civil, "today": "2031-01-01" }));
    assert_eq!(civil_only["exams"].as_array().map(Vec::len), Some(1));
    assert_eq!(civil_only["exams"][0]["name"], "Surveying");
    assert_eq!(civil_only["stats"]["total"], 3);
    assert_eq!(civil_only["stats"]["upcoming"], 3);

    sc.close();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn rerun_interleave_regenerate_and_update() {
    let workspace = temp_dir("examhall-rerun");
    let mut sc = Sidecar::admin(&workspace);
    let cs = sc.department("CS");
    let me = sc.department("ME");
    let row = sc.hall("Row Hall", 1, 4);
    let big = sc.hall("Big Hall", 3, 3);
    sc.students(&cs, "24CSE", 2);
    sc.students(&me, "24MEC", 2);

    let created = sc.ok("exams.create", exam("Mixed", "09:00", "11:00", &[&cs, &me], &[&row]));
    let exam_id = str_at(&created, "/examId");
    assert_eq!(created["allocation"]["constraintApplied"], true);

    let inter = sc.ok(
        "allocation.run",
        json!({ "examId": exam_id, "strategy": "interleave", "hallIds": [row] }),
    );
    assert_eq!(inter["placed"], 4);
    assert_eq!(inter["constraintApplied"], false);
    let plan = sc.ok("seating.hallPlan", json!({ "examId": exam_id, "hallId": row }));
    assert_eq!(plan["violations"], 0);

    let bad = sc.err("allocation.run", json!({ "examId": exam_id, "strategy": "random" }));
    assert_eq!(bad["code"], "bad_params");
    let none = sc.err("allocation.run", json!({ "examId": "missing" }));
    assert_eq!(none["code"], "not_found");

    let sep = sc.ok("allocation.run", json!({ "examId": exam_id, "strategy": "separated" }));
    assert_eq!(sep["constraintApplied"], true);

    let regen = sc.ok("allocation.regenerate", json!({ "all": true }));
    let results = regen["results"].as_array().expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["ok"], true);

    // Moving the exam to a bigger hall re-seats it there.
    let upd = sc.ok("exams.update", json!({ "examId": exam_id, "hallIds": [big] }));
    assert_eq!(upd["allocation"]["placed"], 4);
    assert_eq!(upd["allocation"]["emptySeats"], 5);
    let halls = sc.ok("seating.examHalls", json!({ "examId": exam_id }));
    assert_eq!(halls["halls"][0]["name"], "Big Hall");
    let old = sc.err("seating.hallPlan", json!({ "examId": exam_id, "hallId": row }));
    assert_eq!(old["code"], "not_found");

    sc.ok("exams.delete", json!({ "examId": exam_id }));
    let gone = sc.err("exams.get", json!({ "examId": exam_id }));
    assert_eq!(gone["code"], "not_found");

    sc.close();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn shared_department_is_seated_once_per_slot() {
    let workspace = temp_dir("examhall-shared-dept");
    let mut sc = Sidecar::admin(&workspace);
    let cs = sc.department("CS");
    let me = sc.department("ME");
    let h1 = sc.hall("Hall 1", 2, 2);
    let h2 = sc.hall("Hall 2", 2, 2);

    // Both exams list CS; the earlier one owns it for the slot.
    let maths = str_at(&sc.ok("exams.create", exam("Maths", "09:00", "12:00", &[&cs], &[&h1])), "/examId");
    let physics = str_at(
        &sc.ok("exams.create", exam("Physics", "09:00", "12:00", &[&cs, &me], &[&h2])),
        "/examId",
    );
    sc.students(&cs, "24CSE", 2);
    sc.students(&me, "24MEC", 2);

    let inter = sc.ok(
        "allocation.run",
        json!({ "examId": physics, "strategy": "interleave", "hallIds": [h2] }),
    );
    assert_eq!(inter["placed"], 2);
    let plan = sc.ok("seating.hallPlan", json!({ "examId": physics, "hallId": h2 }));
    assert_eq!(plan["allocated"], 2);
    for seat in plan["seats"].as_array().expect("seats") {
        if seat["occupied"] == true {
            assert!(seat["rollNo"].as_str().expect("roll").starts_with("24MEC"), "{}", seat);
        }
    }

    let slot = sc.ok("allocation.run", json!({ "examId": maths }));
    assert_eq!(slot["placed"], 4);
    let again = sc.ok(
        "allocation.run",
        json!({ "examId": maths, "strategy": "interleave", "hallIds": [h1] }),
    );
    assert_eq!(again["placed"], 2);
    let physics_exam = sc.ok("exams.get", json!({ "examId": physics }));
    assert_eq!(physics_exam["exam"]["allocatedCount"], 2);
    let maths_exam = sc.ok("exams.get", json!({ "examId": maths }));
    assert_eq!(maths_exam["exam"]["allocatedCount"], 2);

    sc.close();
    let _ = std::fs::remove_dir_all(workspace);
}
