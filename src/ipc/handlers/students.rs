use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::import::{self, ImportError, Table};
use crate::ipc::handlers::auth::{create_user, update_user};
use crate::ipc::handlers::departments::department_exists;
use crate::ipc::handlers::setup::check_password;
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_str, get_required_text, get_str_list,
    is_unique_violation, placeholders, run_as, HandlerErr, HandlerFn,
};
use crate::ipc::types::{AppState, Request};

const STUDENT_COLUMNS: [&str; 4] = ["roll_no", "username", "password", "department"];

fn roll_taken(roll_no: &str) -> HandlerErr {
    HandlerErr::conflict(format!("roll number '{}' already exists", roll_no))
        .with_details(json!({ "field": "rollNo", "value": roll_no }))
}

fn required_department(conn: &Connection, params: &Value) -> Result<String, HandlerErr> {
    let department_id = get_required_str(params, "departmentId")?;
    if !department_exists(conn, &department_id)? {
        return Err(HandlerErr::bad_params("unknown department"));
    }
    Ok(department_id)
}

/// Per-department counts for the list views, largest first.
pub(super) fn department_stats(conn: &Connection, table: &str) -> Result<Value, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "SELECT d.id, d.name, COUNT(x.id) AS n
         FROM departments d
         LEFT JOIN {} x ON x.department_id = d.id
         GROUP BY d.id, d.name
         ORDER BY n DESC, d.name",
        table
    ))?;
    let stats = stmt
        .query_map([], |r| {
            Ok(json!({
                "departmentId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "count": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(stats))
}

fn students_list(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let filter = get_optional_str(params, "departmentId");
    let mut stmt = conn.prepare(
        "SELECT s.id, s.roll_no, u.username, s.department_id, d.name
         FROM students s
         JOIN users u ON u.id = s.user_id
         LEFT JOIN departments d ON d.id = s.department_id
         WHERE (?1 IS NULL OR s.department_id = ?1)
         ORDER BY d.name IS NULL, d.name, s.roll_no",
    )?;
    let students = stmt
        .query_map([&filter], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "rollNo": r.get::<_, String>(1)?,
                "username": r.get::<_, String>(2)?,
                "departmentId": r.get::<_, Option<String>>(3)?,
                "departmentName": r.get::<_, Option<String>>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "students": students,
        "departmentStats": department_stats(conn, "students")?,
    }))
}

fn insert_student(
    conn: &Connection,
    roll_no: &str,
    username: &str,
    password: &str,
    department_id: &str,
) -> Result<String, HandlerErr> {
    let user_id = create_user(conn, username, password, Role::Student)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, user_id, roll_no, department_id) VALUES(?, ?, ?, ?)",
        (&id, &user_id, roll_no, department_id),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            roll_taken(roll_no)
        } else {
            HandlerErr::new("db_insert_failed", e.to_string())
        }
    })?;
    Ok(id)
}

fn students_create(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let roll_no = get_required_text(params, "rollNo")?;
    let username = get_required_text(params, "username")?;
    let password = get_required_str(params, "password")?;
    let department_id = required_department(conn, params)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let id = insert_student(&tx, &roll_no, &username, &password, &department_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "studentId": id }))
}

fn students_update(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    if let Some(roll_no) = get_optional_str(params, "rollNo") {
        tx.execute(
            "UPDATE students SET roll_no = ? WHERE id = ?",
            (&roll_no, &student_id),
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                roll_taken(&roll_no)
            } else {
                HandlerErr::new("db_update_failed", e.to_string())
            }
        })?;
    }
    if params.get("departmentId").is_some() {
        let department_id = required_department(&tx, params)?;
        tx.execute(
            "UPDATE students SET department_id = ? WHERE id = ?",
            (&department_id, &student_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    // A blank password leaves the current one in place.
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|p| !p.is_empty());
    update_user(
        &tx,
        &user_id,
        get_optional_str(params, "username").as_deref(),
        password,
    )?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::not_found("student not found"));
    };
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let del = db_err("db_delete_failed");
    tx.execute(
        "DELETE FROM attendance_records WHERE student_id = ?",
        [&student_id],
    )
    .map_err(&del)?;
    tx.execute(
        "DELETE FROM seating_allocations WHERE student_id = ?",
        [&student_id],
    )
    .map_err(&del)?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(&del)?;
    tx.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(&del)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn students_count(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let ids = get_str_list(params, "departmentIds")?;
    if ids.is_empty() {
        return Ok(json!({ "totalStudents": 0 }));
    }
    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM students WHERE department_id IN ({})",
            placeholders(ids.len())
        ),
        params_from_iter(ids.iter()),
        |r| r.get(0),
    )?;
    Ok(json!({ "totalStudents": total }))
}

/// Opens `params.inPath` and checks that `required` columns are present.
pub(super) fn load_import_table(params: &Value, required: &[&str]) -> Result<Table, HandlerErr> {
    let in_path = get_required_text(params, "inPath")?;
    let table = import::read_table(&PathBuf::from(&in_path)).map_err(|e| match e {
        ImportError::UnsupportedFormat(_) => HandlerErr::bad_params(
            "unsupported file format; upload a .csv, .xlsx or .xls file",
        ),
        ImportError::Io(io) => HandlerErr::new("io_failed", io.to_string())
            .with_details(json!({ "path": in_path })),
        other => HandlerErr::new("import_failed", other.to_string()),
    })?;
    table.require(required).map_err(|e| match e {
        ImportError::MissingColumns(cols) => {
            HandlerErr::new("import_failed", format!("missing required columns: {}", cols.join(", ")))
                .with_details(json!({ "missingColumns": cols }))
        }
        other => HandlerErr::new("import_failed", other.to_string()),
    })?;
    Ok(table)
}

/// Lower-cased department name to id.
pub(super) fn department_lookup(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn.prepare("SELECT id, name FROM departments")?;
    let pairs = stmt
        .query_map([], |r| Ok((r.get::<_, String>(1)?.to_lowercase(), r.get::<_, String>(0)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(pairs)
}

pub(super) fn exists(conn: &Connection, sql: &str, value: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(sql, [value], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub(super) fn import_failed(errors: Vec<String>) -> HandlerErr {
    HandlerErr::new(
        "import_failed",
        format!("import rejected: {} row error(s)", errors.len()),
    )
    .with_details(json!({ "errors": errors }))
}

struct StudentRow {
    roll_no: String,
    username: String,
    password: String,
    department_id: String,
}

fn students_import(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let table = load_import_table(params, &STUDENT_COLUMNS)?;
    let departments = department_lookup(conn)?;

    let mut errors = Vec::new();
    let mut ready = Vec::new();
    let mut seen_rolls = HashSet::new();
    let mut seen_users = HashSet::new();
    for rec in table.records() {
        let line = rec.line;
        let (roll_no, username, password, department) = (
            rec.get("roll_no"),
            rec.get("username"),
            rec.get("password"),
            rec.get("department"),
        );
        if roll_no.is_empty() || username.is_empty() || password.is_empty() || department.is_empty()
        {
            errors.push(format!("Row {}: missing required data", line));
            continue;
        }
        let Some(department_id) = departments.get(&department.to_lowercase()) else {
            errors.push(format!("Row {}: department '{}' does not exist", line, department));
            continue;
        };
        if !seen_rolls.insert(roll_no.to_string())
            || exists(conn, "SELECT 1 FROM students WHERE roll_no = ?", roll_no)?
        {
            errors.push(format!("Row {}: roll number '{}' already exists", line, roll_no));
            continue;
        }
        if !seen_users.insert(username.to_string())
            || exists(conn, "SELECT 1 FROM users WHERE username = ?", username)?
        {
            errors.push(format!("Row {}: username '{}' already exists", line, username));
            continue;
        }
        if let Err(e) = check_password(conn, password) {
            errors.push(format!("Row {}: {}", line, e.message));
            continue;
        }
        ready.push(StudentRow {
            roll_no: roll_no.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            department_id: department_id.clone(),
        });
    }
    if !errors.is_empty() {
        return Err(import_failed(errors));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    for row in &ready {
        insert_student(&tx, &row.roll_no, &row.username, &row.password, &row.department_id)?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    tracing::info!(created = ready.len(), "students imported");
    Ok(json!({ "created": ready.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: HandlerFn = match req.method.as_str() {
        "students.list" => students_list,
        "students.create" => students_create,
        "students.update" => students_update,
        "students.delete" => students_delete,
        "students.count" => students_count,
        "students.import" => students_import,
        _ => return None,
    };
    Some(run_as(state, req, &[Role::Admin], f))
}
