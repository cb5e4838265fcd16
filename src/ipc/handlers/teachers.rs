use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::ipc::handlers::auth::{create_user, update_user};
use crate::ipc::handlers::departments::department_exists;
use crate::ipc::handlers::setup::check_password;
use crate::ipc::handlers::students::{
    department_lookup, department_stats, exists, import_failed, load_import_table,
};
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_str, get_required_text, is_unique_violation, run_as,
    HandlerErr, HandlerFn,
};
use crate::ipc::types::{AppState, Request};

const TEACHER_COLUMNS: [&str; 5] = ["employee_id", "username", "password", "department", "subject"];

fn employee_taken(employee_id: &str) -> HandlerErr {
    HandlerErr::conflict(format!("employee id '{}' already exists", employee_id))
        .with_details(json!({ "field": "employeeId", "value": employee_id }))
}

fn teachers_list(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let filter = get_optional_str(params, "departmentId");
    let mut stmt = conn.prepare(
        "SELECT t.id, t.employee_id, u.username, t.department_id, d.name, t.subject
         FROM teachers t
         JOIN users u ON u.id = t.user_id
         LEFT JOIN departments d ON d.id = t.department_id
         WHERE (?1 IS NULL OR t.department_id = ?1)
         ORDER BY d.name IS NULL, d.name, u.username",
    )?;
    let teachers = stmt
        .query_map([&filter], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "employeeId": r.get::<_, String>(1)?,
                "username": r.get::<_, String>(2)?,
                "departmentId": r.get::<_, Option<String>>(3)?,
                "departmentName": r.get::<_, Option<String>>(4)?,
                "subject": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "teachers": teachers,
        "departmentStats": department_stats(conn, "teachers")?,
    }))
}

fn insert_teacher(
    conn: &Connection,
    employee_id: &str,
    username: &str,
    password: &str,
    department_id: &str,
    subject: &str,
) -> Result<String, HandlerErr> {
    let user_id = create_user(conn, username, password, Role::Teacher)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, user_id, employee_id, department_id, subject)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &user_id, employee_id, department_id, subject),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            employee_taken(employee_id)
        } else {
            HandlerErr::new("db_insert_failed", e.to_string())
        }
    })?;
    Ok(id)
}

fn teachers_create(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let employee_id = get_required_text(params, "employeeId")?;
    let username = get_required_text(params, "username")?;
    let password = get_required_str(params, "password")?;
    let subject = get_required_text(params, "subject")?;
    let department_id = get_required_str(params, "departmentId")?;
    if !department_exists(conn, &department_id)? {
        return Err(HandlerErr::bad_params("unknown department"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let id = insert_teacher(&tx, &employee_id, &username, &password, &department_id, &subject)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "teacherId": id }))
}

fn teachers_update(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM teachers WHERE id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::not_found("teacher not found"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    if let Some(employee_id) = get_optional_str(params, "employeeId") {
        tx.execute(
            "UPDATE teachers SET employee_id = ? WHERE id = ?",
            (&employee_id, &teacher_id),
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                employee_taken(&employee_id)
            } else {
                HandlerErr::new("db_update_failed", e.to_string())
            }
        })?;
    }
    if let Some(subject) = get_optional_str(params, "subject") {
        tx.execute(
            "UPDATE teachers SET subject = ? WHERE id = ?",
            (&subject, &teacher_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    if params.get("departmentId").is_some() {
        let department_id = get_required_str(params, "departmentId")?;
        if !department_exists(&tx, &department_id)? {
            return Err(HandlerErr::bad_params("unknown department"));
        }
        tx.execute(
            "UPDATE teachers SET department_id = ? WHERE id = ?",
            (&department_id, &teacher_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
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

fn teachers_delete(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM teachers WHERE id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::not_found("teacher not found"));
    };
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let del = db_err("db_delete_failed");
    tx.execute(
        "DELETE FROM invigilation_assignments WHERE teacher_id = ?",
        [&teacher_id],
    )
    .map_err(&del)?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(&del)?;
    tx.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(&del)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn teachers_import(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let table = load_import_table(params, &TEACHER_COLUMNS)?;
    let departments = department_lookup(conn)?;

    let mut errors = Vec::new();
    let mut ready: Vec<[String; 5]> = Vec::new();
    let mut seen_employees = HashSet::new();
    let mut seen_users = HashSet::new();
    for rec in table.records() {
        let line = rec.line;
        let fields = TEACHER_COLUMNS.map(|c| rec.get(c).to_string());
        let [employee_id, username, password, department, subject] = &fields;
        if fields.iter().any(String::is_empty) {
            errors.push(format!("Row {}: missing required data", line));
            continue;
        }
        let Some(department_id) = departments.get(&department.to_lowercase()) else {
            errors.push(format!("Row {}: department '{}' does not exist", line, department));
            continue;
        };
        if !seen_employees.insert(employee_id.clone())
            || exists(conn, "SELECT 1 FROM teachers WHERE employee_id = ?", employee_id)?
        {
            errors.push(format!("Row {}: employee id '{}' already exists", line, employee_id));
            continue;
        }
        if !seen_users.insert(username.clone())
            || exists(conn, "SELECT 1 FROM users WHERE username = ?", username)?
        {
            errors.push(format!("Row {}: username '{}' already exists", line, username));
            continue;
        }
        if let Err(e) = check_password(conn, password) {
            errors.push(format!("Row {}: {}", line, e.message));
            continue;
        }
        ready.push([
            employee_id.clone(),
            username.clone(),
            password.clone(),
            department_id.clone(),
            subject.clone(),
        ]);
    }
    if !errors.is_empty() {
        return Err(import_failed(errors));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    for [employee_id, username, password, department_id, subject] in &ready {
        insert_teacher(&tx, employee_id, username, password, department_id, subject)?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    tracing::info!(created = ready.len(), "teachers imported");
    Ok(json!({ "created": ready.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: HandlerFn = match req.method.as_str() {
        "teachers.list" => teachers_list,
        "teachers.create" => teachers_create,
        "teachers.update" => teachers_update,
        "teachers.delete" => teachers_delete,
        "teachers.import" => teachers_import,
        _ => return None,
    };
    Some(run_as(state, req, &[Role::Admin], f))
}
