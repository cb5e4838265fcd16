use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::ipc::helpers::{
    db_err, get_required_str, get_required_text, is_unique_violation, run_as, HandlerErr, HandlerFn,
};
use crate::ipc::types::{AppState, Request};

fn name_taken(name: &str) -> HandlerErr {
    HandlerErr::conflict(format!("department '{}' already exists", name))
        .with_details(json!({ "field": "name", "value": name }))
}

pub fn department_exists(conn: &Connection, department_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM departments WHERE id = ?",
            [department_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

fn departments_list(conn: &Connection, _s: &Session, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.name,
                (SELECT COUNT(*) FROM students s WHERE s.department_id = d.id),
                (SELECT COUNT(*) FROM teachers t WHERE t.department_id = d.id)
         FROM departments d
         ORDER BY d.name",
    )?;
    let departments = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "studentCount": r.get::<_, i64>(2)?,
                "teacherCount": r.get::<_, i64>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "departments": departments }))
}

fn departments_create(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_text(params, "name")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO departments(id, name) VALUES(?, ?)",
        (&id, &name),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            name_taken(&name)
        } else {
            HandlerErr::new("db_insert_failed", e.to_string())
        }
    })?;
    Ok(json!({ "departmentId": id }))
}

fn departments_update(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let department_id = get_required_str(params, "departmentId")?;
    let name = get_required_text(params, "name")?;
    let changed = conn
        .execute(
            "UPDATE departments SET name = ? WHERE id = ?",
            (&name, &department_id),
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                name_taken(&name)
            } else {
                HandlerErr::new("db_update_failed", e.to_string())
            }
        })?;
    if changed == 0 {
        return Err(HandlerErr::not_found("department not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Students and teachers stay, without a department; exam links go.
fn departments_delete(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let department_id = get_required_str(params, "departmentId")?;
    if !department_exists(conn, &department_id)? {
        return Err(HandlerErr::not_found("department not found"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let del = db_err("db_delete_failed");
    tx.execute(
        "UPDATE students SET department_id = NULL WHERE department_id = ?",
        [&department_id],
    )
    .map_err(db_err("db_update_failed"))?;
    tx.execute(
        "UPDATE teachers SET department_id = NULL WHERE department_id = ?",
        [&department_id],
    )
    .map_err(db_err("db_update_failed"))?;
    tx.execute(
        "DELETE FROM exam_departments WHERE department_id = ?",
        [&department_id],
    )
    .map_err(&del)?;
    tx.execute("DELETE FROM departments WHERE id = ?", [&department_id])
        .map_err(&del)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: HandlerFn = match req.method.as_str() {
        "departments.list" => departments_list,
        "departments.create" => departments_create,
        "departments.update" => departments_update,
        "departments.delete" => departments_delete,
        _ => return None,
    };
    Some(run_as(state, req, &[Role::Admin], f))
}
