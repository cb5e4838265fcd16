use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_str, get_required_text, get_required_u32,
    is_unique_violation, run_as, HandlerErr, HandlerFn,
};
use crate::ipc::types::{AppState, Request};

fn name_taken(name: &str) -> HandlerErr {
    HandlerErr::conflict(format!("hall '{}' already exists", name))
        .with_details(json!({ "field": "name", "value": name }))
}

/// Upper bound on either side of a hall grid.
const MAX_DIMENSION: u32 = 1000;

fn dimension(params: &Value, key: &str) -> Result<u32, HandlerErr> {
    let n = get_required_u32(params, key)?;
    if !(1..=MAX_DIMENSION).contains(&n) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be between 1 and {}",
            key, MAX_DIMENSION
        ))
        .with_details(json!({ "field": key, "max": MAX_DIMENSION })));
    }
    Ok(n)
}

fn capacity(rows: u32, columns: u32) -> u64 {
    u64::from(rows) * u64::from(columns)
}

fn halls_list(conn: &Connection, _s: &Session, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT id, name, row_count, column_count FROM halls ORDER BY name")?;
    let halls = stmt
        .query_map([], |r| {
            let rows: u32 = r.get(2)?;
            let columns: u32 = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "rows": rows,
                "columns": columns,
                "capacity": capacity(rows, columns),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "halls": halls }))
}

fn halls_create(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_text(params, "name")?;
    let rows = dimension(params, "rows")?;
    let columns = dimension(params, "columns")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO halls(id, name, row_count, column_count) VALUES(?, ?, ?, ?)",
        (&id, &name, rows, columns),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            name_taken(&name)
        } else {
            HandlerErr::new("db_insert_failed", e.to_string())
        }
    })?;
    Ok(json!({ "hallId": id, "capacity": capacity(rows, columns) }))
}

/// Changing a hall's shape does not re-seat existing allocations; run
/// `allocation.run` afterwards.
fn halls_update(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let hall_id = get_required_str(params, "hallId")?;
    let current: Option<(String, u32, u32)> = conn
        .query_row(
            "SELECT name, row_count, column_count FROM halls WHERE id = ?",
            [&hall_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((mut name, mut rows, mut columns)) = current else {
        return Err(HandlerErr::not_found("hall not found"));
    };
    if params.get("name").is_some() {
        name = get_optional_str(params, "name")
            .ok_or_else(|| HandlerErr::bad_params("name must not be empty"))?;
    }
    if params.get("rows").is_some() {
        rows = dimension(params, "rows")?;
    }
    if params.get("columns").is_some() {
        columns = dimension(params, "columns")?;
    }
    conn.execute(
        "UPDATE halls SET name = ?, row_count = ?, column_count = ? WHERE id = ?",
        (&name, rows, columns, &hall_id),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            name_taken(&name)
        } else {
            HandlerErr::new("db_update_failed", e.to_string())
        }
    })?;
    Ok(json!({ "ok": true, "capacity": capacity(rows, columns) }))
}

fn halls_delete(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let hall_id = get_required_str(params, "hallId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let del = db_err("db_delete_failed");
    for sql in [
        "DELETE FROM attendance_records WHERE hall_id = ?",
        "DELETE FROM seating_allocations WHERE hall_id = ?",
        "DELETE FROM invigilation_assignments WHERE hall_id = ?",
        "DELETE FROM exam_halls WHERE hall_id = ?",
    ] {
        tx.execute(sql, [&hall_id]).map_err(&del)?;
    }
    let removed = tx
        .execute("DELETE FROM halls WHERE id = ?", [&hall_id])
        .map_err(&del)?;
    if removed == 0 {
        return Err(HandlerErr::not_found("hall not found"));
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: HandlerFn = match req.method.as_str() {
        "halls.list" => halls_list,
        "halls.create" => halls_create,
        "halls.update" => halls_update,
        "halls.delete" => halls_delete,
        _ => return None,
    };
    Some(run_as(state, req, &[Role::Admin], f))
}
