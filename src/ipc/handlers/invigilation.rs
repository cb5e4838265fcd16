use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::ipc::helpers::{db_err, get_required_str, run_as, HandlerErr, HandlerFn};
use crate::ipc::types::{AppState, Request};
use crate::slots;

fn next_seq(conn: &Connection) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(created_seq), 0) + 1 FROM invigilation_assignments",
        [],
        |r| r.get(0),
    )?)
}

/// Creates or replaces the assignment; a replaced one becomes the newest.
fn upsert(conn: &Connection, exam_id: &str, hall_id: &str, teacher_id: &str) -> Result<String, HandlerErr> {
    let seq = next_seq(conn)?;
    conn.execute(
        "INSERT INTO invigilation_assignments(id, exam_id, hall_id, teacher_id, created_seq)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(exam_id, hall_id) DO UPDATE SET
             teacher_id = excluded.teacher_id,
             created_seq = excluded.created_seq",
        (Uuid::new_v4().to_string(), exam_id, hall_id, teacher_id, seq),
    )
    .map_err(db_err("db_insert_failed"))?;
    Ok(conn.query_row(
        "SELECT id FROM invigilation_assignments WHERE exam_id = ? AND hall_id = ?",
        (exam_id, hall_id),
        |r| r.get(0),
    )?)
}

fn invigilation_assign(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let hall_id = get_required_str(params, "hallId")?;
    let teacher_id = get_required_str(params, "teacherId")?;

    let Some(exam) = slots::load_exam(conn, &exam_id)? else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    let teacher: Option<String> = conn
        .query_row("SELECT id FROM teachers WHERE id = ?", [&teacher_id], |r| r.get(0))
        .optional()?;
    if teacher.is_none() {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    if !slots::exam_halls(conn, &exam.id)?.iter().any(|h| h.id == hall_id) {
        return Err(HandlerErr::bad_params("hall is not used by this exam"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let assignment_id = upsert(&tx, &exam.id, &hall_id, &teacher_id)?;

    let mut propagated = 0;
    for other in slots::slot_exams(&tx, &exam.date, &exam.start_time)? {
        if other.id == exam.id {
            continue;
        }
        if !slots::exam_halls(&tx, &other.id)?.iter().any(|h| h.id == hall_id) {
            continue;
        }
        let assigned: Option<String> = tx
            .query_row(
                "SELECT id FROM invigilation_assignments WHERE exam_id = ? AND hall_id = ?",
                (&other.id, &hall_id),
                |r| r.get(0),
            )
            .optional()?;
        if assigned.is_none() {
            upsert(&tx, &other.id, &hall_id, &teacher_id)?;
            propagated += 1;
        }
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "assignmentId": assignment_id, "propagatedCount": propagated }))
}

fn invigilation_list(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let mut stmt = conn.prepare(
        "SELECT ia.id, h.id, h.name, t.id, u.username, t.subject
         FROM invigilation_assignments ia
         JOIN halls h ON h.id = ia.hall_id
         JOIN teachers t ON t.id = ia.teacher_id
         JOIN users u ON u.id = t.user_id
         WHERE ia.exam_id = ?
         ORDER BY h.name",
    )?;
    let assignments = stmt
        .query_map([&exam_id], |r| {
            Ok(json!({
                "assignmentId": r.get::<_, String>(0)?,
                "hallId": r.get::<_, String>(1)?,
                "hallName": r.get::<_, String>(2)?,
                "teacherId": r.get::<_, String>(3)?,
                "teacherName": r.get::<_, String>(4)?,
                "subject": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "assignments": assignments }))
}

fn invigilation_delete(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let removed = conn
        .execute(
            "DELETE FROM invigilation_assignments WHERE id = ?",
            [&assignment_id],
        )
        .map_err(db_err("db_delete_failed"))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("assignment not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: HandlerFn = match req.method.as_str() {
        "invigilation.assign" => invigilation_assign,
        "invigilation.list" => invigilation_list,
        "invigilation.delete" => invigilation_delete,
        _ => return None,
    };
    Some(run_as(state, req, &[Role::Admin], f))
}
