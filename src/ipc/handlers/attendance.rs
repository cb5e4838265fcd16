use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::ipc::handlers::setup::attendance_settings;
use crate::ipc::helpers::{
    date_or_today, db_err, get_required_str, get_required_text, placeholders, run_as, HandlerErr,
    HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use crate::slots::{self, ExamRow};

const EXPORT_HEADER: &str = "Roll No,Student Name,Status,Exam Date,Date Marked";

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn status_label(code: &str) -> &'static str {
    if code == "P" {
        "Present"
    } else {
        "Absent"
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Teachers need an assignment for the hall in this exam's slot; admins
/// can read always and write when the attendance settings allow it.
fn authorize(
    conn: &Connection,
    session: &Session,
    exam: &ExamRow,
    hall_id: &str,
    access: Access,
) -> Result<(), HandlerErr> {
    match session.role {
        Role::Admin => {
            if access == Access::Write && !attendance_settings(conn)?.allow_admin_marking {
                return Err(HandlerErr::new(
                    "forbidden",
                    "admin attendance marking is disabled",
                ));
            }
            Ok(())
        }
        Role::Teacher => {
            let teacher_id = session.profile_id.clone().unwrap_or_default();
            let slot_ids = slots::slot_exam_ids_for(conn, exam)?;
            let mut args: Vec<&str> = slot_ids.iter().map(String::as_str).collect();
            args.push(hall_id);
            args.push(&teacher_id);
            let n: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM invigilation_assignments
                     WHERE exam_id IN ({}) AND hall_id = ? AND teacher_id = ?",
                    placeholders(slot_ids.len())
                ),
                params_from_iter(args),
                |r| r.get(0),
            )?;
            if n == 0 {
                return Err(HandlerErr::new(
                    "forbidden",
                    "you are not assigned to this hall",
                ));
            }
            Ok(())
        }
        Role::Student => Err(HandlerErr::new("forbidden", "students cannot take attendance")),
    }
}

struct Target {
    exam: ExamRow,
    hall_id: String,
    hall_name: String,
}

fn load_target(
    conn: &Connection,
    session: &Session,
    params: &Value,
    access: Access,
) -> Result<Target, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let hall_id = get_required_str(params, "hallId")?;
    let Some(exam) = slots::load_exam(conn, &exam_id)? else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    let Some(hall) = slots::exam_halls(conn, &exam.id)?
        .into_iter()
        .find(|h| h.id == hall_id)
    else {
        return Err(HandlerErr::not_found("hall is not used by this exam"));
    };
    authorize(conn, session, &exam, &hall.id, access)?;
    Ok(Target {
        exam,
        hall_id: hall.id,
        hall_name: hall.name,
    })
}

/// `(student_id, roll_no, name, seat_no)` for an exam and hall, by roll number.
fn allocated_students(
    conn: &Connection,
    exam_id: &str,
    hall_id: &str,
) -> Result<Vec<(String, String, String, u32)>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.roll_no, u.username, sa.seat_no
         FROM seating_allocations sa
         JOIN students s ON s.id = sa.student_id
         JOIN users u ON u.id = s.user_id
         WHERE sa.exam_id = ? AND sa.hall_id = ?
         ORDER BY s.roll_no",
    )?;
    let rows = stmt
        .query_map((exam_id, hall_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn attendance_sheet(conn: &Connection, session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let target = load_target(conn, session, params, Access::Read)?;
    let date = date_or_today(params, "date")?;
    let students = allocated_students(conn, &target.exam.id, &target.hall_id)?;
    if students.is_empty() {
        return Err(HandlerErr::not_found("no students are allocated to this hall"));
    }

    let mut stmt = conn.prepare(
        "SELECT student_id, status FROM attendance_records
         WHERE exam_id = ? AND hall_id = ? AND date_marked = ?",
    )?;
    let marked: HashMap<String, String> = stmt
        .query_map((&target.exam.id, &target.hall_id, &date), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })?
        .collect::<Result<_, _>>()?;
    let default_status = attendance_settings(conn)?.default_status;

    let rows: Vec<Value> = students
        .iter()
        .map(|(id, roll_no, name, seat_no)| {
            json!({
                "studentId": id,
                "rollNo": roll_no,
                "studentName": name,
                "seatLabel": slots::seat_label(*seat_no),
                "status": marked.get(id).unwrap_or(&default_status),
                "marked": marked.contains_key(id),
            })
        })
        .collect();
    Ok(json!({
        "exam": { "id": target.exam.id, "name": target.exam.name, "date": target.exam.date },
        "hall": { "id": target.hall_id, "name": target.hall_name },
        "date": date,
        "alreadyMarked": !marked.is_empty(),
        "students": rows,
    }))
}

fn attendance_mark(conn: &Connection, session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let target = load_target(conn, session, params, Access::Write)?;
    let date = date_or_today(params, "date")?;
    let Some(records) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("records must be an array"));
    };
    let allocated: HashSet<String> = allocated_students(conn, &target.exam.id, &target.hall_id)?
        .into_iter()
        .map(|(id, ..)| id)
        .collect();

    let mut parsed = Vec::with_capacity(records.len());
    let mut seen = HashSet::new();
    for (i, rec) in records.iter().enumerate() {
        let student_id = get_required_text(rec, "studentId")
            .map_err(|e| HandlerErr::bad_params(format!("records[{}]: {}", i, e.message)))?;
        let status = rec
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| s == "P" || s == "A")
            .ok_or_else(|| HandlerErr::bad_params(format!("records[{}]: status must be P or A", i)))?;
        if !allocated.contains(&student_id) {
            return Err(HandlerErr::bad_params(format!(
                "records[{}]: student is not allocated to this exam and hall",
                i
            ))
            .with_details(json!({ "studentId": student_id })));
        }
        if !seen.insert(student_id.clone()) {
            return Err(HandlerErr::bad_params(format!(
                "records[{}]: duplicate student",
                i
            )));
        }
        parsed.push((student_id, status));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE exam_id = ? AND hall_id = ? AND date_marked = ?",
        (&target.exam.id, &target.hall_id, &date),
    )
    .map_err(db_err("db_delete_failed"))?;
    for (student_id, status) in &parsed {
        // A student moved between halls may still hold a record for this day elsewhere.
        tx.execute(
            "INSERT INTO attendance_records(id, exam_id, hall_id, student_id, date_marked, status)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(exam_id, student_id, date_marked) DO UPDATE SET
                 hall_id = excluded.hall_id,
                 status = excluded.status",
            (
                Uuid::new_v4().to_string(),
                &target.exam.id,
                &target.hall_id,
                student_id,
                &date,
                status,
            ),
        )
        .map_err(db_err("db_insert_failed"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    tracing::info!(exam = %target.exam.name, hall = %target.hall_name, saved = parsed.len(), "attendance marked");
    Ok(json!({ "saved": parsed.len(), "date": date }))
}

fn attendance_export(conn: &Connection, session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let target = load_target(conn, session, params, Access::Read)?;
    let out_path = get_required_text(params, "outPath")?;

    let mut stmt = conn.prepare(
        "SELECT s.roll_no, u.username, ar.status, ar.date_marked
         FROM attendance_records ar
         JOIN students s ON s.id = ar.student_id
         JOIN users u ON u.id = s.user_id
         WHERE ar.exam_id = ? AND ar.hall_id = ?
         ORDER BY ar.date_marked, s.roll_no",
    )?;
    let rows = stmt
        .query_map((&target.exam.id, &target.hall_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Err(HandlerErr::not_found("no attendance records for this exam and hall"));
    }

    let mut csv = String::new();
    csv.push_str(EXPORT_HEADER);
    csv.push('\n');
    for (roll_no, name, status, date_marked) in &rows {
        let line = [
            csv_quote(roll_no),
            csv_quote(name),
            status_label(status).to_string(),
            csv_quote(&target.exam.date),
            csv_quote(date_marked),
        ]
        .join(",");
        csv.push_str(&line);
        csv.push('\n');
    }

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": out_path }))
        })?;
    }
    std::fs::write(&out, csv).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": out_path }))
    })?;

    let suggested = format!("Attendance_{}_{}.csv", target.exam.name, target.hall_name).replace(' ', "_");
    Ok(json!({
        "rowsExported": rows.len(),
        "path": out_path,
        "suggestedFileName": suggested,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: HandlerFn = match req.method.as_str() {
        "attendance.sheet" => attendance_sheet,
        "attendance.mark" => attendance_mark,
        "attendance.export" => attendance_export,
        _ => return None,
    };
    Some(run_as(state, req, &[Role::Admin, Role::Teacher], f))
}
