use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::ipc::handlers::allocation::{outcome_json, slot_error};
use crate::ipc::helpers::{
    date_or_today, db_err, format_date, format_time, get_optional_str, get_required_str,
    get_str_list, parse_date, parse_time, placeholders, run_as, HandlerErr, HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use crate::slots::{self, ExamRow};

struct ExamInput {
    name: String,
    date: String,
    start_time: String,
    end_time: String,
    is_combined: bool,
    department_ids: Vec<String>,
    hall_ids: Vec<String>,
}

fn count_existing(conn: &Connection, table: &str, ids: &[String]) -> Result<usize, HandlerErr> {
    let n: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE id IN ({})",
            table,
            placeholders(ids.len())
        ),
        params_from_iter(ids.iter()),
        |r| r.get(0),
    )?;
    Ok(n as usize)
}

/// Reads exam fields from `params`, falling back to `current` for absent keys.
fn read_input(
    conn: &Connection,
    params: &Value,
    current: Option<(&ExamRow, Vec<String>, Vec<String>)>,
) -> Result<ExamInput, HandlerErr> {
    let text = |key: &str, fallback: Option<&str>| -> Result<String, HandlerErr> {
        match (params.get(key), fallback) {
            (None, Some(f)) => Ok(f.to_string()),
            _ => get_required_str(params, key),
        }
    };
    let (cur, cur_depts, cur_halls) = match current {
        Some((e, d, h)) => (Some(e), Some(d), Some(h)),
        None => (None, None, None),
    };

    let name = text("name", cur.map(|e| e.name.as_str()))?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let date = format_date(parse_date(&text("date", cur.map(|e| e.date.as_str()))?, "date")?);
    let start = parse_time(&text("startTime", cur.map(|e| e.start_time.as_str()))?, "startTime")?;
    let end = parse_time(&text("endTime", cur.map(|e| e.end_time.as_str()))?, "endTime")?;
    if end <= start {
        return Err(HandlerErr::bad_params("end time must be after start time"));
    }
    let is_combined = match params.get("isCombined") {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("isCombined must be boolean"))?,
        None => cur.map(|e| e.is_combined).unwrap_or(false),
    };
    let department_ids = match (params.get("departmentIds"), cur_depts) {
        (None, Some(d)) => d,
        _ => get_str_list(params, "departmentIds")?,
    };
    let hall_ids = match (params.get("hallIds"), cur_halls) {
        (None, Some(h)) => h,
        _ => get_str_list(params, "hallIds")?,
    };
    if department_ids.is_empty() {
        return Err(HandlerErr::bad_params("select at least one department"));
    }
    if hall_ids.is_empty() {
        return Err(HandlerErr::bad_params("select at least one hall"));
    }
    if count_existing(conn, "departments", &department_ids)? != department_ids.len() {
        return Err(HandlerErr::bad_params("unknown department in departmentIds"));
    }
    if count_existing(conn, "halls", &hall_ids)? != hall_ids.len() {
        return Err(HandlerErr::bad_params("unknown hall in hallIds"));
    }

    Ok(ExamInput {
        name,
        date,
        start_time: format_time(start),
        end_time: format_time(end),
        is_combined,
        department_ids,
        hall_ids,
    })
}

fn check_conflicts(
    conn: &Connection,
    input: &ExamInput,
    exclude: Option<&str>,
) -> Result<(), HandlerErr> {
    let overlaps = slots::student_overlaps(
        conn,
        &input.date,
        &input.start_time,
        &input.end_time,
        &input.department_ids,
        exclude,
    )?;
    if !overlaps.is_empty() {
        let details: Vec<Value> = overlaps
            .iter()
            .map(|o| json!({ "rollNo": o.roll_no, "name": o.name, "details": o.details }))
            .collect();
        return Err(HandlerErr::conflict(format!(
            "{} student(s) already have an overlapping exam",
            overlaps.len()
        ))
        .with_details(json!({ "kind": "studentOverlap", "students": details })));
    }

    let conflicts = slots::department_conflicts(
        conn,
        &input.name,
        &input.date,
        &input.start_time,
        &input.hall_ids,
        &input.department_ids,
        exclude,
    )?;
    if let Some(c) = conflicts.first() {
        return Err(HandlerErr::conflict(format!(
            "exam '{}' already seats {} in {} at this time",
            c.existing_exam,
            c.departments.join(", "),
            c.halls.join(", ")
        ))
        .with_details(json!({
            "kind": "departmentConflict",
            "existingExam": c.existing_exam,
            "departments": c.departments,
            "halls": c.halls,
        })));
    }
    Ok(())
}

fn write_links(conn: &Connection, exam_id: &str, input: &ExamInput) -> Result<(), HandlerErr> {
    let del = db_err("db_delete_failed");
    let ins = db_err("db_insert_failed");
    conn.execute("DELETE FROM exam_departments WHERE exam_id = ?", [exam_id])
        .map_err(&del)?;
    conn.execute("DELETE FROM exam_halls WHERE exam_id = ?", [exam_id])
        .map_err(&del)?;
    for d in &input.department_ids {
        conn.execute(
            "INSERT INTO exam_departments(exam_id, department_id) VALUES(?, ?)",
            (exam_id, d),
        )
        .map_err(&ins)?;
    }
    for h in &input.hall_ids {
        conn.execute(
            "INSERT INTO exam_halls(exam_id, hall_id) VALUES(?, ?)",
            (exam_id, h),
        )
        .map_err(&ins)?;
    }
    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM students WHERE department_id IN ({})",
            placeholders(input.department_ids.len())
        ),
        params_from_iter(input.department_ids.iter()),
        |r| r.get(0),
    )?;
    conn.execute(
        "UPDATE exams SET total_students = ? WHERE id = ?",
        (total, exam_id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(())
}

fn reallocate(conn: &Connection, exam_id: &str) -> Result<Value, HandlerErr> {
    let policy = slots::load_policy(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let outcome = slots::allocate_slot(conn, exam_id, &policy).map_err(slot_error)?;
    Ok(outcome_json(&outcome))
}

fn exams_create(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let input = read_input(conn, params, None)?;
    check_conflicts(conn, &input, None)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO exams(id, name, exam_date, start_time, end_time, is_combined)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &input.name,
            &input.date,
            &input.start_time,
            &input.end_time,
            input.is_combined as i64,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    write_links(&tx, &id, &input)?;
    let allocation = reallocate(&tx, &id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "examId": id, "allocation": allocation }))
}

fn exams_update(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let Some(current) = slots::load_exam(conn, &exam_id)? else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    let depts = slots::exam_department_ids(conn, &exam_id)?;
    let halls: Vec<String> = slots::exam_halls(conn, &exam_id)?
        .into_iter()
        .map(|h| h.id)
        .collect();
    let input = read_input(conn, params, Some((&current, depts, halls)))?;
    check_conflicts(conn, &input, Some(&exam_id))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE exams SET name = ?, exam_date = ?, start_time = ?, end_time = ?, is_combined = ?
         WHERE id = ?",
        (
            &input.name,
            &input.date,
            &input.start_time,
            &input.end_time,
            input.is_combined as i64,
            &exam_id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    write_links(&tx, &exam_id, &input)?;
    // Assignments must stay within the exam's halls.
    tx.execute(
        &format!(
            "DELETE FROM invigilation_assignments WHERE exam_id = ? AND hall_id NOT IN ({})",
            placeholders(input.hall_ids.len())
        ),
        params_from_iter(std::iter::once(&exam_id).chain(input.hall_ids.iter())),
    )
    .map_err(db_err("db_delete_failed"))?;
    let allocation = reallocate(&tx, &exam_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true, "allocation": allocation }))
}

fn exams_delete(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    if slots::load_exam(conn, &exam_id)?.is_none() {
        return Err(HandlerErr::not_found("exam not found"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let del = db_err("db_delete_failed");
    for sql in [
        "DELETE FROM attendance_records WHERE exam_id = ?",
        "DELETE FROM seating_allocations WHERE exam_id = ?",
        "DELETE FROM invigilation_assignments WHERE exam_id = ?",
        "DELETE FROM exam_halls WHERE exam_id = ?",
        "DELETE FROM exam_departments WHERE exam_id = ?",
        "DELETE FROM exams WHERE id = ?",
    ] {
        tx.execute(sql, [&exam_id]).map_err(&del)?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

/// One entry per hall of the exam: the earliest assignment for that hall
/// among the exams of its slot.
fn consolidated_invigilators(conn: &Connection, exam: &ExamRow) -> Result<Vec<Value>, HandlerErr> {
    let slot_ids = slots::slot_exam_ids_for(conn, exam)?;
    let mut out = Vec::new();
    for hall in slots::exam_halls(conn, &exam.id)? {
        let mut args: Vec<&str> = slot_ids.iter().map(String::as_str).collect();
        args.push(&hall.id);
        let mut stmt = conn.prepare(&format!(
            "SELECT t.id, u.username, t.subject
             FROM invigilation_assignments ia
             JOIN teachers t ON t.id = ia.teacher_id
             JOIN users u ON u.id = t.user_id
             WHERE ia.exam_id IN ({}) AND ia.hall_id = ?
             ORDER BY ia.created_seq
             LIMIT 1",
            placeholders(slot_ids.len())
        ))?;
        let mut rows = stmt.query(params_from_iter(args))?;
        if let Some(r) = rows.next()? {
            out.push(json!({
                "hallId": hall.id,
                "hallName": hall.name,
                "teacherId": r.get::<_, String>(0)?,
                "teacherName": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
            }));
        }
    }
    Ok(out)
}

pub(super) fn exam_json(conn: &Connection, exam: &ExamRow) -> Result<Value, HandlerErr> {
    let dept_ids = slots::exam_department_ids(conn, &exam.id)?;
    let names = slots::department_names(conn, &dept_ids)?;
    let departments: Vec<Value> = dept_ids
        .iter()
        .zip(names.iter())
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    let halls: Vec<Value> = slots::exam_halls(conn, &exam.id)?
        .into_iter()
        .map(|h| json!({ "id": h.id, "name": h.name, "capacity": h.capacity() }))
        .collect();
    Ok(json!({
        "id": exam.id,
        "name": exam.name,
        "date": exam.date,
        "startTime": exam.start_time,
        "endTime": exam.end_time,
        "isCombined": exam.is_combined,
        "totalStudents": exam.total_students,
        "departments": departments,
        "halls": halls,
    }))
}

fn exams_list(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let today = date_or_today(params, "today")?;
    let filter = get_optional_str(params, "departmentId");
    let mut stmt = conn.prepare(
        "SELECT id FROM exams e
         WHERE (?1 IS NULL OR EXISTS (
             SELECT 1 FROM exam_departments ed
             WHERE ed.exam_id = e.id AND ed.department_id = ?1))
         ORDER BY exam_date DESC, start_time DESC, rowid DESC",
    )?;
    let ids = stmt
        .query_map([&filter], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut exams = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(exam) = slots::load_exam(conn, &id)? else {
            continue;
        };
        let mut item = exam_json(conn, &exam)?;
        item["invigilators"] = Value::Array(consolidated_invigilators(conn, &exam)?);
        exams.push(item);
    }

    // Stats always cover every exam, whatever the filter.
    let (total, upcoming): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(exam_date >= ?), 0) FROM exams",
        [&today],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(json!({
        "exams": exams,
        "stats": { "total": total, "upcoming": upcoming, "completed": total - upcoming },
    }))
}

fn exams_get(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let Some(exam) = slots::load_exam(conn, &exam_id)? else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    let allocated: i64 = conn.query_row(
        "SELECT COUNT(*) FROM seating_allocations WHERE exam_id = ?",
        [&exam_id],
        |r| r.get(0),
    )?;
    let mut body = exam_json(conn, &exam)?;
    body["allocatedCount"] = json!(allocated);
    body["invigilators"] = Value::Array(consolidated_invigilators(conn, &exam)?);
    Ok(json!({ "exam": body }))
}

const ADMIN: &[Role] = &[Role::Admin];
const STAFF: &[Role] = &[Role::Admin, Role::Teacher];

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let (f, roles): (HandlerFn, &[Role]) = match req.method.as_str() {
        "exams.list" => (exams_list, STAFF),
        "exams.get" => (exams_get, STAFF),
        "exams.create" => (exams_create, ADMIN),
        "exams.update" => (exams_update, ADMIN),
        "exams.delete" => (exams_delete, ADMIN),
        _ => return None,
    };
    Some(run_as(state, req, roles, f))
}
