use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::auth::{Role, Session};
use crate::ipc::handlers::exams::exam_json;
use crate::ipc::handlers::seating::local_labels;
use crate::ipc::helpers::{date_or_today, run_as, run_open, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::slots::{self, seat_label};

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

fn upcoming_count(conn: &Connection, today: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM exams WHERE exam_date >= ?",
        [today],
        |r| r.get(0),
    )?)
}

fn dashboard_home(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let today = date_or_today(params, "today")?;
    Ok(json!({
        "students": count(conn, "SELECT COUNT(*) FROM students")?,
        "teachers": count(conn, "SELECT COUNT(*) FROM teachers")?,
        "halls": count(conn, "SELECT COUNT(*) FROM halls")?,
        "upcomingExams": upcoming_count(conn, &today)?,
    }))
}

fn dashboard_admin(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let today = date_or_today(params, "today")?;
    let mut stmt = conn.prepare(
        "SELECT id FROM exams WHERE exam_date >= ?
         ORDER BY exam_date, start_time, rowid
         LIMIT 5",
    )?;
    let ids = stmt
        .query_map([&today], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut upcoming = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(exam) = slots::load_exam(conn, &id)? {
            upcoming.push(exam_json(conn, &exam)?);
        }
    }
    Ok(json!({
        "totals": {
            "students": count(conn, "SELECT COUNT(*) FROM students")?,
            "teachers": count(conn, "SELECT COUNT(*) FROM teachers")?,
            "halls": count(conn, "SELECT COUNT(*) FROM halls")?,
            "departments": count(conn, "SELECT COUNT(*) FROM departments")?,
            "exams": count(conn, "SELECT COUNT(*) FROM exams")?,
            "upcomingExams": upcoming_count(conn, &today)?,
        },
        "upcoming": upcoming,
    }))
}

fn dashboard_teacher(conn: &Connection, session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let today = date_or_today(params, "today")?;
    let teacher_id = session.profile_id.clone().unwrap_or_default();
    let mut stmt = conn.prepare(
        "SELECT ia.id, ia.exam_id, h.id, h.name
         FROM invigilation_assignments ia
         JOIN exams e ON e.id = ia.exam_id
         JOIN halls h ON h.id = ia.hall_id
         WHERE ia.teacher_id = ? AND e.exam_date >= ?
         ORDER BY e.exam_date, e.start_time, h.name",
    )?;
    let assignments = stmt
        .query_map((&teacher_id, &today), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(assignments.len());
    for (assignment_id, exam_id, hall_id, hall_name) in assignments {
        let Some(exam) = slots::load_exam(conn, &exam_id)? else {
            continue;
        };
        let dept_ids = slots::exam_department_ids(conn, &exam.id)?;
        let seats: Vec<Value> = slots::hall_seats(conn, &[exam.id.clone()], &hall_id)?
            .into_iter()
            .map(|s| {
                json!({
                    "studentId": s.student_id,
                    "rollNo": s.roll_no,
                    "studentName": s.student_name,
                    "departmentName": s.department_name,
                    "seatLabel": seat_label(s.seat_no),
                })
            })
            .collect();
        let marked_today = conn
            .query_row(
                "SELECT 1 FROM attendance_records
                 WHERE exam_id = ? AND hall_id = ? AND date_marked = ? LIMIT 1",
                (&exam.id, &hall_id, &today),
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        out.push(json!({
            "assignmentId": assignment_id,
            "exam": {
                "id": exam.id,
                "name": exam.name,
                "date": exam.date,
                "startTime": exam.start_time,
                "endTime": exam.end_time,
            },
            "hall": { "id": hall_id, "name": hall_name },
            "departments": slots::department_names(conn, &dept_ids)?,
            "totalStudents": seats.len(),
            "students": seats,
            "attendanceMarkedToday": marked_today,
        }));
    }
    Ok(json!({ "assignments": out }))
}

fn dashboard_student(conn: &Connection, session: &Session, _params: &Value) -> Result<Value, HandlerErr> {
    let student_id = session.profile_id.clone().unwrap_or_default();
    let department_id: Option<String> = conn
        .query_row(
            "SELECT department_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();

    let mut stmt = conn.prepare(
        "SELECT sa.exam_id, sa.hall_id, h.name, sa.seat_no
         FROM seating_allocations sa
         JOIN exams e ON e.id = sa.exam_id
         JOIN halls h ON h.id = sa.hall_id
         WHERE sa.student_id = ?
         ORDER BY e.exam_date, e.start_time",
    )?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, u32>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut allocations = Vec::with_capacity(rows.len());
    let mut allocated_ids = Vec::with_capacity(rows.len());
    for (exam_id, hall_id, hall_name, seat_no) in rows {
        let Some(exam) = slots::load_exam(conn, &exam_id)? else {
            continue;
        };
        let slot_ids = slots::slot_exam_ids_for(conn, &exam)?;
        let hall_seats = slots::hall_seats(conn, &slot_ids, &hall_id)?;
        let local = local_labels(&hall_seats);
        allocations.push(json!({
            "exam": {
                "id": exam.id,
                "name": exam.name,
                "date": exam.date,
                "startTime": exam.start_time,
                "endTime": exam.end_time,
            },
            "hall": { "id": hall_id, "name": hall_name },
            "seatLabel": seat_label(seat_no),
            "localSeatLabel": local.get(&student_id),
            "totalInHall": hall_seats.len(),
        }));
        allocated_ids.push(exam_id);
    }

    let mut department_exams = Vec::new();
    if let Some(dept) = department_id.as_deref() {
        let mut stmt = conn.prepare(
            "SELECT e.id FROM exams e
             JOIN exam_departments ed ON ed.exam_id = e.id
             WHERE ed.department_id = ?
             ORDER BY e.exam_date, e.start_time",
        )?;
        let ids = stmt
            .query_map([dept], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for id in ids {
            if let Some(exam) = slots::load_exam(conn, &id)? {
                department_exams.push(exam_json(conn, &exam)?);
            }
        }
    }

    Ok(json!({
        "allocations": allocations,
        "departmentExams": department_exams,
        "allocatedExamIds": allocated_ids,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "dashboard.home" => Some(run_open(state, req, dashboard_home)),
        "dashboard.admin" => Some(run_as(state, req, &[Role::Admin], dashboard_admin)),
        "dashboard.teacher" => Some(run_as(state, req, &[Role::Teacher], dashboard_teacher)),
        "dashboard.student" => Some(run_as(state, req, &[Role::Student], dashboard_student)),
        _ => None,
    }
}
