use std::collections::{BTreeSet, HashMap};

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::allocation::{count_violations, group_key, Candidate, HallGrid, SeatedGroup, SeparationKey};
use crate::auth::{Role, Session};
use crate::ipc::helpers::{get_required_str, run_as, HandlerErr, HandlerFn};
use crate::ipc::types::{AppState, Request};
use crate::slots::{self, seat_label, ExamRow, Invigilator, SeatRow};

fn load_exam(conn: &Connection, params: &Value) -> Result<ExamRow, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    slots::load_exam(conn, &exam_id)?.ok_or_else(|| HandlerErr::not_found("exam not found"))
}

fn invigilator_json(i: Option<Invigilator>) -> Value {
    match i {
        Some(i) => json!({ "teacherId": i.teacher_id, "name": i.name, "subject": i.subject }),
        None => Value::Null,
    }
}

fn seating_exam_halls(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam = load_exam(conn, params)?;
    let halls: Vec<Value> = slots::exam_halls(conn, &exam.id)?
        .into_iter()
        .map(|h| json!({ "id": h.id, "name": h.name, "capacity": h.capacity() }))
        .collect();
    Ok(json!({ "halls": halls }))
}

fn seating_overview(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam = load_exam(conn, params)?;
    let slot_ids = slots::slot_exam_ids_for(conn, &exam)?;
    let mut halls = Vec::new();
    let mut total_capacity = 0usize;
    let mut total_allocated = 0usize;
    for hall in slots::exam_halls(conn, &exam.id)? {
        let allocated = slots::hall_seats(conn, &slot_ids, &hall.id)?.len();
        let capacity = hall.capacity();
        let occupancy = if capacity == 0 {
            0.0
        } else {
            ((allocated as f64 / capacity as f64) * 1000.0).round() / 10.0
        };
        total_capacity += capacity;
        total_allocated += allocated;
        halls.push(json!({
            "hallId": hall.id,
            "name": hall.name,
            "rows": hall.rows,
            "columns": hall.columns,
            "capacity": capacity,
            "allocated": allocated,
            "occupancyPercent": occupancy.min(100.0),
            "invigilator": invigilator_json(slots::lead_invigilator(conn, &slot_ids, &hall.id)?),
        }));
    }
    Ok(json!({
        "exam": { "id": exam.id, "name": exam.name, "date": exam.date, "startTime": exam.start_time },
        "halls": halls,
        "totalCapacity": total_capacity,
        "totalAllocated": total_allocated,
    }))
}

/// Seat labels local to one hall: 1-based rank of the global seat number.
pub(super) fn local_labels(seats: &[SeatRow]) -> HashMap<String, String> {
    seats
        .iter()
        .enumerate()
        .map(|(i, s)| (s.student_id.clone(), seat_label(i as u32 + 1)))
        .collect()
}

fn seat_cell(row: u32, col: u32, seat: Option<&SeatRow>, local: &HashMap<String, String>) -> Value {
    match seat {
        None => json!({ "row": row, "col": col, "occupied": false }),
        Some(s) => json!({
            "row": row,
            "col": col,
            "occupied": true,
            "seatLabel": seat_label(s.seat_no),
            "localSeatLabel": local.get(&s.student_id),
            "rollNo": s.roll_no,
            "studentName": s.student_name,
            "examId": s.exam_id,
            "examName": s.exam_name,
            "departmentName": s.department_name,
        }),
    }
}

/// Seated students tagged with the separation group the current policy uses.
fn seated_groups(hall: &HallGrid, seats: &[SeatRow], key: SeparationKey) -> Vec<SeatedGroup> {
    seats
        .iter()
        .map(|s| SeatedGroup {
            hall_id: hall.id.clone(),
            row: s.row,
            col: s.col,
            group: group_key(
                &Candidate {
                    id: s.student_id.clone(),
                    roll_no: s.roll_no.clone(),
                    department_id: s.department_id.clone(),
                },
                key,
            ),
        })
        .collect()
}

fn seating_hall_plan(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam = load_exam(conn, params)?;
    let hall_id = get_required_str(params, "hallId")?;
    let Some(hall) = slots::exam_halls(conn, &exam.id)?
        .into_iter()
        .find(|h| h.id == hall_id)
    else {
        return Err(HandlerErr::not_found("hall is not used by this exam"));
    };

    let slot = slots::slot_exams(conn, &exam.date, &exam.start_time)?;
    let slot_ids: Vec<String> = slot.iter().map(|e| e.id.clone()).collect();
    let seats = slots::hall_seats(conn, &slot_ids, &hall.id)?;
    let local = local_labels(&seats);
    let by_pos: HashMap<(u32, u32), &SeatRow> = seats.iter().map(|s| ((s.row, s.col), s)).collect();

    let mut grid = Vec::with_capacity(hall.capacity());
    for col in 1..=hall.columns {
        for row in 1..=hall.rows {
            grid.push(seat_cell(row, col, by_pos.get(&(row, col)).copied(), &local));
        }
    }

    let policy = slots::load_policy(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let seated = seated_groups(&hall, &seats, policy.key);
    let groups: BTreeSet<&str> = seated.iter().map(|s| s.group.as_str()).collect();
    let combined = groups.len() > 1;
    let title = if combined {
        format!("Combined Session: {} - Seating Plan", hall.name)
    } else {
        format!("{} - Seating Plan", exam.name)
    };

    let mut department_details = Vec::new();
    for e in &slot {
        if !slots::exam_halls(conn, &e.id)?.iter().any(|h| h.id == hall.id) {
            continue;
        }
        let ids = slots::exam_department_ids(conn, &e.id)?;
        for name in slots::department_names(conn, &ids)? {
            department_details.push(format!("{} ({})", name, e.name));
        }
    }

    Ok(json!({
        "title": title,
        "exam": { "id": exam.id, "name": exam.name, "date": exam.date,
                  "startTime": exam.start_time, "endTime": exam.end_time },
        "hall": { "id": hall.id, "name": hall.name, "rows": hall.rows,
                  "columns": hall.columns, "capacity": hall.capacity() },
        "seats": grid,
        "allocated": seats.len(),
        "departmentDetails": department_details,
        "invigilator": invigilator_json(slots::lead_invigilator(conn, &slot_ids, &hall.id)?),
        "violations": if combined { count_violations(&seated, policy.adjacency) } else { 0 },
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: HandlerFn = match req.method.as_str() {
        "seating.examHalls" => seating_exam_halls,
        "seating.overview" => seating_overview,
        "seating.hallPlan" => seating_hall_plan,
        _ => return None,
    };
    Some(run_as(state, req, &[Role::Admin, Role::Teacher], f))
}
