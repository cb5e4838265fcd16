use rusqlite::Connection;
use serde_json::{json, Value};

use crate::allocation::{AllocationError, Strategy};
use crate::auth::{Role, Session};
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_str, get_str_list, run_as, HandlerErr, HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use crate::slots::{self, SlotError, SlotOutcome};

pub(super) fn slot_error(e: SlotError) -> HandlerErr {
    match e {
        SlotError::ExamNotFound => HandlerErr::not_found("exam not found"),
        SlotError::NoStudents => {
            HandlerErr::bad_params("no students found for this exam's department(s)")
        }
        SlotError::Settings(msg) => HandlerErr::new("db_query_failed", msg),
        SlotError::Db(db) => HandlerErr::new("db_update_failed", db.to_string()),
        SlotError::Allocation(a) => {
            let details = match &a {
                AllocationError::NoHalls => json!({ "reason": "noHalls" }),
                AllocationError::InsufficientCapacity { students, capacity } => json!({
                    "reason": "insufficientCapacity",
                    "students": students,
                    "capacity": capacity,
                }),
                AllocationError::Infeasible {
                    unplaced,
                    students,
                    seats,
                } => json!({
                    "reason": "infeasible",
                    "unplaced": unplaced,
                    "students": students,
                    "seats": seats,
                }),
            };
            HandlerErr::new("allocation_failed", a.to_string()).with_details(details)
        }
    }
}

pub(super) fn outcome_json(o: &SlotOutcome) -> Value {
    json!({
        "message": o.message(),
        "examIds": o.exam_ids,
        "placed": o.placed,
        "hallCount": o.hall_count,
        "groupCount": o.group_count,
        "constraintApplied": o.constraint_applied,
        "emptySeats": o.empty_seats,
    })
}

fn allocation_run(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let Some(exam) = slots::load_exam(conn, &exam_id)? else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    let mut policy = slots::load_policy(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let requested = match get_optional_str(params, "strategy") {
        Some(raw) => Some(
            Strategy::parse(&raw)
                .ok_or_else(|| HandlerErr::bad_params("strategy must be separated or interleave"))?,
        ),
        None => None,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let outcome = match requested {
        Some(Strategy::Interleave) => {
            let hall_ids = if params.get("hallIds").is_some() {
                get_str_list(params, "hallIds")?
            } else {
                slots::exam_halls(&tx, &exam.id)?
                    .into_iter()
                    .map(|h| h.id)
                    .collect()
            };
            if hall_ids.is_empty() {
                return Err(HandlerErr::bad_params("select at least one hall"));
            }
            let found = slots::halls_by_ids(&tx, &hall_ids)?;
            if found.len() != hall_ids.len() {
                return Err(HandlerErr::bad_params("unknown hall in hallIds"));
            }
            slots::allocate_exam_only(&tx, &exam.id, &hall_ids, &policy).map_err(slot_error)?
        }
        Some(Strategy::Separated) => {
            policy.strategy = Strategy::Separated;
            slots::allocate_slot(&tx, &exam.id, &policy).map_err(slot_error)?
        }
        None => slots::allocate_slot(&tx, &exam.id, &policy).map_err(slot_error)?,
    };
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(outcome_json(&outcome))
}

fn allocation_regenerate(conn: &Connection, _s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let all = params.get("all").and_then(|v| v.as_bool()).unwrap_or(false);
    let exam_ids = match (get_optional_str(params, "examId"), all) {
        (Some(id), false) => {
            if slots::load_exam(conn, &id)?.is_none() {
                return Err(HandlerErr::not_found("exam not found"));
            }
            vec![id]
        }
        (None, true) => slots::all_exam_ids(conn)?,
        _ => return Err(HandlerErr::bad_params("pass either examId or all: true")),
    };
    let results: Vec<Value> = exam_ids
        .iter()
        .map(|id| match slots::regenerate(conn, id) {
            Ok(o) => json!({ "examId": id, "ok": true, "message": o.message() }),
            Err(e) => {
                tracing::warn!(exam = %id, "regenerate failed: {}", e);
                json!({ "examId": id, "ok": false, "message": e.to_string() })
            }
        })
        .collect();
    Ok(json!({ "results": results }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: HandlerFn = match req.method.as_str() {
        "allocation.run" => allocation_run,
        "allocation.regenerate" => allocation_regenerate,
        _ => return None,
    };
    Some(run_as(state, req, &[Role::Admin], f))
}
