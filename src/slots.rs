//! Exam slots: exams sharing a date and start time are seated together.
//!
//! This is the database side of allocation. It gathers a slot's halls and
//! students, runs the engine in `allocation`, and rewrites
//! `seating_allocations`. Callers own the transaction.

use std::collections::{BTreeMap, HashMap};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::allocation::{
    self, Adjacency, AllocationError, Candidate, HallGrid, Policy, Reserved, SeparationKey,
    Strategy,
};
use crate::db;

pub const ALLOCATION_SETTINGS_KEY: &str = "setup.allocation";

#[derive(Debug, Clone)]
pub struct ExamRow {
    pub id: String,
    pub name: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub is_combined: bool,
    pub total_students: i64,
}

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("exam not found")]
    ExamNotFound,
    #[error("no students found for this exam's department(s)")]
    NoStudents,
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("failed to read allocation settings: {0}")]
    Settings(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct SlotOutcome {
    pub exam_ids: Vec<String>,
    pub placed: usize,
    pub hall_count: usize,
    pub group_count: usize,
    pub constraint_applied: bool,
    pub empty_seats: usize,
}

impl SlotOutcome {
    pub fn message(&self) -> String {
        if self.placed == 0 {
            return "allocated 0 students (no students found for the slot's departments)"
                .to_string();
        }
        let mut msg = format!(
            "allocated {} students across {} halls",
            self.placed, self.hall_count
        );
        if self.constraint_applied {
            msg.push_str(&format!(
                " with {}-way department separation",
                self.group_count
            ));
        }
        msg
    }
}

/// One occupied seat as shown on plans and dashboards.
#[derive(Debug, Clone)]
pub struct SeatRow {
    pub exam_id: String,
    pub exam_name: String,
    pub student_id: String,
    pub roll_no: String,
    pub student_name: String,
    pub department_id: Option<String>,
    pub department_name: Option<String>,
    pub seat_no: u32,
    pub row: u32,
    pub col: u32,
}

#[derive(Debug, Clone)]
pub struct Invigilator {
    pub teacher_id: String,
    pub name: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct StudentOverlap {
    pub roll_no: String,
    pub name: String,
    pub details: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DepartmentConflict {
    pub existing_exam: String,
    pub departments: Vec<String>,
    pub halls: Vec<String>,
}

pub fn seat_label(seat_no: u32) -> String {
    format!("S{}", seat_no)
}

fn text_args(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|s| Value::Text(s.clone())).collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn exam_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ExamRow> {
    Ok(ExamRow {
        id: r.get(0)?,
        name: r.get(1)?,
        date: r.get(2)?,
        start_time: r.get(3)?,
        end_time: r.get(4)?,
        is_combined: r.get::<_, i64>(5)? != 0,
        total_students: r.get(6)?,
    })
}

const EXAM_COLUMNS: &str =
    "id, name, exam_date, start_time, end_time, is_combined, total_students";

pub fn load_exam(conn: &Connection, exam_id: &str) -> rusqlite::Result<Option<ExamRow>> {
    conn.query_row(
        &format!("SELECT {} FROM exams WHERE id = ?", EXAM_COLUMNS),
        [exam_id],
        exam_from_row,
    )
    .optional()
}

/// Exams of the slot in creation order.
pub fn slot_exams(conn: &Connection, date: &str, start_time: &str) -> rusqlite::Result<Vec<ExamRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM exams WHERE exam_date = ? AND start_time = ? ORDER BY rowid",
        EXAM_COLUMNS
    ))?;
    let rows = stmt
        .query_map((date, start_time), exam_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn slot_exam_ids_for(conn: &Connection, exam: &ExamRow) -> rusqlite::Result<Vec<String>> {
    Ok(slot_exams(conn, &exam.date, &exam.start_time)?
        .into_iter()
        .map(|e| e.id)
        .collect())
}

pub fn all_exam_ids(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT id FROM exams ORDER BY exam_date, start_time, rowid")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn exam_department_ids(conn: &Connection, exam_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT ed.department_id
         FROM exam_departments ed
         JOIN departments d ON d.id = ed.department_id
         WHERE ed.exam_id = ?
         ORDER BY d.name",
    )?;
    let ids = stmt
        .query_map([exam_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn department_names(conn: &Connection, ids: &[String]) -> rusqlite::Result<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT name FROM departments WHERE id IN ({}) ORDER BY name",
        placeholders(ids.len())
    ))?;
    let names = stmt
        .query_map(params_from_iter(text_args(ids)), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn hall_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<HallGrid> {
    Ok(HallGrid {
        id: r.get(0)?,
        name: r.get(1)?,
        rows: r.get(2)?,
        columns: r.get(3)?,
    })
}

pub fn exam_halls(conn: &Connection, exam_id: &str) -> rusqlite::Result<Vec<HallGrid>> {
    let mut stmt = conn.prepare(
        "SELECT h.id, h.name, h.row_count, h.column_count
         FROM exam_halls eh
         JOIN halls h ON h.id = eh.hall_id
         WHERE eh.exam_id = ?
         ORDER BY h.name",
    )?;
    let halls = stmt
        .query_map([exam_id], hall_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(halls)
}

pub fn halls_by_ids(conn: &Connection, ids: &[String]) -> rusqlite::Result<Vec<HallGrid>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT id, name, row_count, column_count FROM halls WHERE id IN ({}) ORDER BY name",
        placeholders(ids.len())
    ))?;
    let halls = stmt
        .query_map(params_from_iter(text_args(ids)), hall_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(halls)
}

pub fn students_in_departments(
    conn: &Connection,
    department_ids: &[String],
) -> rusqlite::Result<Vec<Candidate>> {
    if department_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT id, roll_no, department_id FROM students
         WHERE department_id IN ({})
         ORDER BY roll_no",
        placeholders(department_ids.len())
    ))?;
    let students = stmt
        .query_map(params_from_iter(text_args(department_ids)), |r| {
            Ok(Candidate {
                id: r.get(0)?,
                roll_no: r.get(1)?,
                department_id: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(students)
}

/// Reads the allocation settings section; unknown values fall back to defaults.
pub fn load_policy(conn: &Connection) -> anyhow::Result<Policy> {
    let mut policy = Policy::default();
    let Some(saved) = db::settings_get_json(conn, ALLOCATION_SETTINGS_KEY)? else {
        return Ok(policy);
    };
    let field = |k: &str| saved.get(k).and_then(|v| v.as_str()).map(str::to_string);
    if let Some(s) = field("strategy").as_deref().and_then(Strategy::parse) {
        policy.strategy = s;
    }
    if let Some(k) = field("separationKey").as_deref().and_then(SeparationKey::parse) {
        policy.key = k;
    }
    if let Some(a) = field("adjacency").as_deref().and_then(Adjacency::parse) {
        policy.adjacency = a;
    }
    Ok(policy)
}

fn clear_allocations(conn: &Connection, exam_ids: &[String]) -> rusqlite::Result<()> {
    if exam_ids.is_empty() {
        return Ok(());
    }
    conn.execute(
        &format!(
            "DELETE FROM seating_allocations WHERE exam_id IN ({})",
            placeholders(exam_ids.len())
        ),
        params_from_iter(text_args(exam_ids)),
    )?;
    Ok(())
}

fn insert_placements(
    conn: &Connection,
    placements: &[allocation::Placement],
    exam_of_student: &HashMap<String, String>,
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO seating_allocations(id, exam_id, student_id, hall_id, seat_no, seat_row, seat_col)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
    )?;
    let mut inserted = 0;
    for p in placements {
        let Some(exam_id) = exam_of_student.get(&p.student_id) else {
            continue;
        };
        stmt.execute((
            Uuid::new_v4().to_string(),
            exam_id,
            &p.student_id,
            &p.hall_id,
            p.seat_no,
            p.row,
            p.col,
        ))?;
        inserted += 1;
    }
    Ok(inserted)
}

/// Department id to the first-created slot exam listing it.
fn department_owners(conn: &Connection, exams: &[ExamRow]) -> rusqlite::Result<BTreeMap<String, String>> {
    let mut owners = BTreeMap::new();
    for e in exams {
        for d in exam_department_ids(conn, &e.id)? {
            owners.entry(d).or_insert_with(|| e.id.clone());
        }
    }
    Ok(owners)
}

/// Re-seats every exam sharing `exam_id`'s slot over the union of their halls.
///
/// A student sits the slot exam that lists their department; if two slot
/// exams list it, the one created first wins.
pub fn allocate_slot(
    conn: &Connection,
    exam_id: &str,
    policy: &Policy,
) -> Result<SlotOutcome, SlotError> {
    let exam = load_exam(conn, exam_id)?.ok_or(SlotError::ExamNotFound)?;
    let exams = slot_exams(conn, &exam.date, &exam.start_time)?;

    let exam_of_department = department_owners(conn, &exams)?;
    let mut hall_ids: Vec<String> = Vec::new();
    for e in &exams {
        for h in exam_halls(conn, &e.id)? {
            if !hall_ids.contains(&h.id) {
                hall_ids.push(h.id);
            }
        }
    }
    let halls = halls_by_ids(conn, &hall_ids)?;
    let departments: Vec<String> = exam_of_department.keys().cloned().collect();
    let candidates = students_in_departments(conn, &departments)?;

    let plan = allocation::allocate(&halls, &candidates, policy)?;

    let exam_of_student: HashMap<String, String> = candidates
        .iter()
        .filter_map(|c| {
            let dept = c.department_id.as_ref()?;
            Some((c.id.clone(), exam_of_department.get(dept)?.clone()))
        })
        .collect();
    let exam_ids: Vec<String> = exams.into_iter().map(|e| e.id).collect();
    clear_allocations(conn, &exam_ids)?;
    let placed = insert_placements(conn, &plan.placements, &exam_of_student)?;

    tracing::info!(
        exam = %exam.name,
        slot = %format!("{} {}", exam.date, exam.start_time),
        placed,
        halls = halls.len(),
        strategy = policy.strategy.as_str(),
        constraint = plan.constraint_applied,
        "slot allocated"
    );

    Ok(SlotOutcome {
        exam_ids,
        placed,
        hall_count: halls.len(),
        group_count: plan.groups.len(),
        constraint_applied: plan.constraint_applied,
        empty_seats: plan.empty_seats,
    })
}

/// Interleaved allocation of a single exam over chosen halls, leaving the
/// other slot exams' seats untouched. Departments an earlier slot exam
/// already lists stay with that exam.
pub fn allocate_exam_only(
    conn: &Connection,
    exam_id: &str,
    hall_ids: &[String],
    policy: &Policy,
) -> Result<SlotOutcome, SlotError> {
    let exam = load_exam(conn, exam_id)?.ok_or(SlotError::ExamNotFound)?;
    let slot = slot_exams(conn, &exam.date, &exam.start_time)?;
    let owners = department_owners(conn, &slot)?;
    let departments: Vec<String> = exam_department_ids(conn, exam_id)?
        .into_iter()
        .filter(|d| owners.get(d).map(String::as_str) == Some(exam_id))
        .collect();
    let candidates = students_in_departments(conn, &departments)?;
    if candidates.is_empty() {
        return Err(SlotError::NoStudents);
    }
    let halls = halls_by_ids(conn, hall_ids)?;

    let others: Vec<String> = slot
        .into_iter()
        .map(|e| e.id)
        .filter(|id| id != exam_id)
        .collect();
    let mut reserved = Reserved::new();
    if !others.is_empty() {
        let mut stmt = conn.prepare(&format!(
            "SELECT hall_id, seat_row, seat_col FROM seating_allocations WHERE exam_id IN ({})",
            placeholders(others.len())
        ))?;
        let taken = stmt
            .query_map(params_from_iter(text_args(&others)), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?, r.get::<_, u32>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        reserved.extend(taken);
    }

    let interleave = Policy {
        strategy: Strategy::Interleave,
        ..*policy
    };
    let plan = allocation::allocate_with_reserved(&halls, &candidates, &interleave, &reserved)?;

    let exam_of_student: HashMap<String, String> = candidates
        .iter()
        .map(|c| (c.id.clone(), exam.id.clone()))
        .collect();
    let exam_ids = vec![exam.id.clone()];
    clear_allocations(conn, &exam_ids)?;
    let placed = insert_placements(conn, &plan.placements, &exam_of_student)?;

    tracing::info!(exam = %exam.name, placed, halls = halls.len(), "exam allocated by interleave");

    Ok(SlotOutcome {
        exam_ids,
        placed,
        hall_count: halls.len(),
        group_count: plan.groups.len(),
        constraint_applied: false,
        empty_seats: plan.empty_seats,
    })
}

/// Re-runs slot allocation for one exam inside its own transaction.
pub fn regenerate(conn: &Connection, exam_id: &str) -> Result<SlotOutcome, SlotError> {
    let policy = load_policy(conn).map_err(|e| SlotError::Settings(format!("{e:#}")))?;
    let tx = conn.unchecked_transaction()?;
    let outcome = allocate_slot(&tx, exam_id, &policy)?;
    tx.commit()?;
    Ok(outcome)
}

/// Students of `department_ids` already seated in another exam on `date`
/// whose time range overlaps `[start, end)`.
pub fn student_overlaps(
    conn: &Connection,
    date: &str,
    start: &str,
    end: &str,
    department_ids: &[String],
    exclude_exam_id: Option<&str>,
) -> rusqlite::Result<Vec<StudentOverlap>> {
    if department_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = text_args(department_ids);
    args.push(Value::Text(date.to_string()));
    args.push(Value::Text(start.to_string()));
    args.push(Value::Text(end.to_string()));
    args.push(Value::Text(exclude_exam_id.unwrap_or("").to_string()));
    let mut stmt = conn.prepare(&format!(
        "SELECT s.roll_no, u.username, e.name, e.start_time, e.end_time, h.name
         FROM seating_allocations sa
         JOIN students s ON s.id = sa.student_id
         JOIN users u ON u.id = s.user_id
         JOIN exams e ON e.id = sa.exam_id
         JOIN halls h ON h.id = sa.hall_id
         WHERE s.department_id IN ({})
           AND e.exam_date = ?
           AND e.end_time > ?
           AND e.start_time < ?
           AND e.id <> ?
         ORDER BY s.roll_no, e.start_time",
        placeholders(department_ids.len())
    ))?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: Vec<StudentOverlap> = Vec::new();
    for (roll_no, name, exam_name, s, e, hall) in rows {
        let detail = format!(
            "Conflict with exam '{}' ({} - {}) in {}.",
            exam_name, s, e, hall
        );
        match out.last_mut() {
            Some(last) if last.roll_no == roll_no => last.details.push(detail),
            _ => out.push(StudentOverlap {
                roll_no,
                name,
                details: vec![detail],
            }),
        }
    }
    Ok(out)
}

/// Other exams in the same slot that share a hall and a department but have
/// a different name.
pub fn department_conflicts(
    conn: &Connection,
    name: &str,
    date: &str,
    start: &str,
    hall_ids: &[String],
    department_ids: &[String],
    exclude_exam_id: Option<&str>,
) -> rusqlite::Result<Vec<DepartmentConflict>> {
    let mut out = Vec::new();
    for other in slot_exams(conn, date, start)? {
        if Some(other.id.as_str()) == exclude_exam_id || other.name == name {
            continue;
        }
        let overlap: Vec<String> = exam_department_ids(conn, &other.id)?
            .into_iter()
            .filter(|d| department_ids.contains(d))
            .collect();
        if overlap.is_empty() {
            continue;
        }
        let halls: Vec<String> = exam_halls(conn, &other.id)?
            .into_iter()
            .filter(|h| hall_ids.contains(&h.id))
            .map(|h| h.name)
            .collect();
        if halls.is_empty() {
            continue;
        }
        out.push(DepartmentConflict {
            existing_exam: other.name,
            departments: department_names(conn, &overlap)?,
            halls,
        });
    }
    Ok(out)
}

/// Latest assignment for `hall_id` among the slot's exams.
pub fn lead_invigilator(
    conn: &Connection,
    slot_exam_ids: &[String],
    hall_id: &str,
) -> rusqlite::Result<Option<Invigilator>> {
    if slot_exam_ids.is_empty() {
        return Ok(None);
    }
    let mut args = text_args(slot_exam_ids);
    args.push(Value::Text(hall_id.to_string()));
    conn.query_row(
        &format!(
            "SELECT t.id, u.username, t.subject
             FROM invigilation_assignments ia
             JOIN teachers t ON t.id = ia.teacher_id
             JOIN users u ON u.id = t.user_id
             WHERE ia.exam_id IN ({}) AND ia.hall_id = ?
             ORDER BY ia.created_seq DESC
             LIMIT 1",
            placeholders(slot_exam_ids.len())
        ),
        params_from_iter(args),
        |r| {
            Ok(Invigilator {
                teacher_id: r.get(0)?,
                name: r.get(1)?,
                subject: r.get(2)?,
            })
        },
    )
    .optional()
}

/// Occupied seats of a hall across the slot, ordered by global seat number.
pub fn hall_seats(
    conn: &Connection,
    slot_exam_ids: &[String],
    hall_id: &str,
) -> rusqlite::Result<Vec<SeatRow>> {
    if slot_exam_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = text_args(slot_exam_ids);
    args.push(Value::Text(hall_id.to_string()));
    let mut stmt = conn.prepare(&format!(
        "SELECT sa.exam_id, e.name, s.id, s.roll_no, u.username, s.department_id, d.name,
                sa.seat_no, sa.seat_row, sa.seat_col
         FROM seating_allocations sa
         JOIN exams e ON e.id = sa.exam_id
         JOIN students s ON s.id = sa.student_id
         JOIN users u ON u.id = s.user_id
         LEFT JOIN departments d ON d.id = s.department_id
         WHERE sa.exam_id IN ({}) AND sa.hall_id = ?
         ORDER BY sa.seat_no",
        placeholders(slot_exam_ids.len())
    ))?;
    let seats = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(SeatRow {
                exam_id: r.get(0)?,
                exam_name: r.get(1)?,
                student_id: r.get(2)?,
                roll_no: r.get(3)?,
                student_name: r.get(4)?,
                department_id: r.get(5)?,
                department_name: r.get(6)?,
                seat_no: r.get(7)?,
                row: r.get(8)?,
                col: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(seats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("examhall-slots-{}-{}", tag, Uuid::new_v4()))
    }

    #[test]
    fn regenerate_reports_unreadable_settings() {
        let ws = temp_workspace("settings");
        let conn = db::open_db(&ws).expect("open");
        conn.execute(
            "INSERT INTO settings(key, value_json) VALUES(?, ?)",
            (ALLOCATION_SETTINGS_KEY, "{not json"),
        )
        .expect("seed settings");

        let err = regenerate(&conn, "any-exam").expect_err("settings error");
        assert!(matches!(err, SlotError::Settings(_)), "{err:?}");
        assert!(err.to_string().starts_with("failed to read allocation settings"));

        db::settings_set_json(&conn, ALLOCATION_SETTINGS_KEY, &serde_json::json!({}))
            .expect("repair settings");
        let err = regenerate(&conn, "any-exam").expect_err("missing exam");
        assert!(matches!(err, SlotError::ExamNotFound), "{err:?}");
        let _ = std::fs::remove_dir_all(ws);
    }
}
