use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "examhall.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS halls(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            row_count INTEGER NOT NULL CHECK(row_count >= 1),
            column_count INTEGER NOT NULL CHECK(column_count >= 1)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            password_salt TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('admin', 'teacher', 'student')),
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            roll_no TEXT NOT NULL UNIQUE,
            department_id TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            employee_id TEXT NOT NULL UNIQUE,
            department_id TEXT,
            subject TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_department ON teachers(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            exam_date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            is_combined INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // total_students arrived after the first schema; older workspaces lack it.
    ensure_exams_total_students(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_slot ON exams(exam_date, start_time)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_departments(
            exam_id TEXT NOT NULL,
            department_id TEXT NOT NULL,
            PRIMARY KEY(exam_id, department_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_halls(
            exam_id TEXT NOT NULL,
            hall_id TEXT NOT NULL,
            PRIMARY KEY(exam_id, hall_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(hall_id) REFERENCES halls(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_halls_hall ON exam_halls(hall_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS invigilation_assignments(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            hall_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            created_seq INTEGER NOT NULL,
            UNIQUE(exam_id, hall_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(hall_id) REFERENCES halls(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invigilation_teacher ON invigilation_assignments(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS seating_allocations(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            hall_id TEXT NOT NULL,
            seat_no INTEGER NOT NULL,
            seat_row INTEGER NOT NULL,
            seat_col INTEGER NOT NULL,
            UNIQUE(exam_id, student_id),
            UNIQUE(exam_id, hall_id, seat_no),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(hall_id) REFERENCES halls(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_seating_allocations_hall ON seating_allocations(hall_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_seating_allocations_student ON seating_allocations(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            hall_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date_marked TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('P', 'A')),
            UNIQUE(exam_id, student_id, date_marked),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(hall_id) REFERENCES halls(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_exam_hall ON attendance_records(exam_id, hall_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_exams_total_students(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exams", "total_students")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE exams ADD COLUMN total_students INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}
