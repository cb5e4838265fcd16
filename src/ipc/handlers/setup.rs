use crate::auth::{Role, Session};
use crate::db;
use crate::ipc::helpers::{run_as, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::slots::ALLOCATION_SETTINGS_KEY;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Allocation,
    Attendance,
    Security,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "allocation" => Some(Self::Allocation),
            "attendance" => Some(Self::Attendance),
            "security" => Some(Self::Security),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Allocation => ALLOCATION_SETTINGS_KEY,
            Self::Attendance => "setup.attendance",
            Self::Security => "setup.security",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Allocation => json!({
            "strategy": "separated",
            "separationKey": "department",
            "adjacency": "sideBySide"
        }),
        SetupSection::Attendance => json!({
            "defaultStatus": "P",
            "allowAdminMarking": true
        }),
        SetupSection::Security => json!({
            "minPasswordLength": 4
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

/// Case-insensitive match against `allowed`, returning the canonical spelling.
fn parse_choice(v: &Value, key: &str, allowed: &[&'static str]) -> Result<&'static str, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    allowed
        .iter()
        .find(|a| a.eq_ignore_ascii_case(s.trim()))
        .copied()
        .ok_or_else(|| format!("{} must be one of: {}", key, allowed.join(", ")))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        let value = match (section, k.as_str()) {
            (SetupSection::Allocation, "strategy") => {
                Value::from(parse_choice(v, k, &["separated", "interleave"])?)
            }
            (SetupSection::Allocation, "separationKey") => {
                Value::from(parse_choice(v, k, &["department", "rollPrefix"])?)
            }
            (SetupSection::Allocation, "adjacency") => {
                Value::from(parse_choice(v, k, &["sideBySide", "fourWay"])?)
            }
            (SetupSection::Attendance, "defaultStatus") => {
                Value::from(parse_choice(v, k, &["P", "A"])?)
            }
            (SetupSection::Attendance, "allowAdminMarking") => Value::Bool(parse_bool(v, k)?),
            (SetupSection::Security, "minPasswordLength") => {
                Value::from(parse_i64_range(v, k, 1, 128)?)
            }
            (SetupSection::Allocation, _) => return Err(format!("unknown allocation field: {}", k)),
            (SetupSection::Attendance, _) => return Err(format!("unknown attendance field: {}", k)),
            (SetupSection::Security, _) => return Err(format!("unknown security field: {}", k)),
        };
        obj.insert(k.clone(), value);
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed saved values are skipped so defaults still load.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub struct AttendanceSettings {
    pub default_status: String,
    pub allow_admin_marking: bool,
}

pub fn attendance_settings(conn: &Connection) -> Result<AttendanceSettings, HandlerErr> {
    let v = load_section(conn, SetupSection::Attendance)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(AttendanceSettings {
        default_status: v
            .get("defaultStatus")
            .and_then(|s| s.as_str())
            .unwrap_or("P")
            .to_string(),
        allow_admin_marking: v
            .get("allowAdminMarking")
            .and_then(|b| b.as_bool())
            .unwrap_or(true),
    })
}

pub fn check_password(conn: &Connection, password: &str) -> Result<(), HandlerErr> {
    let v = load_section(conn, SetupSection::Security)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let min = v.get("minPasswordLength").and_then(|n| n.as_u64()).unwrap_or(4) as usize;
    if password.chars().count() < min {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            min
        )));
    }
    Ok(())
}

fn setup_get(conn: &Connection, _session: &Session, _params: &Value) -> Result<Value, HandlerErr> {
    let load = |s| {
        load_section(conn, s).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
    };
    Ok(json!({
        "allocation": load(SetupSection::Allocation)?,
        "attendance": load(SetupSection::Attendance)?,
        "security": load(SetupSection::Security)?,
    }))
}

fn setup_update(conn: &Connection, _session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let Some(section_raw) = params.get("section").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(HandlerErr::bad_params("unknown section"));
    };
    let Some(patch_obj) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = load_section(conn, section)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    merge_section_patch(section, &mut current, patch_obj).map_err(|m| HandlerErr::bad_params(m))?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(section = section_raw, "settings updated");
    Ok(json!({ "ok": true, "section": section_raw, "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(run_as(state, req, &[Role::Admin], setup_get)),
        "setup.update" => Some(run_as(state, req, &[Role::Admin], setup_update)),
        _ => None,
    }
}
