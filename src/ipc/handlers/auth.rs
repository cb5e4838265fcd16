use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{hash_password, new_salt, verify_password, Role, Session};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::check_password;
use crate::ipc::helpers::{get_required_str, get_required_text, is_unique_violation, HandlerErr};
use crate::ipc::types::{AppState, Request};

/// Inserts a `users` row; the caller owns the transaction.
pub fn create_user(
    conn: &Connection,
    username: &str,
    password: &str,
    role: Role,
) -> Result<String, HandlerErr> {
    check_password(conn, password)?;
    let id = Uuid::new_v4().to_string();
    let salt = new_salt();
    conn.execute(
        "INSERT INTO users(id, username, password_hash, password_salt, role, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            username,
            hash_password(&salt, password),
            &salt,
            role.as_str(),
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::conflict(format!("username '{}' is already taken", username))
                .with_details(json!({ "field": "username", "value": username }))
        } else {
            HandlerErr::new("db_insert_failed", e.to_string())
        }
    })?;
    Ok(id)
}

pub fn update_user(
    conn: &Connection,
    user_id: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<(), HandlerErr> {
    if let Some(username) = username {
        conn.execute(
            "UPDATE users SET username = ? WHERE id = ?",
            (username, user_id),
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                HandlerErr::conflict(format!("username '{}' is already taken", username))
                    .with_details(json!({ "field": "username", "value": username }))
            } else {
                HandlerErr::new("db_update_failed", e.to_string())
            }
        })?;
    }
    if let Some(password) = password {
        check_password(conn, password)?;
        let salt = new_salt();
        conn.execute(
            "UPDATE users SET password_hash = ?, password_salt = ? WHERE id = ?",
            (hash_password(&salt, password), &salt, user_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    Ok(())
}

struct Credentials {
    user_id: String,
    username: String,
    hash: String,
    salt: String,
    role: String,
}

fn load_credentials(conn: &Connection, username: &str) -> Result<Option<Credentials>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, username, password_hash, password_salt, role FROM users WHERE username = ?",
            [username],
            |r| {
                Ok(Credentials {
                    user_id: r.get(0)?,
                    username: r.get(1)?,
                    hash: r.get(2)?,
                    salt: r.get(3)?,
                    role: r.get(4)?,
                })
            },
        )
        .optional()?)
}

fn invalid_credentials() -> HandlerErr {
    HandlerErr::new("unauthenticated", "invalid credentials")
}

fn profile_id(conn: &Connection, role: Role, user_id: &str) -> Result<Option<String>, HandlerErr> {
    let table = match role {
        Role::Admin => return Ok(None),
        Role::Teacher => "teachers",
        Role::Student => "students",
    };
    Ok(conn
        .query_row(
            &format!("SELECT id FROM {} WHERE user_id = ?", table),
            [user_id],
            |r| r.get::<_, String>(0),
        )
        .optional()?)
}

fn login_as(conn: &Connection, params: &Value, role: Role) -> Result<Session, HandlerErr> {
    let username = get_required_text(params, "username")?;
    let password = get_required_str(params, "password")?;
    let Some(c) = load_credentials(conn, &username)? else {
        return Err(invalid_credentials());
    };
    if Role::parse(&c.role) != Some(role) || !verify_password(&c.salt, &password, &c.hash) {
        return Err(invalid_credentials());
    }
    let profile = profile_id(conn, role, &c.user_id)?;
    if role != Role::Admin && profile.is_none() {
        return Err(invalid_credentials());
    }
    Ok(Session {
        user_id: c.user_id,
        username: c.username,
        role,
        profile_id: profile,
    })
}

fn student_login(conn: &Connection, params: &Value) -> Result<Session, HandlerErr> {
    let roll_no = get_required_text(params, "rollNo")?;
    let password = get_required_str(params, "password")?;
    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT s.id, u.id, u.username, u.password_hash, u.password_salt
             FROM students s JOIN users u ON u.id = s.user_id
             WHERE s.roll_no = ?",
            [&roll_no],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((student_id, user_id, username, hash, salt)) = row else {
        return Err(HandlerErr::not_found("roll number not found"));
    };
    if !verify_password(&salt, &password, &hash) {
        return Err(HandlerErr::new("unauthenticated", "invalid password"));
    }
    Ok(Session {
        user_id,
        username,
        role: Role::Student,
        profile_id: Some(student_id),
    })
}

fn session_json(s: &Session) -> Value {
    json!({
        "userId": s.user_id,
        "username": s.username,
        "role": s.role.as_str(),
        "profileId": s.profile_id,
    })
}

fn bootstrap_admin(conn: &Connection, params: &Value) -> Result<Session, HandlerErr> {
    let username = get_required_text(params, "username")?;
    let password = get_required_str(params, "password")?;
    let admins: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'admin'",
        [],
        |r| r.get(0),
    )?;
    if admins > 0 {
        return Err(HandlerErr::conflict("an admin account already exists"));
    }
    let user_id = create_user(conn, &username, &password, Role::Admin)?;
    tracing::info!(username = %username, "admin account created");
    Ok(Session {
        user_id,
        username,
        role: Role::Admin,
        profile_id: None,
    })
}

/// Runs a login flavour and stores the resulting session.
fn handle_login(
    state: &mut AppState,
    req: &Request,
    f: impl Fn(&Connection, &Value) -> Result<Session, HandlerErr>,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(session) => {
            tracing::info!(user = %session.username, role = session.role.as_str(), "login");
            let body = session_json(&session);
            state.session = Some(session);
            ok(&req.id, body)
        }
        Err(e) => {
            tracing::warn!(method = %req.method, code = e.code, "{}", e.message);
            e.response(&req.id)
        }
    }
}

fn handle_logout(state: &mut AppState, req: &Request) -> Value {
    let was = state.session.take().is_some();
    ok(&req.id, json!({ "loggedOut": was }))
}

fn handle_whoami(state: &mut AppState, req: &Request) -> Value {
    ok(
        &req.id,
        json!({ "session": state.session.as_ref().map(session_json) }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "auth.bootstrapAdmin" => Some(handle_login(state, req, bootstrap_admin)),
        "auth.adminLogin" => Some(handle_login(state, req, |c, p| login_as(c, p, Role::Admin))),
        "auth.teacherLogin" => Some(handle_login(state, req, |c, p| login_as(c, p, Role::Teacher))),
        "auth.studentLogin" => Some(handle_login(state, req, student_login)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.whoami" => Some(handle_whoami(state, req)),
        _ => None,
    }
}
