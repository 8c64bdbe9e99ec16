use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::auth;
use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, AuthUser, Request};

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::validation(format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::validation(format!("missing {}", key)))
}

pub fn get_required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::validation(format!("missing {}", key)))
}

pub fn get_opt_bool(params: &Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Resolves the request token into an identity. The token alone is not
/// trusted for liveness: a deactivated account loses access immediately,
/// not at token expiry.
pub fn authenticate(state: &AppState, req: &Request) -> Result<AuthUser, HandlerErr> {
    let token = req
        .token
        .as_deref()
        .ok_or_else(|| HandlerErr::unauthorized("missing token"))?;
    let claims = auth::verify_token(token, &state.jwt_secret)
        .ok_or_else(|| HandlerErr::unauthorized("invalid or expired token"))?;

    let active: Option<i64> = state
        .db
        .query_row(
            "SELECT is_active FROM users WHERE id = ?",
            [&claims.sub],
            |r| r.get(0),
        )
        .optional()?;
    if active != Some(1) {
        return Err(HandlerErr::unauthorized("account disabled"));
    }

    Ok(AuthUser {
        id: claims.sub,
        username: claims.username,
        role: claims.role,
        branch_id: claims.branch_id,
    })
}

pub fn require_admin(auth: &AuthUser) -> Result<(), HandlerErr> {
    if auth.is_admin() {
        Ok(())
    } else {
        Err(HandlerErr::forbidden("admin access required"))
    }
}

/// Single branch policy: admins touch anything; instructors only
/// resources in their own branch. A NULL resource branch means the
/// resource is school-wide and readable by everyone.
pub fn authorize_branch(auth: &AuthUser, resource_branch: Option<&str>) -> Result<(), HandlerErr> {
    if auth.is_admin() {
        return Ok(());
    }
    match (auth.branch_id.as_deref(), resource_branch) {
        (_, None) => Ok(()),
        (Some(own), Some(res)) if own == res => Ok(()),
        _ => Err(HandlerErr::forbidden("resource belongs to another branch")),
    }
}

/// Effective branch filter for list queries: instructors are always
/// pinned to their own branch, admins may narrow with `params.branchId`.
pub fn scope_branch(auth: &AuthUser, requested: Option<String>) -> Option<String> {
    if auth.is_admin() {
        requested
    } else {
        auth.branch_id.clone()
    }
}

pub fn insert_notification(
    conn: &Connection,
    user_id: &str,
    announcement_id: Option<&str>,
    title: &str,
    message: &str,
    kind: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO notifications(id, user_id, announcement_id, title, message,
                                   type, is_read, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
        (new_id(), user_id, announcement_id, title, message, kind, now()),
    )?;
    Ok(())
}

pub fn list_admin_user_ids(conn: &Connection) -> Result<Vec<String>, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT id FROM users WHERE role = 'admin' AND is_active = 1")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
