use crate::auth as credentials;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    authenticate, get_opt_bool, get_opt_str, get_required_str, new_id, now, require_admin,
};
use crate::ipc::types::{AppState, AuthUser, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn instructor_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "userId": r.get::<_, String>(1)?,
        "username": r.get::<_, String>(2)?,
        "branchId": r.get::<_, String>(3)?,
        "firstName": r.get::<_, String>(4)?,
        "lastName": r.get::<_, String>(5)?,
        "phone": r.get::<_, Option<String>>(6)?,
        "beltRankId": r.get::<_, Option<String>>(7)?,
        "hireDate": r.get::<_, Option<String>>(8)?,
        "isActive": r.get::<_, i64>(9)? != 0,
    }))
}

const INSTRUCTOR_SELECT: &str = "SELECT i.id, i.user_id, u.username, i.branch_id,
        i.first_name, i.last_name, i.phone, i.belt_rank_id, i.hire_date, i.is_active
 FROM instructors i
 JOIN users u ON u.id = i.user_id";

fn fetch_instructor(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("{} WHERE i.id = ?", INSTRUCTOR_SELECT);
    conn.query_row(&sql, [id], instructor_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("instructor not found"))
}

fn instructors_list(
    conn: &Connection,
    params: &serde_json::Value,
    active: bool,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = get_opt_str(params, "branchId");
    let sql = format!(
        "{} WHERE i.is_active = ?1 AND (?2 IS NULL OR i.branch_id = ?2)
         ORDER BY i.last_name, i.first_name",
        INSTRUCTOR_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let instructors = stmt
        .query_map((active as i64, &branch), instructor_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "instructors": instructors }))
}

fn instructors_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    Ok(json!({ "instructor": fetch_instructor(conn, &id)? }))
}

fn instructors_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let branch_id = get_required_str(params, "branchId")?;
    if password.len() < 6 {
        return Err(HandlerErr::validation("password must be at least 6 characters"));
    }

    let branch_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM branches WHERE id = ?", [&branch_id], |r| r.get(0))
        .optional()?;
    if branch_exists.is_none() {
        return Err(HandlerErr::not_found("branch not found"));
    }

    let hash = credentials::hash_password(&password)
        .map_err(|e| HandlerErr::internal(e.to_string()))?;

    // Login account and profile must appear together or not at all.
    let user_id = new_id();
    let instructor_id = new_id();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO users(id, username, password_hash, role, branch_id, is_active, created_at)
         VALUES(?, ?, ?, 'instructor', ?, 1, ?)",
        (&user_id, &username, &hash, &branch_id, now()),
    )?;
    tx.execute(
        "INSERT INTO instructors(id, user_id, branch_id, first_name, last_name,
                                 phone, belt_rank_id, hire_date, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &instructor_id,
            &user_id,
            &branch_id,
            &first_name,
            &last_name,
            get_opt_str(params, "phone"),
            get_opt_str(params, "beltRankId"),
            get_opt_str(params, "hireDate"),
            now(),
        ),
    )?;
    tx.commit()?;

    Ok(json!({ "instructor": fetch_instructor(conn, &instructor_id)? }))
}

fn instructors_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    fetch_instructor(conn, &id)?;

    if let Some(new_branch) = get_opt_str(params, "branchId") {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM branches WHERE id = ?", [&new_branch], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("branch not found"));
        }
        // Branch scope lives on both profile and login account.
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE instructors SET branch_id = ? WHERE id = ?",
            (&new_branch, &id),
        )?;
        tx.execute(
            "UPDATE users SET branch_id = ?
             WHERE id = (SELECT user_id FROM instructors WHERE id = ?)",
            (&new_branch, &id),
        )?;
        tx.commit()?;
    }

    conn.execute(
        "UPDATE instructors SET
            first_name = COALESCE(?, first_name),
            last_name = COALESCE(?, last_name),
            phone = COALESCE(?, phone),
            belt_rank_id = COALESCE(?, belt_rank_id),
            hire_date = COALESCE(?, hire_date)
         WHERE id = ?",
        (
            get_opt_str(params, "firstName"),
            get_opt_str(params, "lastName"),
            get_opt_str(params, "phone"),
            get_opt_str(params, "beltRankId"),
            get_opt_str(params, "hireDate"),
            &id,
        ),
    )?;
    Ok(json!({ "instructor": fetch_instructor(conn, &id)? }))
}

fn instructors_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let user_id: String = conn
        .query_row("SELECT user_id FROM instructors WHERE id = ?", [&id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("instructor not found"))?;

    if get_opt_bool(params, "permanent") {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM order_items WHERE order_id IN
                (SELECT id FROM orders WHERE instructor_id = ?)",
            [&id],
        )?;
        tx.execute("DELETE FROM orders WHERE instructor_id = ?", [&id])?;
        tx.execute("DELETE FROM notifications WHERE user_id = ?", [&user_id])?;
        tx.execute("DELETE FROM instructors WHERE id = ?", [&id])?;
        tx.execute("DELETE FROM users WHERE id = ?", [&user_id])?;
        tx.commit()?;
        return Ok(json!({ "deleted": true, "permanent": true }));
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute("UPDATE instructors SET is_active = 0 WHERE id = ?", [&id])?;
    tx.execute("UPDATE users SET is_active = 0 WHERE id = ?", [&user_id])?;
    tx.commit()?;
    Ok(json!({ "deleted": true, "permanent": false }))
}

fn instructors_restore(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let user_id: String = conn
        .query_row("SELECT user_id FROM instructors WHERE id = ?", [&id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("instructor not found"))?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("UPDATE instructors SET is_active = 1 WHERE id = ?", [&id])?;
    tx.execute("UPDATE users SET is_active = 1 WHERE id = ?", [&user_id])?;
    tx.commit()?;
    Ok(json!({ "instructor": fetch_instructor(conn, &id)? }))
}

/// Self-service contact fields only; role, branch and login stay admin-owned.
fn instructors_update_profile(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id: String = conn
        .query_row(
            "SELECT id FROM instructors WHERE user_id = ?",
            [&auth.id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("no instructor profile for this account"))?;
    conn.execute(
        "UPDATE instructors SET
            first_name = COALESCE(?, first_name),
            last_name = COALESCE(?, last_name),
            phone = COALESCE(?, phone)
         WHERE id = ?",
        (
            get_opt_str(params, "firstName"),
            get_opt_str(params, "lastName"),
            get_opt_str(params, "phone"),
            &id,
        ),
    )?;
    Ok(json!({ "instructor": fetch_instructor(conn, &id)? }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req).and_then(|auth| {
        if req.method == "instructors.updateProfile" {
            return instructors_update_profile(&state.db, &auth, &req.params);
        }
        require_admin(&auth)?;
        match req.method.as_str() {
            "instructors.list" => instructors_list(&state.db, &req.params, true),
            "instructors.listInactive" => instructors_list(&state.db, &req.params, false),
            "instructors.get" => instructors_get(&state.db, &req.params),
            "instructors.create" => instructors_create(&state.db, &req.params),
            "instructors.update" => instructors_update(&state.db, &req.params),
            "instructors.delete" => instructors_delete(&state.db, &req.params),
            "instructors.restore" => instructors_restore(&state.db, &req.params),
            _ => Err(HandlerErr::not_implemented(&req.method)),
        }
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "instructors.list"
        | "instructors.listInactive"
        | "instructors.get"
        | "instructors.create"
        | "instructors.update"
        | "instructors.delete"
        | "instructors.restore"
        | "instructors.updateProfile" => Some(dispatch(state, req)),
        _ => None,
    }
}
