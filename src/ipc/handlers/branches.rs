use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    authenticate, get_opt_str, get_required_str, new_id, now, require_admin,
};
use crate::ipc::types::{AppState, AuthUser, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn branch_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "address": r.get::<_, Option<String>>(2)?,
        "phone": r.get::<_, Option<String>>(3)?,
        "isActive": r.get::<_, i64>(4)? != 0,
    }))
}

fn branches_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Readable by every authenticated user; instructors need the roster
    // for dropdowns even outside their own branch.
    let mut stmt = conn.prepare(
        "SELECT id, name, address, phone, is_active
         FROM branches
         WHERE is_active = 1
         ORDER BY name",
    )?;
    let branches = stmt
        .query_map([], branch_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "branches": branches }))
}

fn branches_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let branch = conn
        .query_row(
            "SELECT id, name, address, phone, is_active FROM branches WHERE id = ?",
            [&id],
            branch_json,
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("branch not found"))?;
    Ok(json!({ "branch": branch }))
}

fn branches_create(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(auth)?;
    let name = get_required_str(params, "name")?;
    if name.trim().is_empty() {
        return Err(HandlerErr::validation("name must not be empty"));
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO branches(id, name, address, phone, is_active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (
            &id,
            name.trim(),
            get_opt_str(params, "address"),
            get_opt_str(params, "phone"),
            now(),
        ),
    )?;
    branches_get(conn, &json!({ "id": id }))
}

fn branches_update(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(auth)?;
    let id = get_required_str(params, "id")?;
    let changed = conn.execute(
        "UPDATE branches SET
            name = COALESCE(?, name),
            address = COALESCE(?, address),
            phone = COALESCE(?, phone)
         WHERE id = ?",
        (
            get_opt_str(params, "name"),
            get_opt_str(params, "address"),
            get_opt_str(params, "phone"),
            &id,
        ),
    )?;
    if changed == 0 {
        return Err(HandlerErr::not_found("branch not found"));
    }
    branches_get(conn, &json!({ "id": id }))
}

fn branches_delete(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(auth)?;
    let id = get_required_str(params, "id")?;
    let changed = conn.execute("UPDATE branches SET is_active = 0 WHERE id = ?", [&id])?;
    if changed == 0 {
        return Err(HandlerErr::not_found("branch not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req).and_then(|auth| match req.method.as_str() {
        "branches.list" => branches_list(&state.db),
        "branches.get" => branches_get(&state.db, &req.params),
        "branches.create" => branches_create(&state.db, &auth, &req.params),
        "branches.update" => branches_update(&state.db, &auth, &req.params),
        "branches.delete" => branches_delete(&state.db, &auth, &req.params),
        _ => Err(HandlerErr::not_implemented(&req.method)),
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "branches.list" | "branches.get" | "branches.create" | "branches.update"
        | "branches.delete" => Some(dispatch(state, req)),
        _ => None,
    }
}
