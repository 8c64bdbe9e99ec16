use crate::auth;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

struct LoginRow {
    id: String,
    username: String,
    password_hash: String,
    role: String,
    branch_id: Option<String>,
}

fn login(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;

    let row: Option<LoginRow> = state
        .db
        .query_row(
            "SELECT id, username, password_hash, role, branch_id
             FROM users
             WHERE username = ? AND is_active = 1",
            [&username],
            |r| {
                Ok(LoginRow {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    password_hash: r.get(2)?,
                    role: r.get(3)?,
                    branch_id: r.get(4)?,
                })
            },
        )
        .optional()?;

    // Same failure for unknown user and wrong password; don't leak which.
    let row = row.ok_or_else(|| HandlerErr::unauthorized("invalid credentials"))?;
    if !auth::verify_password(&row.password_hash, &password) {
        return Err(HandlerErr::unauthorized("invalid credentials"));
    }

    let token = auth::issue_token(
        &row.id,
        &row.username,
        &row.role,
        row.branch_id.as_deref(),
        &state.jwt_secret,
    )
    .map_err(|e| HandlerErr::internal(e.to_string()))?;

    Ok(json!({
        "token": token,
        "user": {
            "id": row.id,
            "username": row.username,
            "role": row.role,
            "branchId": row.branch_id,
        }
    }))
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    match login(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        _ => None,
    }
}
