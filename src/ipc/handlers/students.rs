use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    authenticate, authorize_branch, get_opt_bool, get_opt_str, get_required_str, new_id, now,
    require_admin, scope_branch,
};
use crate::ipc::types::{AppState, AuthUser, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn student_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "branchId": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "lastName": r.get::<_, String>(3)?,
        "dateOfBirth": r.get::<_, Option<String>>(4)?,
        "guardianName": r.get::<_, Option<String>>(5)?,
        "phone": r.get::<_, Option<String>>(6)?,
        "beltRankId": r.get::<_, Option<String>>(7)?,
        "beltRank": r.get::<_, Option<String>>(8)?,
        "joinDate": r.get::<_, Option<String>>(9)?,
        "isActive": r.get::<_, i64>(10)? != 0,
    }))
}

const STUDENT_SELECT: &str = "SELECT s.id, s.branch_id, s.first_name, s.last_name,
        s.date_of_birth, s.guardian_name, s.phone, s.belt_rank_id, b.name,
        s.join_date, s.is_active
 FROM students s
 LEFT JOIN belt_ranks b ON b.id = s.belt_rank_id";

fn students_list(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
    active: bool,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = scope_branch(auth, get_opt_str(params, "branchId"));
    let sql = format!(
        "{} WHERE s.is_active = ?1 AND (?2 IS NULL OR s.branch_id = ?2)
         ORDER BY s.last_name, s.first_name",
        STUDENT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map((active as i64, &branch), student_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn fetch_student(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("{} WHERE s.id = ?", STUDENT_SELECT);
    conn.query_row(&sql, [id], student_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("student not found"))
}

/// Loads the student and applies the branch policy in one step; soft-deleted
/// rows stay fetchable by id (restore needs them).
fn fetch_student_checked(
    conn: &Connection,
    auth: &AuthUser,
    id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let student = fetch_student(conn, id)?;
    let branch = student.get("branchId").and_then(|v| v.as_str()).map(|s| s.to_string());
    authorize_branch(auth, branch.as_deref())?;
    Ok(student)
}

fn students_get(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let student = fetch_student_checked(conn, auth, &id)?;
    Ok(json!({ "student": student }))
}

fn students_create(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let branch_id = get_required_str(params, "branchId")?;
    authorize_branch(auth, Some(&branch_id))?;

    let branch_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM branches WHERE id = ?", [&branch_id], |r| r.get(0))
        .optional()?;
    if branch_exists.is_none() {
        return Err(HandlerErr::not_found("branch not found"));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO students(id, branch_id, first_name, last_name, date_of_birth,
                              guardian_name, phone, belt_rank_id, join_date,
                              is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &branch_id,
            &first_name,
            &last_name,
            get_opt_str(params, "dateOfBirth"),
            get_opt_str(params, "guardianName"),
            get_opt_str(params, "phone"),
            get_opt_str(params, "beltRankId"),
            get_opt_str(params, "joinDate"),
            now(),
        ),
    )?;
    Ok(json!({ "student": fetch_student(conn, &id)? }))
}

fn students_update(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    fetch_student_checked(conn, auth, &id)?;

    // Moving a student across branches is an admin action.
    if let Some(new_branch) = get_opt_str(params, "branchId") {
        if !auth.is_admin() {
            return Err(HandlerErr::forbidden("only admins may move students between branches"));
        }
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM branches WHERE id = ?", [&new_branch], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("branch not found"));
        }
    }

    conn.execute(
        "UPDATE students SET
            first_name = COALESCE(?, first_name),
            last_name = COALESCE(?, last_name),
            date_of_birth = COALESCE(?, date_of_birth),
            guardian_name = COALESCE(?, guardian_name),
            phone = COALESCE(?, phone),
            belt_rank_id = COALESCE(?, belt_rank_id),
            branch_id = COALESCE(?, branch_id),
            updated_at = ?
         WHERE id = ?",
        (
            get_opt_str(params, "firstName"),
            get_opt_str(params, "lastName"),
            get_opt_str(params, "dateOfBirth"),
            get_opt_str(params, "guardianName"),
            get_opt_str(params, "phone"),
            get_opt_str(params, "beltRankId"),
            get_opt_str(params, "branchId"),
            now(),
            &id,
        ),
    )?;
    Ok(json!({ "student": fetch_student(conn, &id)? }))
}

fn students_delete(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    fetch_student_checked(conn, auth, &id)?;

    if get_opt_bool(params, "permanent") {
        require_admin(auth)?;
        // Hard delete cascades dependent rows within one transaction.
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM attendance WHERE student_id = ?", [&id])?;
        tx.execute("DELETE FROM attendance_approvals WHERE student_id = ?", [&id])?;
        tx.execute("DELETE FROM fees WHERE student_id = ?", [&id])?;
        tx.execute("DELETE FROM students WHERE id = ?", [&id])?;
        tx.commit()?;
        return Ok(json!({ "deleted": true, "permanent": true }));
    }

    conn.execute(
        "UPDATE students SET is_active = 0, updated_at = ? WHERE id = ?",
        (now(), &id),
    )?;
    Ok(json!({ "deleted": true, "permanent": false }))
}

fn students_restore(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    fetch_student_checked(conn, auth, &id)?;
    conn.execute(
        "UPDATE students SET is_active = 1, updated_at = ? WHERE id = ?",
        (now(), &id),
    )?;
    Ok(json!({ "student": fetch_student(conn, &id)? }))
}

fn belt_ranks_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, name, color, sort_order FROM belt_ranks ORDER BY sort_order",
    )?;
    let ranks = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "color": r.get::<_, String>(2)?,
                "sortOrder": r.get::<_, i64>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "beltRanks": ranks }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req).and_then(|auth| match req.method.as_str() {
        "students.list" => students_list(&state.db, &auth, &req.params, true),
        "students.listInactive" => students_list(&state.db, &auth, &req.params, false),
        "students.get" => students_get(&state.db, &auth, &req.params),
        "students.create" => students_create(&state.db, &auth, &req.params),
        "students.update" => students_update(&state.db, &auth, &req.params),
        "students.delete" => students_delete(&state.db, &auth, &req.params),
        "students.restore" => students_restore(&state.db, &auth, &req.params),
        "beltRanks.list" => belt_ranks_list(&state.db),
        _ => Err(HandlerErr::not_implemented(&req.method)),
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list"
        | "students.listInactive"
        | "students.get"
        | "students.create"
        | "students.update"
        | "students.delete"
        | "students.restore"
        | "beltRanks.list" => Some(dispatch(state, req)),
        _ => None,
    }
}
