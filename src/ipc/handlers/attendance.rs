use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    authenticate, authorize_branch, get_opt_str, get_required_str, new_id, now, require_admin,
    scope_branch,
};
use crate::ipc::types::{AppState, AuthUser, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const ATTENDANCE_STATUSES: [&str; 3] = ["present", "absent", "late"];

fn validate_status(status: &str) -> Result<(), HandlerErr> {
    if ATTENDANCE_STATUSES.contains(&status) {
        Ok(())
    } else {
        Err(HandlerErr::validation(
            "status must be one of: present, absent, late",
        ))
    }
}

fn validate_date(date: &str) -> Result<(), HandlerErr> {
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| HandlerErr::validation("date must be YYYY-MM-DD"))
}

/// Branch of the student the record is about; attendance rows inherit it.
fn student_branch(conn: &Connection, student_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT branch_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("student not found"))
}

fn upsert_attendance(
    conn: &Connection,
    student_id: &str,
    branch_id: &str,
    date: &str,
    status: &str,
    notes: Option<&str>,
    marked_by: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO attendance(id, student_id, branch_id, date, status, marked_by, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date) DO UPDATE SET
           status = excluded.status,
           notes = COALESCE(excluded.notes, notes),
           marked_by = excluded.marked_by,
           updated_at = excluded.created_at",
        (new_id(), student_id, branch_id, date, status, marked_by, notes, now()),
    )?;
    Ok(())
}

fn attendance_record(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_str(params, "date")?;
    let status = get_required_str(params, "status")?;
    validate_date(&date)?;
    validate_status(&status)?;

    let branch_id = student_branch(conn, &student_id)?;
    authorize_branch(auth, Some(&branch_id))?;

    upsert_attendance(
        conn,
        &student_id,
        &branch_id,
        &date,
        &status,
        get_opt_str(params, "notes").as_deref(),
        &auth.id,
    )?;

    let record = conn.query_row(
        "SELECT id, student_id, branch_id, date, status, notes
         FROM attendance WHERE student_id = ? AND date = ?",
        (&student_id, &date),
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "branchId": r.get::<_, String>(2)?,
                "date": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "notes": r.get::<_, Option<String>>(5)?,
            }))
        },
    )?;
    Ok(json!({ "attendance": record }))
}

fn attendance_list(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = scope_branch(auth, get_opt_str(params, "branchId"));
    let student = get_opt_str(params, "studentId");
    let from = get_opt_str(params, "from");
    let to = get_opt_str(params, "to");

    let mut stmt = conn.prepare(
        "SELECT a.id, a.student_id, s.first_name, s.last_name, a.branch_id,
                a.date, a.status, a.notes
         FROM attendance a
         JOIN students s ON s.id = a.student_id
         WHERE (?1 IS NULL OR a.branch_id = ?1)
           AND (?2 IS NULL OR a.student_id = ?2)
           AND (?3 IS NULL OR a.date >= ?3)
           AND (?4 IS NULL OR a.date <= ?4)
         ORDER BY a.date DESC, s.last_name",
    )?;
    let records = stmt
        .query_map((&branch, &student, &from, &to), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": format!("{} {}", r.get::<_, String>(2)?, r.get::<_, String>(3)?),
                "branchId": r.get::<_, String>(4)?,
                "date": r.get::<_, String>(5)?,
                "status": r.get::<_, String>(6)?,
                "notes": r.get::<_, Option<String>>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "attendance": records }))
}

fn attendance_delete(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let branch: String = conn
        .query_row("SELECT branch_id FROM attendance WHERE id = ?", [&id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("attendance record not found"))?;
    authorize_branch(auth, Some(&branch))?;
    conn.execute("DELETE FROM attendance WHERE id = ?", [&id])?;
    Ok(json!({ "deleted": true }))
}

/// Instructor proposes a record for admin sign-off. A pending proposal
/// for the same (student, date) is replaced; a decided one stays decided.
fn attendance_request_approval(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_str(params, "date")?;
    let status = get_required_str(params, "status")?;
    validate_date(&date)?;
    validate_status(&status)?;

    let branch_id = student_branch(conn, &student_id)?;
    authorize_branch(auth, Some(&branch_id))?;

    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, state FROM attendance_approvals WHERE student_id = ? AND date = ?",
            (&student_id, &date),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let id = match existing {
        Some((_, state)) if state != "pending" => {
            return Err(HandlerErr::validation(
                "an approval for this student and date was already decided",
            ));
        }
        Some((id, _)) => {
            conn.execute(
                "UPDATE attendance_approvals SET status = ?, requested_by = ? WHERE id = ?",
                (&status, &auth.id, &id),
            )?;
            id
        }
        None => {
            let id = new_id();
            conn.execute(
                "INSERT INTO attendance_approvals(id, student_id, date, status,
                                                  requested_by, state, created_at)
                 VALUES(?, ?, ?, ?, ?, 'pending', ?)",
                (&id, &student_id, &date, &status, &auth.id, now()),
            )?;
            id
        }
    };
    Ok(json!({ "approvalId": id, "state": "pending" }))
}

fn attendance_approvals_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let state_filter = get_opt_str(params, "state");
    let mut stmt = conn.prepare(
        "SELECT ap.id, ap.student_id, s.first_name, s.last_name, ap.date,
                ap.status, ap.state, ap.requested_by, ap.created_at
         FROM attendance_approvals ap
         JOIN students s ON s.id = ap.student_id
         WHERE (?1 IS NULL OR ap.state = ?1)
         ORDER BY CASE ap.state WHEN 'pending' THEN 0 ELSE 1 END, ap.created_at DESC",
    )?;
    let approvals = stmt
        .query_map([&state_filter], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": format!("{} {}", r.get::<_, String>(2)?, r.get::<_, String>(3)?),
                "date": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
                "state": r.get::<_, String>(6)?,
                "requestedBy": r.get::<_, String>(7)?,
                "createdAt": r.get::<_, String>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "approvals": approvals }))
}

fn attendance_approvals_decide(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let decision = get_required_str(params, "decision")?;
    if decision != "approve" && decision != "deny" {
        return Err(HandlerErr::validation("decision must be approve or deny"));
    }

    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT student_id, date, status, state FROM attendance_approvals WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let (student_id, date, status, state) =
        row.ok_or_else(|| HandlerErr::not_found("approval not found"))?;
    if state != "pending" {
        return Err(HandlerErr::validation("approval already decided"));
    }

    let new_state = if decision == "approve" { "approved" } else { "denied" };
    let tx = conn.unchecked_transaction()?;
    if decision == "approve" {
        let branch_id = student_branch(&tx, &student_id)?;
        upsert_attendance(&tx, &student_id, &branch_id, &date, &status, None, &auth.id)?;
    }
    tx.execute(
        "UPDATE attendance_approvals SET state = ?, decided_by = ?, decided_at = ? WHERE id = ?",
        (new_state, &auth.id, now(), &id),
    )?;
    tx.commit()?;
    Ok(json!({ "id": id, "state": new_state }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req).and_then(|auth| match req.method.as_str() {
        "attendance.record" => attendance_record(&state.db, &auth, &req.params),
        "attendance.list" => attendance_list(&state.db, &auth, &req.params),
        "attendance.delete" => attendance_delete(&state.db, &auth, &req.params),
        "attendance.requestApproval" => attendance_request_approval(&state.db, &auth, &req.params),
        "attendance.approvals.list" => {
            require_admin(&auth)?;
            attendance_approvals_list(&state.db, &req.params)
        }
        "attendance.approvals.decide" => {
            require_admin(&auth)?;
            attendance_approvals_decide(&state.db, &auth, &req.params)
        }
        _ => Err(HandlerErr::not_implemented(&req.method)),
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record"
        | "attendance.list"
        | "attendance.delete"
        | "attendance.requestApproval"
        | "attendance.approvals.list"
        | "attendance.approvals.decide" => Some(dispatch(state, req)),
        _ => None,
    }
}
