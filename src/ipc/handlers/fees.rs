use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    authenticate, authorize_branch, get_opt_str, get_required_f64, get_required_str, new_id, now,
    require_admin, scope_branch,
};
use crate::ipc::types::{AppState, AuthUser, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const FEE_STATUSES: [&str; 3] = ["pending", "paid", "overdue"];

fn validate_month(month: &str) -> Result<(), HandlerErr> {
    let valid = month.len() == 7
        && chrono::NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").is_ok();
    if valid {
        Ok(())
    } else {
        Err(HandlerErr::validation("month must be YYYY-MM"))
    }
}

fn fee_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "branchId": r.get::<_, String>(2)?,
        "month": r.get::<_, String>(3)?,
        "feeType": r.get::<_, String>(4)?,
        "amount": r.get::<_, f64>(5)?,
        "status": r.get::<_, String>(6)?,
        "paidAt": r.get::<_, Option<String>>(7)?,
        "notes": r.get::<_, Option<String>>(8)?,
    }))
}

/// One row per (student, month, fee type); resubmitting updates in place.
fn fees_record(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let month = get_required_str(params, "month")?;
    let fee_type = get_required_str(params, "feeType")?;
    let amount = get_required_f64(params, "amount")?;
    validate_month(&month)?;
    if fee_type.trim().is_empty() {
        return Err(HandlerErr::validation("feeType must not be empty"));
    }
    if amount < 0.0 {
        return Err(HandlerErr::validation("amount must not be negative"));
    }
    let status = get_opt_str(params, "status").unwrap_or_else(|| "pending".to_string());
    if !FEE_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::validation(
            "status must be one of: pending, paid, overdue",
        ));
    }

    let branch_id: String = conn
        .query_row(
            "SELECT branch_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    authorize_branch(auth, Some(&branch_id))?;

    let paid_at = if status == "paid" { Some(now()) } else { None };
    conn.execute(
        "INSERT INTO fees(id, student_id, branch_id, month, fee_type, amount,
                          status, paid_at, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, month, fee_type) DO UPDATE SET
           amount = excluded.amount,
           status = excluded.status,
           paid_at = COALESCE(fees.paid_at, excluded.paid_at),
           notes = COALESCE(excluded.notes, notes),
           updated_at = excluded.created_at",
        (
            new_id(),
            &student_id,
            &branch_id,
            &month,
            fee_type.trim(),
            amount,
            &status,
            paid_at,
            get_opt_str(params, "notes"),
            now(),
        ),
    )?;

    let fee = conn.query_row(
        "SELECT id, student_id, branch_id, month, fee_type, amount, status, paid_at, notes
         FROM fees WHERE student_id = ? AND month = ? AND fee_type = ?",
        (&student_id, &month, fee_type.trim()),
        fee_json,
    )?;
    Ok(json!({ "fee": fee }))
}

fn fees_list(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = scope_branch(auth, get_opt_str(params, "branchId"));
    let student = get_opt_str(params, "studentId");
    let month = get_opt_str(params, "month");
    let status = get_opt_str(params, "status");

    let mut stmt = conn.prepare(
        "SELECT f.id, f.student_id, f.branch_id, f.month, f.fee_type, f.amount,
                f.status, f.paid_at, f.notes
         FROM fees f
         WHERE (?1 IS NULL OR f.branch_id = ?1)
           AND (?2 IS NULL OR f.student_id = ?2)
           AND (?3 IS NULL OR f.month = ?3)
           AND (?4 IS NULL OR f.status = ?4)
         ORDER BY f.month DESC, f.created_at DESC",
    )?;
    let fees = stmt
        .query_map((&branch, &student, &month, &status), fee_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "fees": fees }))
}

fn fees_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let changed = conn.execute("DELETE FROM fees WHERE id = ?", [&id])?;
    if changed == 0 {
        return Err(HandlerErr::not_found("fee record not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req).and_then(|auth| match req.method.as_str() {
        "fees.record" => fees_record(&state.db, &auth, &req.params),
        "fees.list" => fees_list(&state.db, &auth, &req.params),
        "fees.delete" => {
            require_admin(&auth)?;
            fees_delete(&state.db, &req.params)
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
        "fees.record" | "fees.list" | "fees.delete" => Some(dispatch(state, req)),
        _ => None,
    }
}
