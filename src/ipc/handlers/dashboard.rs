use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{authenticate, get_opt_str, scope_branch};
use crate::ipc::types::{AppState, AuthUser, Request};
use rusqlite::{Connection, Params};
use serde_json::json;

/// Individual dashboard queries are allowed to fail; a broken widget is
/// better than a broken dashboard.
fn count_or_zero<P: Params>(conn: &Connection, sql: &str, params: P) -> i64 {
    match conn.query_row(sql, params, |r| r.get::<_, i64>(0)) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("dashboard query failed, substituting 0: {}", e);
            0
        }
    }
}

fn sum_or_zero<P: Params>(conn: &Connection, sql: &str, params: P) -> f64 {
    match conn.query_row(sql, params, |r| r.get::<_, f64>(0)) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("dashboard query failed, substituting 0: {}", e);
            0.0
        }
    }
}

fn dashboard_stats(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = scope_branch(auth, get_opt_str(params, "branchId"));
    let since = (chrono::Utc::now() - chrono::Duration::days(30))
        .format("%Y-%m-%d")
        .to_string();

    let students = count_or_zero(
        conn,
        "SELECT COUNT(*) FROM students WHERE is_active = 1 AND (?1 IS NULL OR branch_id = ?1)",
        [&branch],
    );
    let attendance_30d = count_or_zero(
        conn,
        "SELECT COUNT(*) FROM attendance WHERE date >= ?1 AND (?2 IS NULL OR branch_id = ?2)",
        (&since, &branch),
    );
    let mut fees = serde_json::Map::new();
    for status in ["pending", "paid", "overdue"] {
        fees.insert(
            status.to_string(),
            json!({
                "count": count_or_zero(
                    conn,
                    "SELECT COUNT(*) FROM fees WHERE status = ?1 AND (?2 IS NULL OR branch_id = ?2)",
                    (status, &branch),
                ),
                "amount": sum_or_zero(
                    conn,
                    "SELECT COALESCE(SUM(amount), 0) FROM fees
                     WHERE status = ?1 AND (?2 IS NULL OR branch_id = ?2)",
                    (status, &branch),
                ),
            }),
        );
    }
    let unread_notifications = count_or_zero(
        conn,
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0",
        [&auth.id],
    );
    let announcements = count_or_zero(
        conn,
        "SELECT COUNT(*) FROM announcements
         WHERE is_active = 1 AND (?1 IS NULL OR branch_id IS NULL OR branch_id = ?1)",
        [&branch],
    );

    let mut stats = json!({
        "students": students,
        "attendanceLast30Days": attendance_30d,
        "fees": fees,
        "announcements": announcements,
        "unreadNotifications": unread_notifications,
    });

    if auth.is_admin() {
        stats["instructors"] = json!(count_or_zero(
            conn,
            "SELECT COUNT(*) FROM instructors WHERE is_active = 1 AND (?1 IS NULL OR branch_id = ?1)",
            [&branch],
        ));
        stats["branches"] = json!(count_or_zero(
            conn,
            "SELECT COUNT(*) FROM branches WHERE is_active = 1",
            [],
        ));
        stats["pendingOrders"] = json!(count_or_zero(
            conn,
            "SELECT COUNT(*) FROM orders WHERE status = 'pending'",
            [],
        ));
        stats["pendingApprovals"] = json!(count_or_zero(
            conn,
            "SELECT COUNT(*) FROM attendance_approvals WHERE state = 'pending'",
            [],
        ));
    }

    Ok(stats)
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req)
        .and_then(|auth| dashboard_stats(&state.db, &auth, &req.params));
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.stats" => Some(dispatch(state, req)),
        _ => None,
    }
}
