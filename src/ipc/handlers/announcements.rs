use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    authenticate, get_opt_bool, get_opt_str, get_required_str, insert_notification, new_id, now,
    require_admin,
};
use crate::ipc::types::{AppState, AuthUser, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn announcement_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "message": r.get::<_, String>(2)?,
        "branchId": r.get::<_, Option<String>>(3)?,
        "createdBy": r.get::<_, String>(4)?,
        "createdAt": r.get::<_, String>(5)?,
    }))
}

fn announcements_list(
    conn: &Connection,
    auth: &AuthUser,
) -> Result<serde_json::Value, HandlerErr> {
    // Branch-targeted announcements are invisible outside that branch;
    // NULL branch means school-wide.
    let branch = if auth.is_admin() { None } else { auth.branch_id.clone() };
    let admin = auth.is_admin();
    let mut stmt = conn.prepare(
        "SELECT id, title, message, branch_id, created_by, created_at
         FROM announcements
         WHERE is_active = 1
           AND (?2 OR branch_id IS NULL OR branch_id = ?1)
         ORDER BY created_at DESC",
    )?;
    let announcements = stmt
        .query_map((&branch, admin), announcement_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "announcements": announcements }))
}

fn announcements_create(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let message = get_required_str(params, "message")?;
    if title.trim().is_empty() || message.trim().is_empty() {
        return Err(HandlerErr::validation("title and message must not be empty"));
    }
    let branch_id = get_opt_str(params, "branchId");
    if let Some(ref b) = branch_id {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM branches WHERE id = ?", [b], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("branch not found"));
        }
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO announcements(id, title, message, branch_id, created_by, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (&id, title.trim(), message.trim(), &branch_id, &auth.id, now()),
    )?;

    // Fan-out is best-effort; the announcement itself already stands.
    let recipients: Result<Vec<String>, _> = conn
        .prepare(
            "SELECT id FROM users
             WHERE is_active = 1 AND id != ?1
               AND (?2 IS NULL OR branch_id IS NULL OR branch_id = ?2)",
        )
        .and_then(|mut stmt| {
            stmt.query_map((&auth.id, &branch_id), |r| r.get::<_, String>(0))
                .and_then(|rows| rows.collect())
        });
    match recipients {
        Ok(user_ids) => {
            for user_id in user_ids {
                if let Err(e) = insert_notification(
                    conn,
                    &user_id,
                    Some(&id),
                    title.trim(),
                    message.trim(),
                    "announcement",
                ) {
                    tracing::warn!("announcement notification for {} failed: {}", user_id, e);
                }
            }
        }
        Err(e) => tracing::warn!("announcement fan-out query failed: {}", e),
    }

    let announcement = conn.query_row(
        "SELECT id, title, message, branch_id, created_by, created_at
         FROM announcements WHERE id = ?",
        [&id],
        announcement_json,
    )?;
    Ok(json!({ "announcement": announcement }))
}

fn announcements_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let changed = conn.execute(
        "UPDATE announcements SET
            title = COALESCE(?, title),
            message = COALESCE(?, message)
         WHERE id = ? AND is_active = 1",
        (
            get_opt_str(params, "title"),
            get_opt_str(params, "message"),
            &id,
        ),
    )?;
    if changed == 0 {
        return Err(HandlerErr::not_found("announcement not found"));
    }
    let announcement = conn.query_row(
        "SELECT id, title, message, branch_id, created_by, created_at
         FROM announcements WHERE id = ?",
        [&id],
        announcement_json,
    )?;
    Ok(json!({ "announcement": announcement }))
}

fn announcements_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let changed = conn.execute("UPDATE announcements SET is_active = 0 WHERE id = ?", [&id])?;
    if changed == 0 {
        return Err(HandlerErr::not_found("announcement not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn notifications_list(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let unread_only = get_opt_bool(params, "unreadOnly");
    let mut stmt = conn.prepare(
        "SELECT id, announcement_id, title, message, type, is_read, read_at, created_at
         FROM notifications
         WHERE user_id = ?1 AND (?2 = 0 OR is_read = 0)
         ORDER BY created_at DESC",
    )?;
    let notifications = stmt
        .query_map((&auth.id, unread_only as i64), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "announcementId": r.get::<_, Option<String>>(1)?,
                "title": r.get::<_, String>(2)?,
                "message": r.get::<_, String>(3)?,
                "type": r.get::<_, String>(4)?,
                "isRead": r.get::<_, i64>(5)? != 0,
                "readAt": r.get::<_, Option<String>>(6)?,
                "createdAt": r.get::<_, String>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "notifications": notifications }))
}

fn notifications_unread_count(
    conn: &Connection,
    auth: &AuthUser,
) -> Result<serde_json::Value, HandlerErr> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0",
        [&auth.id],
        |r| r.get(0),
    )?;
    Ok(json!({ "unread": count }))
}

/// Idempotent: the first call stamps read_at, later calls change nothing.
fn notifications_mark_read(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let changed = conn.execute(
        "UPDATE notifications
         SET is_read = 1, read_at = COALESCE(read_at, ?)
         WHERE id = ? AND user_id = ?",
        (now(), &id, &auth.id),
    )?;
    if changed == 0 {
        return Err(HandlerErr::not_found("notification not found"));
    }
    let notification = conn.query_row(
        "SELECT id, is_read, read_at FROM notifications WHERE id = ?",
        [&id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "isRead": r.get::<_, i64>(1)? != 0,
                "readAt": r.get::<_, Option<String>>(2)?,
            }))
        },
    )?;
    Ok(json!({ "notification": notification }))
}

fn notifications_mark_all_read(
    conn: &Connection,
    auth: &AuthUser,
) -> Result<serde_json::Value, HandlerErr> {
    let changed = conn.execute(
        "UPDATE notifications
         SET is_read = 1, read_at = COALESCE(read_at, ?)
         WHERE user_id = ? AND is_read = 0",
        (now(), &auth.id),
    )?;
    Ok(json!({ "marked": changed }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req).and_then(|auth| match req.method.as_str() {
        "announcements.list" => announcements_list(&state.db, &auth),
        "announcements.create" => {
            require_admin(&auth)?;
            announcements_create(&state.db, &auth, &req.params)
        }
        "announcements.update" => {
            require_admin(&auth)?;
            announcements_update(&state.db, &req.params)
        }
        "announcements.delete" => {
            require_admin(&auth)?;
            announcements_delete(&state.db, &req.params)
        }
        "notifications.list" => notifications_list(&state.db, &auth, &req.params),
        "notifications.unreadCount" => notifications_unread_count(&state.db, &auth),
        "notifications.markRead" => notifications_mark_read(&state.db, &auth, &req.params),
        "notifications.markAllRead" => notifications_mark_all_read(&state.db, &auth),
        _ => Err(HandlerErr::not_implemented(&req.method)),
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "announcements.list"
        | "announcements.create"
        | "announcements.update"
        | "announcements.delete"
        | "notifications.list"
        | "notifications.unreadCount"
        | "notifications.markRead"
        | "notifications.markAllRead" => Some(dispatch(state, req)),
        _ => None,
    }
}
