use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    authenticate, get_opt_str, get_required_str, insert_notification, list_admin_user_ids, new_id,
    now, require_admin,
};
use crate::ipc::types::{AppState, AuthUser, Request};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub const ORDER_STATUSES: [&str; 6] = [
    "pending",
    "approved",
    "processing",
    "shipped",
    "delivered",
    "cancelled",
];

/// Timestamp plus a random 3-digit suffix. Not guaranteed unique, but a
/// collision needs two orders in the same second drawing the same suffix.
fn generate_order_number() -> String {
    format!(
        "ORD-{}-{:03}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        rand::thread_rng().gen_range(0..1000)
    )
}

struct CartLine {
    item_id: String,
    item_name: String,
    quantity: i64,
    price: f64,
}

fn parse_cart(params: &serde_json::Value) -> Result<Vec<(String, i64)>, HandlerErr> {
    let items = params
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::validation("missing items"))?;
    if items.is_empty() {
        return Err(HandlerErr::validation("order must contain at least one item"));
    }
    let mut cart = Vec::with_capacity(items.len());
    for entry in items {
        let item_id = entry
            .get("itemId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::validation("each item needs an itemId"))?;
        let quantity = entry
            .get("quantity")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerErr::validation("each item needs a quantity"))?;
        if quantity <= 0 {
            return Err(HandlerErr::validation("quantity must be greater than zero"));
        }
        cart.push((item_id.to_string(), quantity));
    }
    Ok(cart)
}

fn instructor_profile(conn: &Connection, user_id: &str) -> Result<(String, String), HandlerErr> {
    conn.query_row(
        "SELECT id, branch_id FROM instructors WHERE user_id = ? AND is_active = 1",
        [user_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("no instructor profile for this account"))
}

fn order_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "orderNumber": r.get::<_, String>(1)?,
        "instructorId": r.get::<_, String>(2)?,
        "branchId": r.get::<_, Option<String>>(3)?,
        "totalAmount": r.get::<_, f64>(4)?,
        "status": r.get::<_, String>(5)?,
        "notes": r.get::<_, Option<String>>(6)?,
        "createdAt": r.get::<_, String>(7)?,
        "updatedAt": r.get::<_, Option<String>>(8)?,
    }))
}

const ORDER_SELECT: &str = "SELECT id, order_number, instructor_id, branch_id, total_amount,
        status, notes, created_at, updated_at
 FROM orders";

fn fetch_order_with_items(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("{} WHERE id = ?", ORDER_SELECT);
    let mut order = conn
        .query_row(&sql, [id], order_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("order not found"))?;

    let mut stmt = conn.prepare(
        "SELECT oi.id, oi.item_id, inv.name, oi.quantity, oi.price
         FROM order_items oi
         JOIN inventory inv ON inv.id = oi.item_id
         WHERE oi.order_id = ?",
    )?;
    let items = stmt
        .query_map([id], |r| {
            let quantity: i64 = r.get(3)?;
            let price: f64 = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "itemId": r.get::<_, String>(1)?,
                "itemName": r.get::<_, String>(2)?,
                "quantity": quantity,
                "price": price,
                "lineTotal": price * quantity as f64,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    order["items"] = json!(items);
    Ok(order)
}

/// The one multi-table, all-or-nothing write path. Stock validation and
/// decrement happen in the same transaction through a conditional update,
/// so two competing orders can never jointly oversell an item.
fn orders_create(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let cart = parse_cart(params)?;
    let (instructor_id, branch_id) = instructor_profile(conn, &auth.id)?;

    let order_id = new_id();
    let order_number = generate_order_number();

    let tx = conn.unchecked_transaction()?;
    let mut lines: Vec<CartLine> = Vec::with_capacity(cart.len());
    let mut total = 0.0_f64;
    for (item_id, quantity) in &cart {
        let row: Option<(String, f64, i64)> = tx
            .query_row(
                "SELECT name, price, quantity FROM inventory WHERE id = ? AND is_active = 1",
                [item_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let (item_name, price, available) =
            row.ok_or_else(|| HandlerErr::not_found(format!("inventory item {} not found", item_id)))?;

        // Atomic check-and-decrement; a plain read-then-write would race.
        let changed = tx.execute(
            "UPDATE inventory SET quantity = quantity - ? WHERE id = ? AND quantity >= ?",
            (quantity, item_id, quantity),
        )?;
        if changed == 0 {
            return Err(HandlerErr::insufficient_stock(item_id, *quantity, available));
        }

        total += price * *quantity as f64;
        lines.push(CartLine {
            item_id: item_id.clone(),
            item_name,
            quantity: *quantity,
            price,
        });
    }

    tx.execute(
        "INSERT INTO orders(id, order_number, instructor_id, branch_id, total_amount,
                            status, notes, created_at)
         VALUES(?, ?, ?, ?, ?, 'pending', ?, ?)",
        (
            &order_id,
            &order_number,
            &instructor_id,
            &branch_id,
            total,
            get_opt_str(params, "notes"),
            now(),
        ),
    )?;
    for line in &lines {
        tx.execute(
            "INSERT INTO order_items(id, order_id, item_id, quantity, price)
             VALUES(?, ?, ?, ?, ?)",
            (new_id(), &order_id, &line.item_id, line.quantity, line.price),
        )?;
    }
    tx.commit()?;

    // Fan-out after commit; a failed notification must not undo the order.
    let summary: Vec<String> = lines
        .iter()
        .map(|l| format!("{} x{}", l.item_name, l.quantity))
        .collect();
    match list_admin_user_ids(conn) {
        Ok(admin_ids) => {
            for admin_id in admin_ids {
                if let Err(e) = insert_notification(
                    conn,
                    &admin_id,
                    None,
                    "New order placed",
                    &format!(
                        "Order {} from {}: {}",
                        order_number,
                        auth.username,
                        summary.join(", ")
                    ),
                    "order",
                ) {
                    tracing::warn!("order notification for {} failed: {}", admin_id, e);
                }
            }
        }
        Err(e) => tracing::warn!("admin lookup for order notifications failed: {}", e.message),
    }

    Ok(json!({ "order": fetch_order_with_items(conn, &order_id)? }))
}

fn orders_get(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let order = fetch_order_with_items(conn, &id)?;
    if !auth.is_admin() {
        let (own_instructor_id, _) = instructor_profile(conn, &auth.id)?;
        let owner = order.get("instructorId").and_then(|v| v.as_str());
        if owner != Some(own_instructor_id.as_str()) {
            return Err(HandlerErr::forbidden("this order belongs to another instructor"));
        }
    }
    Ok(json!({ "order": order }))
}

fn list_orders(
    conn: &Connection,
    instructor_id: Option<&str>,
    status: Option<&str>,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT o.id, o.order_number, o.instructor_id, o.branch_id, o.total_amount,
                o.status, o.notes, o.created_at, o.updated_at,
                COUNT(oi.id) AS item_count
         FROM orders o
         LEFT JOIN order_items oi ON oi.order_id = o.id
         WHERE (?1 IS NULL OR o.instructor_id = ?1)
           AND (?2 IS NULL OR o.status = ?2)
         GROUP BY o.id
         ORDER BY o.created_at DESC",
    )?;
    let orders = stmt
        .query_map((instructor_id, status), |r| {
            let mut order = order_json(r)?;
            order["itemCount"] = json!(r.get::<_, i64>(9)?);
            Ok(order)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(orders)
}

fn orders_my_orders(conn: &Connection, auth: &AuthUser) -> Result<serde_json::Value, HandlerErr> {
    let (instructor_id, _) = instructor_profile(conn, &auth.id)?;
    let orders = list_orders(conn, Some(&instructor_id), None)?;
    Ok(json!({ "orders": orders }))
}

fn orders_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let status = get_opt_str(params, "status");
    if let Some(ref s) = status {
        if !ORDER_STATUSES.contains(&s.as_str()) {
            return Err(HandlerErr::validation("unknown status filter"));
        }
    }
    let orders = list_orders(conn, None, status.as_deref())?;
    Ok(json!({ "orders": orders }))
}

fn status_message(order_number: &str, status: &str) -> String {
    match status {
        "approved" => format!("Order {} was approved", order_number),
        "processing" => format!("Order {} is being processed", order_number),
        "shipped" => format!("Order {} has shipped", order_number),
        "delivered" => format!("Order {} was delivered", order_number),
        "cancelled" => format!("Order {} was cancelled", order_number),
        _ => format!("Order {} is pending again", order_number),
    }
}

/// Flat status field, deliberately permissive: any admin may set any of
/// the six values at any time.
fn orders_update_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let status = get_required_str(params, "status")?;
    if !ORDER_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::validation(format!(
            "status must be one of: {}",
            ORDER_STATUSES.join(", ")
        )));
    }

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT o.order_number, i.user_id
             FROM orders o JOIN instructors i ON i.id = o.instructor_id
             WHERE o.id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let (order_number, owner_user_id) =
        row.ok_or_else(|| HandlerErr::not_found("order not found"))?;

    conn.execute(
        "UPDATE orders SET status = ?, updated_at = ? WHERE id = ?",
        (&status, now(), &id),
    )?;

    // Best-effort: the status change stands even if the notification fails.
    if let Err(e) = insert_notification(
        conn,
        &owner_user_id,
        None,
        "Order status updated",
        &status_message(&order_number, &status),
        "order_status",
    ) {
        tracing::warn!("status notification for order {} failed: {}", id, e);
    }

    Ok(json!({ "order": fetch_order_with_items(conn, &id)? }))
}

fn orders_stats_overview(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut by_status = serde_json::Map::new();
    for status in ORDER_STATUSES {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE status = ?",
            [status],
            |r| r.get(0),
        )?;
        by_status.insert(status.to_string(), json!(count));
    }
    let (total_orders, total_amount): (i64, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(total_amount), 0) FROM orders",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let pending_amount: f64 = conn.query_row(
        "SELECT COALESCE(SUM(total_amount), 0) FROM orders WHERE status = 'pending'",
        [],
        |r| r.get(0),
    )?;
    let recent = list_orders(conn, None, None)?
        .into_iter()
        .take(5)
        .collect::<Vec<_>>();
    Ok(json!({
        "totalOrders": total_orders,
        "totalAmount": total_amount,
        "pendingAmount": pending_amount,
        "byStatus": by_status,
        "recentOrders": recent,
    }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req).and_then(|auth| match req.method.as_str() {
        "orders.create" => orders_create(&state.db, &auth, &req.params),
        "orders.myOrders" => orders_my_orders(&state.db, &auth),
        "orders.get" => orders_get(&state.db, &auth, &req.params),
        "orders.list" => {
            require_admin(&auth)?;
            orders_list(&state.db, &req.params)
        }
        "orders.updateStatus" => {
            require_admin(&auth)?;
            orders_update_status(&state.db, &req.params)
        }
        "orders.statsOverview" => {
            require_admin(&auth)?;
            orders_stats_overview(&state.db)
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
        "orders.create"
        | "orders.myOrders"
        | "orders.get"
        | "orders.list"
        | "orders.updateStatus"
        | "orders.statsOverview" => Some(dispatch(state, req)),
        _ => None,
    }
}
