use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    authenticate, get_opt_str, get_required_f64, get_required_i64, get_required_str, new_id, now,
    require_admin, scope_branch,
};
use crate::ipc::types::{AppState, AuthUser, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn item_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "branchId": r.get::<_, Option<String>>(2)?,
        "quantity": r.get::<_, i64>(3)?,
        "price": r.get::<_, f64>(4)?,
        "description": r.get::<_, Option<String>>(5)?,
        "isActive": r.get::<_, i64>(6)? != 0,
    }))
}

fn fetch_item(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, name, branch_id, quantity, price, description, is_active
         FROM inventory WHERE id = ?",
        [id],
        item_json,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("inventory item not found"))
}

fn inventory_list(
    conn: &Connection,
    auth: &AuthUser,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    // Instructors see school-wide stock (branch NULL) plus their own
    // branch's items; they need the catalogue to place orders.
    let branch = scope_branch(auth, get_opt_str(params, "branchId"));
    let mut stmt = conn.prepare(
        "SELECT id, name, branch_id, quantity, price, description, is_active
         FROM inventory
         WHERE is_active = 1
           AND (?1 IS NULL OR branch_id IS NULL OR branch_id = ?1)
         ORDER BY name",
    )?;
    let items = stmt
        .query_map([&branch], item_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "items": items }))
}

fn inventory_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    Ok(json!({ "item": fetch_item(conn, &id)? }))
}

fn inventory_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let quantity = get_required_i64(params, "quantity")?;
    let price = get_required_f64(params, "price")?;
    if name.trim().is_empty() {
        return Err(HandlerErr::validation("name must not be empty"));
    }
    if quantity < 0 {
        return Err(HandlerErr::validation("quantity must not be negative"));
    }
    if price < 0.0 {
        return Err(HandlerErr::validation("price must not be negative"));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO inventory(id, name, branch_id, quantity, price, description,
                               is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            name.trim(),
            get_opt_str(params, "branchId"),
            quantity,
            price,
            get_opt_str(params, "description"),
            now(),
        ),
    )?;
    Ok(json!({ "item": fetch_item(conn, &id)? }))
}

fn inventory_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let quantity = params.get("quantity").and_then(|v| v.as_i64());
    let price = params.get("price").and_then(|v| v.as_f64());
    if quantity.is_some_and(|q| q < 0) {
        return Err(HandlerErr::validation("quantity must not be negative"));
    }
    if price.is_some_and(|p| p < 0.0) {
        return Err(HandlerErr::validation("price must not be negative"));
    }

    let changed = conn.execute(
        "UPDATE inventory SET
            name = COALESCE(?, name),
            quantity = COALESCE(?, quantity),
            price = COALESCE(?, price),
            description = COALESCE(?, description)
         WHERE id = ?",
        (
            get_opt_str(params, "name"),
            quantity,
            price,
            get_opt_str(params, "description"),
            &id,
        ),
    )?;
    if changed == 0 {
        return Err(HandlerErr::not_found("inventory item not found"));
    }
    Ok(json!({ "item": fetch_item(conn, &id)? }))
}

fn inventory_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    // Soft only: order_items keep referencing retired items.
    let changed = conn.execute("UPDATE inventory SET is_active = 0 WHERE id = ?", [&id])?;
    if changed == 0 {
        return Err(HandlerErr::not_found("inventory item not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = authenticate(state, req).and_then(|auth| match req.method.as_str() {
        "inventory.list" => inventory_list(&state.db, &auth, &req.params),
        "inventory.get" => inventory_get(&state.db, &req.params),
        "inventory.create" => {
            require_admin(&auth)?;
            inventory_create(&state.db, &req.params)
        }
        "inventory.update" => {
            require_admin(&auth)?;
            inventory_update(&state.db, &req.params)
        }
        "inventory.delete" => {
            require_admin(&auth)?;
            inventory_delete(&state.db, &req.params)
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
        "inventory.list" | "inventory.get" | "inventory.create" | "inventory.update"
        | "inventory.delete" => Some(dispatch(state, req)),
        _ => None,
    }
}
