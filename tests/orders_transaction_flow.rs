use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_data_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon(data_dir: &Path) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_dojangd");
    let mut child = Command::new(exe)
        .arg("--data-dir")
        .arg(data_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn dojangd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(t) = token {
        payload["token"] = json!(t);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, token, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn err_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
    password: &str,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        "login",
        "auth.login",
        None,
        json!({ "username": username, "password": password }),
    );
    result
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string()
}

struct Fixture {
    admin_token: String,
    instructor_token: String,
    item_id: String,
}

/// Admin, one branch, one instructor login, one stocked item.
fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    stock: i64,
    price: f64,
) -> Fixture {
    let admin_token = login(stdin, reader, "admin", "admin123");
    let branch = request_ok(
        stdin,
        reader,
        "b1",
        "branches.create",
        Some(&admin_token),
        json!({ "name": "Downtown Dojang" }),
    );
    let branch_id = branch["branch"]["id"].as_str().expect("branch id").to_string();

    request_ok(
        stdin,
        reader,
        "i1",
        "instructors.create",
        Some(&admin_token),
        json!({
            "username": "kim",
            "password": "kim-secret",
            "firstName": "Ji-woo",
            "lastName": "Kim",
            "branchId": branch_id,
        }),
    );
    let instructor_token = login(stdin, reader, "kim", "kim-secret");

    let item = request_ok(
        stdin,
        reader,
        "inv1",
        "inventory.create",
        Some(&admin_token),
        json!({ "name": "Sparring Gloves", "quantity": stock, "price": price }),
    );
    let item_id = item["item"]["id"].as_str().expect("item id").to_string();

    Fixture {
        admin_token,
        instructor_token,
        item_id,
    }
}

#[test]
fn order_total_matches_lines_and_stock_decrements() {
    let data_dir = temp_data_dir("dojangd-orders-create");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let fx = setup(&mut stdin, &mut reader, 5, 25.0);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "o1",
        "orders.create",
        Some(&fx.instructor_token),
        json!({ "items": [{ "itemId": fx.item_id, "quantity": 2 }] }),
    );
    let order = &result["order"];
    assert_eq!(order["status"].as_str(), Some("pending"));
    assert_eq!(order["totalAmount"].as_f64(), Some(50.0));
    let items = order["items"].as_array().expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"].as_i64(), Some(2));
    assert_eq!(items[0]["price"].as_f64(), Some(25.0));
    assert_eq!(items[0]["lineTotal"].as_f64(), Some(50.0));
    let order_number = order["orderNumber"].as_str().expect("order number");
    assert!(order_number.starts_with("ORD-"));

    // Stock went 5 -> 3.
    let item = request_ok(
        &mut stdin,
        &mut reader,
        "inv-check",
        "inventory.get",
        Some(&fx.admin_token),
        json!({ "id": fx.item_id }),
    );
    assert_eq!(item["item"]["quantity"].as_i64(), Some(3));

    // Exactly one admin, so exactly one "order" notification.
    let notifications = request_ok(
        &mut stdin,
        &mut reader,
        "n1",
        "notifications.list",
        Some(&fx.admin_token),
        json!({}),
    );
    let rows = notifications["notifications"].as_array().expect("rows");
    let order_notes: Vec<_> = rows
        .iter()
        .filter(|n| n["type"].as_str() == Some("order"))
        .collect();
    assert_eq!(order_notes.len(), 1);
    assert!(order_notes[0]["message"]
        .as_str()
        .expect("message")
        .contains(order_number));
}

#[test]
fn oversell_rolls_back_everything() {
    let data_dir = temp_data_dir("dojangd-orders-oversell");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let fx = setup(&mut stdin, &mut reader, 5, 25.0);

    let resp = request(
        &mut stdin,
        &mut reader,
        "o1",
        "orders.create",
        Some(&fx.instructor_token),
        json!({ "items": [{ "itemId": fx.item_id, "quantity": 6 }] }),
    );
    assert_eq!(err_code(&resp), "insufficient_stock");
    let details = &resp["error"]["details"];
    assert_eq!(details["requested"].as_i64(), Some(6));
    assert_eq!(details["available"].as_i64(), Some(5));

    // Nothing committed: stock intact, no orders for the instructor.
    let item = request_ok(
        &mut stdin,
        &mut reader,
        "inv-check",
        "inventory.get",
        Some(&fx.admin_token),
        json!({ "id": fx.item_id }),
    );
    assert_eq!(item["item"]["quantity"].as_i64(), Some(5));
    let mine = request_ok(
        &mut stdin,
        &mut reader,
        "my",
        "orders.myOrders",
        Some(&fx.instructor_token),
        json!({}),
    );
    assert_eq!(mine["orders"].as_array().map(|a| a.len()), Some(0));
}

#[test]
fn partial_cart_failure_rolls_back_earlier_lines() {
    let data_dir = temp_data_dir("dojangd-orders-partial");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let fx = setup(&mut stdin, &mut reader, 10, 5.0);
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "inv2",
        "inventory.create",
        Some(&fx.admin_token),
        json!({ "name": "Belts", "quantity": 1, "price": 8.0 }),
    );
    let second_id = second["item"]["id"].as_str().expect("id").to_string();

    // First line would succeed alone; second line oversells.
    let resp = request(
        &mut stdin,
        &mut reader,
        "o1",
        "orders.create",
        Some(&fx.instructor_token),
        json!({ "items": [
            { "itemId": fx.item_id, "quantity": 4 },
            { "itemId": second_id, "quantity": 2 }
        ]}),
    );
    assert_eq!(err_code(&resp), "insufficient_stock");

    // The already-decremented first item is restored by the rollback.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "check1",
        "inventory.get",
        Some(&fx.admin_token),
        json!({ "id": fx.item_id }),
    );
    assert_eq!(first["item"]["quantity"].as_i64(), Some(10));
}

#[test]
fn competing_orders_never_jointly_oversell() {
    let data_dir = temp_data_dir("dojangd-orders-race");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let fx = setup(&mut stdin, &mut reader, 3, 12.5);

    // Both requests want the full remaining stock.
    let first = request(
        &mut stdin,
        &mut reader,
        "o1",
        "orders.create",
        Some(&fx.instructor_token),
        json!({ "items": [{ "itemId": fx.item_id, "quantity": 3 }] }),
    );
    let second = request(
        &mut stdin,
        &mut reader,
        "o2",
        "orders.create",
        Some(&fx.instructor_token),
        json!({ "items": [{ "itemId": fx.item_id, "quantity": 3 }] }),
    );

    let ok_count = [&first, &second]
        .iter()
        .filter(|r| r["ok"].as_bool() == Some(true))
        .count();
    assert_eq!(ok_count, 1, "exactly one order may win the stock");
    assert_eq!(err_code(&second), "insufficient_stock");

    let item = request_ok(
        &mut stdin,
        &mut reader,
        "check",
        "inventory.get",
        Some(&fx.admin_token),
        json!({ "id": fx.item_id }),
    );
    assert_eq!(item["item"]["quantity"].as_i64(), Some(0));
}

#[test]
fn order_requires_instructor_profile_and_valid_cart() {
    let data_dir = temp_data_dir("dojangd-orders-validate");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let fx = setup(&mut stdin, &mut reader, 5, 25.0);

    // The admin account has no instructor profile.
    let resp = request(
        &mut stdin,
        &mut reader,
        "o-admin",
        "orders.create",
        Some(&fx.admin_token),
        json!({ "items": [{ "itemId": fx.item_id, "quantity": 1 }] }),
    );
    assert_eq!(err_code(&resp), "not_found");

    let empty = request(
        &mut stdin,
        &mut reader,
        "o-empty",
        "orders.create",
        Some(&fx.instructor_token),
        json!({ "items": [] }),
    );
    assert_eq!(err_code(&empty), "validation_error");

    let unknown = request(
        &mut stdin,
        &mut reader,
        "o-unknown",
        "orders.create",
        Some(&fx.instructor_token),
        json!({ "items": [{ "itemId": "no-such-item", "quantity": 1 }] }),
    );
    assert_eq!(err_code(&unknown), "not_found");
}

#[test]
fn captured_price_survives_later_price_change() {
    let data_dir = temp_data_dir("dojangd-orders-price");
    let (_child, mut stdin, mut reader) = spawn_daemon(&data_dir);
    let fx = setup(&mut stdin, &mut reader, 5, 25.0);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "o1",
        "orders.create",
        Some(&fx.instructor_token),
        json!({ "items": [{ "itemId": fx.item_id, "quantity": 1 }] }),
    );
    let order_id = created["order"]["id"].as_str().expect("id").to_string();

    request_ok(
        &mut stdin,
        &mut reader,
        "reprice",
        "inventory.update",
        Some(&fx.admin_token),
        json!({ "id": fx.item_id, "price": 99.0 }),
    );

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "orders.get",
        Some(&fx.instructor_token),
        json!({ "id": order_id }),
    );
    assert_eq!(fetched["order"]["totalAmount"].as_f64(), Some(25.0));
    assert_eq!(
        fetched["order"]["items"][0]["price"].as_f64(),
        Some(25.0),
        "line price is the price at order time"
    );
}
