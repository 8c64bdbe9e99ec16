use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
        "status": status_for(code),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// HTTP status the fronting layer should emit for each taxonomy code.
fn status_for(code: &str) -> u16 {
    match code {
        "validation_error" | "conflict" | "insufficient_stock" => 400,
        "unauthorized" => 401,
        "forbidden" => 403,
        "not_found" => 404,
        "not_implemented" => 404,
        _ => 500,
    }
}

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "validation_error",
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "unauthorized",
            message: message.into(),
            details: None,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "forbidden",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn insufficient_stock(item_id: &str, requested: i64, available: i64) -> Self {
        HandlerErr {
            code: "insufficient_stock",
            message: format!("insufficient stock for item {}", item_id),
            details: Some(json!({
                "itemId": item_id,
                "requested": requested,
                "available": available
            })),
        }
    }

    pub fn not_implemented(method: &str) -> Self {
        HandlerErr {
            code: "not_implemented",
            message: format!("unknown method: {}", method),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "internal",
            message: message.into(),
            details: None,
        }
    }

    /// Central translation of storage errors: constraint violations become
    /// client-facing conflicts, everything else stays internal.
    pub fn from_db(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(inner, ref msg) = e {
            if inner.code == rusqlite::ErrorCode::ConstraintViolation {
                return HandlerErr {
                    code: "conflict",
                    message: "duplicate or conflicting entry".to_string(),
                    details: msg.as_ref().map(|m| json!({ "constraint": m })),
                };
            }
        }
        HandlerErr::internal(e.to_string())
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::from_db(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_err_is_debuggable_in_results() {
        // `Result::expect`/`unwrap_err` need E: Debug; keep it that way.
        let r: Result<(), HandlerErr> = Err(HandlerErr::validation("nope"));
        let rendered = format!("{:?}", r.unwrap_err());
        assert!(rendered.contains("validation_error"));
        assert!(rendered.contains("nope"));
    }

    #[test]
    fn unknown_method_maps_to_not_implemented_envelope() {
        let resp = HandlerErr::not_implemented("orders.teleport").response("r1");
        assert_eq!(resp["ok"].as_bool(), Some(false));
        assert_eq!(resp["error"]["code"].as_str(), Some("not_implemented"));
        assert_eq!(resp["error"]["status"].as_u64(), Some(404));
        assert!(resp["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("orders.teleport")));
    }

    #[test]
    fn constraint_violation_becomes_conflict() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        conn.execute("CREATE TABLE t(x TEXT PRIMARY KEY)", []).expect("ddl");
        conn.execute("INSERT INTO t(x) VALUES('a')", []).expect("first");
        let dup = conn
            .execute("INSERT INTO t(x) VALUES('a')", [])
            .expect_err("duplicate key");
        let mapped = HandlerErr::from(dup);
        assert_eq!(mapped.code, "conflict");
    }
}
