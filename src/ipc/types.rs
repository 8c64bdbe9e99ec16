use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Bearer token; the HTTP edge copies it from the Authorization header.
    #[serde(default)]
    pub token: Option<String>,
}

pub struct AppState {
    pub db: Connection,
    pub jwt_secret: String,
}

/// Authenticated identity resolved from a request token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    pub role: String,
    pub branch_id: Option<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}
