use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const TOKEN_TTL_HOURS: i64 = 24;

/// Session claims carried by the signed token: user id, role and the
/// branch the user is pinned to (admins carry no branch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub branch_id: Option<String>,
    pub exp: usize,
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash password: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash)
        .and_then(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed))
        .is_ok()
}

pub fn issue_token(
    user_id: &str,
    username: &str,
    role: &str,
    branch_id: Option<&str>,
    secret: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = (chrono::Utc::now() + chrono::Duration::hours(TOKEN_TTL_HOURS)).timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        role: role.to_string(),
        branch_id: branch_id.map(|s| s.to_string()),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_token(token: &str, secret: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_roundtrip() {
        let hash = hash_password("hunter2").expect("hash");
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
        assert!(!verify_password("not-a-phc-string", "hunter2"));
    }

    #[test]
    fn token_roundtrip_preserves_claims() {
        let token = issue_token("u1", "kim", "instructor", Some("b1"), "secret").expect("issue");
        let claims = verify_token(&token, "secret").expect("verify");
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username, "kim");
        assert_eq!(claims.role, "instructor");
        assert_eq!(claims.branch_id.as_deref(), Some("b1"));
    }

    #[test]
    fn token_rejected_with_wrong_secret() {
        let token = issue_token("u1", "kim", "admin", None, "secret").expect("issue");
        assert!(verify_token(&token, "other-secret").is_none());
    }

    #[test]
    fn expired_token_rejected() {
        // Hand-roll an exp well past the default validation leeway.
        let claims = Claims {
            sub: "u1".to_string(),
            username: "kim".to_string(),
            role: "admin".to_string(),
            branch_id: None,
            exp: (chrono::Utc::now() - chrono::Duration::hours(2)).timestamp() as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .expect("encode");
        assert!(verify_token(&token, "secret").is_none());
    }
}
