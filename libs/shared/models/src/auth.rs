use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    /// Application role, read from `app_metadata.role` when the token's
    /// top-level role is the generic Supabase `authenticated`.
    pub fn app_role(&self) -> Option<&str> {
        match self.role.as_deref() {
            Some("authenticated") | None => self
                .metadata
                .as_ref()
                .and_then(|m| m.get("role"))
                .and_then(|r| r.as_str()),
            Some(role) => Some(role),
        }
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        self.app_role().map(|role| roles.contains(&role)).unwrap_or(false)
    }
}
