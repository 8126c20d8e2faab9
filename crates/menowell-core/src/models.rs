//! Identity types shared by the auth layer and the backend adapters.

use serde::{Deserialize, Serialize};

/// A user identity as resolved by the identity backend (or recovered from
/// an offline session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl AuthUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            display_name: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Name to greet the user with
    pub fn display(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Email/password pair handed to the identity backend.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefers_name_then_email() {
        let user = AuthUser::new("u1");
        assert_eq!(user.display(), "u1");

        let user = user.with_email("a@example.com");
        assert_eq!(user.display(), "a@example.com");

        let user = AuthUser {
            display_name: Some("Ana".to_string()),
            ..user
        };
        assert_eq!(user.display(), "Ana");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("a@example.com", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("a@example.com"));
        assert!(!debug.contains("hunter2"));
    }
}
