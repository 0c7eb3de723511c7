//! Authentication boundary.
//!
//! Token verification is external to the dispatch core: the transport layer
//! hands the handshake token to an [`Authenticator`] and receives a
//! [`Principal`] or a rejection. The core never inspects tokens itself.
//!
//! The bundled [`TokenRegistry`] is a static token table (loadable from
//! TOML) used by deployments that terminate real authentication upstream,
//! and by tests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Principal
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Captain,
    Customer,
    Admin,
    Dispatcher,
    Manager,
    Support,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Captain => write!(f, "captain"),
            Self::Customer => write!(f, "customer"),
            Self::Admin => write!(f, "admin"),
            Self::Dispatcher => write!(f, "dispatcher"),
            Self::Manager => write!(f, "manager"),
            Self::Support => write!(f, "support"),
        }
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Principal {
    /// Live-tracking access: staff roles, or the explicit permission.
    pub fn can_track_locations(&self) -> bool {
        matches!(
            self.role,
            Role::Admin | Role::Dispatcher | Role::Manager | Role::Support
        ) || self.permissions.iter().any(|p| p == "location_tracking")
    }
}

// ============================================================================
// Authenticator port
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token does not grant access to this namespace")]
    WrongRole,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}

// ============================================================================
// Static token registry
// ============================================================================

/// TOML shape: a list of `[[tokens]]` entries.
#[derive(Debug, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    token: String,
    #[serde(flatten)]
    principal: Principal,
}

/// In-memory token table.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: HashMap<String, Principal>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: &str, principal: Principal) {
        self.tokens.insert(token.to_owned(), principal);
    }

    /// Load a token table from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, crate::config::ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| {
            crate::config::ConfigError::Io { path: path.to_owned(), source }
        })?;
        let file: TokenFile = toml::from_str(&raw)?;
        let mut registry = Self::new();
        for entry in file.tokens {
            registry.insert(&entry.token, entry.principal);
        }
        tracing::info!(count = registry.tokens.len(), path = %path, "Token registry loaded");
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenRegistry {
    fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: Role) -> Principal {
        Principal {
            id: "u1".to_owned(),
            role,
            name: None,
            phone: None,
            permissions: Vec::new(),
        }
    }

    #[test]
    fn registry_authenticates_known_tokens_only() {
        let mut registry = TokenRegistry::new();
        registry.insert("tok-1", principal(Role::Captain));
        assert_eq!(registry.authenticate("tok-1").unwrap().role, Role::Captain);
        assert!(matches!(
            registry.authenticate("tok-2"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn tracking_permission_by_role_or_grant() {
        assert!(principal(Role::Admin).can_track_locations());
        assert!(principal(Role::Support).can_track_locations());
        assert!(!principal(Role::Captain).can_track_locations());

        let mut granted = principal(Role::Customer);
        granted.permissions.push("location_tracking".to_owned());
        assert!(granted.can_track_locations());
    }

    #[test]
    fn token_file_parses() {
        let file: TokenFile = toml::from_str(
            r#"
[[tokens]]
token = "cap-1"
id = "c1"
role = "captain"
name = "Ali"

[[tokens]]
token = "adm-1"
id = "a1"
role = "admin"
permissions = ["location_tracking"]
"#,
        )
        .unwrap();
        assert_eq!(file.tokens.len(), 2);
        assert_eq!(file.tokens[0].principal.role, Role::Captain);
    }
}
