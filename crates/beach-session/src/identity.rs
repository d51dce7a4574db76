use serde::{Deserialize, Serialize};

/// Profile of the signed-in user as returned by `GET identity/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    #[serde(alias = "name")]
    pub display_name: String,
    pub role: String,
}

impl Identity {
    pub fn has_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|role| *role == self.role)
    }
}

/// Externally observable session state. Authentication is derived from the
/// presence of an identity so the two can never disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    pub identity: Option<Identity>,
}

impl Session {
    pub fn authenticated(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn has_role(&self, roles: &[&str]) -> bool {
        self.identity
            .as_ref()
            .map(|identity| identity.has_role(roles))
            .unwrap_or(false)
    }
}
