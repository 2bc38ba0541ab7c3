pub mod audit;

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Viewer,
    Auditor,
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Auditor => "auditor",
            Self::Operator => "operator",
            Self::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Self::Viewer),
            "auditor" => Some(Self::Auditor),
            "operator" => Some(Self::Operator),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Static action -> allowed-roles matrix. Deny-by-default: an action absent
/// from the matrix, or present with no entry for the caller's role, denies.
fn matrix() -> &'static HashMap<&'static str, &'static [Role]> {
    static MATRIX: OnceLock<HashMap<&'static str, &'static [Role]>> = OnceLock::new();
    MATRIX.get_or_init(|| {
        use Role::{Admin, Auditor, Operator, Viewer};
        let mut m: HashMap<&'static str, &'static [Role]> = HashMap::new();
        m.insert("vouchers.create", &[Operator, Admin]);
        m.insert("vouchers.view", &[Viewer, Auditor, Operator, Admin]);
        m.insert("grants.view", &[Viewer, Auditor, Operator, Admin]);
        m.insert("grants.extend", &[Operator, Admin]);
        m.insert("grants.revoke", &[Operator, Admin]);
        m.insert("integrations.view", &[Viewer, Auditor, Operator, Admin]);
        m.insert("integrations.manage", &[Admin]);
        m.insert("portal_config.view", &[Viewer, Auditor, Operator, Admin]);
        m.insert("portal_config.manage", &[Admin]);
        m.insert("audit.view", &[Auditor, Admin]);
        m
    })
}

/// Deny-by-default RBAC check.
pub fn is_allowed(role: Role, action: &str) -> bool {
    matrix()
        .get(action)
        .map(|roles| roles.contains(&role))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_denies_every_role() {
        for role in [Role::Viewer, Role::Auditor, Role::Operator, Role::Admin] {
            assert!(!is_allowed(role, "never.heard.of.this"));
        }
    }

    #[test]
    fn viewer_cannot_extend_grants() {
        assert!(!is_allowed(Role::Viewer, "grants.extend"));
        assert!(is_allowed(Role::Operator, "grants.extend"));
        assert!(is_allowed(Role::Admin, "grants.extend"));
    }

    #[test]
    fn only_admin_manages_integrations() {
        assert!(is_allowed(Role::Admin, "integrations.manage"));
        assert!(!is_allowed(Role::Operator, "integrations.manage"));
    }
}
