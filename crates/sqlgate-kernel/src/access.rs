//! User → role → (resource, action) authorization for non-SQL operations.

use std::collections::{BTreeMap, BTreeSet};

use sqlgate_contracts::{AccessDecision, AccessRequest};

use crate::trail::Trail;

pub const CODE_SECURITY_ALERT: &str = "SECURITY_ALERT";
pub const CODE_ACCESS_GRANTED: &str = "ACCESS_GRANTED";
pub const CODE_ACCESS_DENIED: &str = "ACCESS_DENIED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub role: String,
}

/// role → resource → permitted actions
pub type Grants = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

#[derive(Debug, Clone, Default)]
pub struct AccessMatrix {
    users: BTreeMap<String, UserRecord>,
    grants: Grants,
}

impl AccessMatrix {
    pub fn new(users: BTreeMap<String, UserRecord>, grants: Grants) -> Self {
        Self { users, grants }
    }

    pub fn user(&self, user_id: &str) -> Option<&UserRecord> {
        self.users.get(user_id)
    }

    /// Unknown roles, resources and actions all answer `false`.
    pub fn role_permits(&self, role: &str, resource: &str, action: &str) -> bool {
        self.grants
            .get(role)
            .and_then(|resources| resources.get(resource))
            .is_some_and(|actions| actions.contains(action))
    }

    pub fn authorize(&self, correlation_id: &str, request: &AccessRequest) -> AccessDecision {
        let mut trail = Trail::new(correlation_id);
        let user_id = request.user_id.trim();

        let Some(user) = self.users.get(user_id) else {
            trail.record(
                CODE_SECURITY_ALERT,
                format!("access attempt by unknown user id {user_id}"),
            );
            return AccessDecision {
                allowed: false,
                role: None,
                reason: format!("unknown user: {user_id}"),
                log_trail: trail.into_entries(),
            };
        };

        let allowed = self.role_permits(&user.role, &request.resource, &request.action);
        let (code, verb) = if allowed {
            (CODE_ACCESS_GRANTED, "authorized for")
        } else {
            (CODE_ACCESS_DENIED, "denied access for")
        };
        let reason = format!(
            "{} ({user_id}) {verb} {} on {}",
            user.role, request.action, request.resource
        );
        trail.record(code, &reason);

        AccessDecision {
            allowed,
            role: Some(user.role.clone()),
            reason,
            log_trail: trail.into_entries(),
        }
    }
}
