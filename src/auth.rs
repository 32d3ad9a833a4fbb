use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::Actor;

/// Who may log in and who is an admin. Login user names are actor ULIDs;
/// everyone shares one password.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    password: String,
    admins: HashSet<Ulid>,
}

impl AccessPolicy {
    pub fn new(password: String, admins: HashSet<Ulid>) -> Self {
        Self { password, admins }
    }

    pub fn resolve_actor(&self, user: &str) -> PgWireResult<Actor> {
        let id = Ulid::from_string(user.trim()).map_err(|_| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user name must be a ULID, got {user:?}"),
            )))
        })?;
        Ok(if self.admins.contains(&id) {
            Actor::admin(id)
        } else {
            Actor::customer(id)
        })
    }
}

#[derive(Debug)]
pub struct SlotbookAuthSource {
    policy: Arc<AccessPolicy>,
}

impl SlotbookAuthSource {
    pub fn new(policy: Arc<AccessPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        self.policy.resolve_actor(login.user().unwrap_or_default())?;
        Ok(Password::new(None, self.policy.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn admins_are_recognised() {
        let admin = Ulid::new();
        let policy = AccessPolicy::new("secret".into(), [admin].into());
        assert_eq!(policy.resolve_actor(&admin.to_string()).unwrap().role, Role::Admin);
        let other = Ulid::new();
        let actor = policy.resolve_actor(&other.to_string()).unwrap();
        assert_eq!(actor.role, Role::Customer);
        assert_eq!(actor.id, other);
    }

    #[test]
    fn non_ulid_user_rejected() {
        let policy = AccessPolicy::new("secret".into(), HashSet::new());
        assert!(policy.resolve_actor("postgres").is_err());
    }
}
