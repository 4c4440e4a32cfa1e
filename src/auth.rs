use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;

use crate::model::Actor;

/// Shared-password check. The user name must also be a well-formed identity;
/// verifying that identity is the job of whatever sits in front of us.
#[derive(Debug)]
pub struct BookdAuthSource {
    password: String,
}

impl BookdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for BookdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if Actor::parse(user).is_none() {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!(user, "login rejected: user name is not an identity");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user must be customer:<id>, professional:<id>, admin or gateway, got {user:?}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
