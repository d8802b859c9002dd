use std::collections::HashMap;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::{AuthContext, Role};

/// Connection metadata key holding the login user.
pub const LOGIN_USER_KEY: &str = "user";
/// Set by `SET SESSION AUTHORIZATION`; wins over the login user.
pub const SESSION_USER_KEY: &str = "tabletime.session_user";
/// Set by `SET ROLE`.
pub const ROLE_KEY: &str = "tabletime.role";

/// Shared-password auth. The booking front end logs in once and asserts the
/// acting user and role per session.
#[derive(Debug)]
pub struct ClubAuthSource {
    password: String,
}

impl ClubAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ClubAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if login.user().as_deref().is_none_or(|u| u.trim().is_empty()) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "a user name is required".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Who the current session acts as. Unknown roles fall back to player.
pub fn auth_context(metadata: &HashMap<String, String>) -> AuthContext {
    let user = metadata
        .get(SESSION_USER_KEY)
        .or_else(|| metadata.get(LOGIN_USER_KEY))
        .cloned()
        .unwrap_or_default();
    let role = metadata
        .get(ROLE_KEY)
        .and_then(|r| Role::parse(r))
        .unwrap_or(Role::Player);
    AuthContext::new(user, role)
}
