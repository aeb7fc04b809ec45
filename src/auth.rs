use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::Caller;

/// Shared-password source: every role authenticates with the same secret and
/// the role name decides what the session may do.
#[derive(Debug)]
pub struct PtAuthSource {
    password: String,
}

impl PtAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for PtAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Map a login role to a caller: `admin`, `trainer:<name>` or `member:<id>`.
pub fn caller_from_login(user: &str) -> Option<Caller> {
    let user = user.trim();
    if user == "admin" {
        return Some(Caller::Admin);
    }
    let (kind, name) = user.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    match kind {
        "trainer" => Some(Caller::Trainer(name.to_string())),
        "member" => Some(Caller::Member(name.to_string())),
        _ => None,
    }
}
