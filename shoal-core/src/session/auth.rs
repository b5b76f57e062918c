//! Credential checks for `SESSION_INIT`.

use std::sync::Arc;

use tracing::warn;

use crate::config::ServerConfig;
use crate::error::ServerError;

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, user: &str, password: &[u8]) -> Result<(), ServerError>;
}

/// Accepts every user; used when no credentials are configured.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _user: &str, _password: &[u8]) -> Result<(), ServerError> {
        Ok(())
    }
}

pub struct StaticCredentials {
    user: String,
    password: Vec<u8>,
}

impl StaticCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, user: &str, password: &[u8]) -> Result<(), ServerError> {
        if user.eq_ignore_ascii_case(&self.user) && password == self.password.as_slice() {
            Ok(())
        } else {
            warn!(user, "rejected credentials");
            Err(ServerError::AuthenticationFailed)
        }
    }
}

pub fn from_config(config: &ServerConfig) -> Arc<dyn Authenticator> {
    match (&config.auth_user, &config.auth_password) {
        (Some(user), Some(password)) => Arc::new(StaticCredentials::new(
            user.clone(),
            password.as_bytes().to_vec(),
        )),
        _ => Arc::new(AllowAll),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_check_user_and_password() {
        let auth = StaticCredentials::new("SA", b"secret".to_vec());
        assert!(auth.authenticate("sa", b"secret").is_ok());
        assert!(matches!(
            auth.authenticate("sa", b"wrong"),
            Err(ServerError::AuthenticationFailed)
        ));
    }

    #[test]
    fn config_without_credentials_allows_all() {
        let auth = from_config(&ServerConfig::default());
        assert!(auth.authenticate("anyone", b"").is_ok());
    }
}
