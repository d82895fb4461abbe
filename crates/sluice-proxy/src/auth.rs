//! Client credential checks.

use std::collections::BTreeMap;

use sluice_core::{Config, SecretHash};

use crate::error::{ProxyError, ProxyResult};

/// Users allowed to log in, with their stored secret hashes.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: BTreeMap<String, SecretHash>,
}

impl CredentialStore {
    pub fn new(users: BTreeMap<String, SecretHash>) -> Self {
        Self { users }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.users.clone())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check `password` for `user`. Unknown users and wrong passwords fail alike.
    pub fn verify(&self, user: &str, password: &str) -> ProxyResult<()> {
        match self.users.get(user) {
            Some(secret) if secret.verify(password) => Ok(()),
            Some(_) => Err(ProxyError::Auth(format!("wrong password for user {user:?}"))),
            None => {
                // Spend the same hashing work as a real check.
                let _ = SecretHash::from_password(password);
                Err(ProxyError::Auth(format!("unknown user {user:?}")))
            }
        }
    }
}
