//! Source of the upstream credential.
//!
//! Each session asks the provider once, before its link is created.  The
//! relay ships with [`StaticCredentialProvider`], which hands out the key from
//! configuration; deployments that rotate keys can plug in their own
//! implementation.

use async_trait::async_trait;

use crate::domain::{Credential, RelayError};

/// Supplies the credential a new upstream link authenticates with.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns the credential, or [`RelayError::Credential`] when none is
    /// available.
    async fn credential(&self) -> Result<Credential, RelayError>;
}

/// Returns the same configured credential for every session.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credential: Credential,
}

impl StaticCredentialProvider {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credential(&self) -> Result<Credential, RelayError> {
        if self.credential.is_empty() {
            return Err(RelayError::Credential(
                "no upstream API key is configured".to_string(),
            ));
        }
        Ok(self.credential.clone())
    }
}
