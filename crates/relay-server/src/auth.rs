//! Connection authorization.
//!
//! The relay only consumes a pass/fail decision: a credential either resolves
//! to an [`Identity`] or the upgrade is refused.

use crate::config::AuthConfig;
use relay_core::Identity;
use std::collections::HashMap;
use thiserror::Error;

/// Authorization errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("Missing token")]
    MissingToken,

    /// The credential is not recognized.
    #[error("Unknown token")]
    UnknownToken,
}

/// Resolves a credential to an identity.
pub trait Authorizer: Send + Sync {
    /// Authorize a credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is rejected.
    fn authorize(&self, credential: Option<&str>) -> Result<Identity, AuthError>;
}

/// Static token table with optional anonymous access.
#[derive(Debug, Default)]
pub struct TokenAuthorizer {
    tokens: HashMap<String, Identity>,
    anonymous_label: Option<String>,
}

impl TokenAuthorizer {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    Identity::new(entry.id.clone(), entry.label.clone()),
                )
            })
            .collect();

        Self {
            tokens,
            anonymous_label: config
                .allow_anonymous
                .then(|| config.anonymous_label.clone()),
        }
    }

    /// Number of known tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Check if no token is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        let known = credential
            .filter(|token| !token.is_empty())
            .and_then(|token| self.tokens.get(token));

        match (known, &self.anonymous_label) {
            (Some(identity), _) => Ok(identity.clone()),
            (None, Some(label)) => Ok(Identity::generate(label.clone())),
            (None, None) if credential.map_or(true, str::is_empty) => Err(AuthError::MissingToken),
            (None, None) => Err(AuthError::UnknownToken),
        }
    }
}
