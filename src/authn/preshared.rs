use std::collections::HashSet;
use std::sync::Arc;

use super::AuthnError;
use crate::error::{Error, Result};

/// Accepts bearer tokens equal to one of a fixed set of keys.
#[derive(Clone, Debug)]
pub struct KeyAuthn {
    keys: Arc<HashSet<String>>,
}

impl KeyAuthn {
    /// Builds the validator.
    ///
    /// # Errors
    /// Fails when no keys are configured or any key is blank.
    pub fn new(keys: &[String]) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::AuthnConfig(
                "preshared authentication requires at least one key".to_string(),
            ));
        }
        if keys.iter().any(|k| k.trim().is_empty()) {
            return Err(Error::AuthnConfig(
                "preshared keys must not be blank".to_string(),
            ));
        }

        Ok(Self {
            keys: Arc::new(keys.iter().cloned().collect()),
        })
    }

    /// Checks a bearer key.
    ///
    /// # Errors
    /// Returns [`AuthnError::InvalidKey`] when the key is not configured.
    pub fn validate(&self, key: &str) -> std::result::Result<(), AuthnError> {
        if self.keys.contains(key) {
            Ok(())
        } else {
            Err(AuthnError::InvalidKey)
        }
    }
}
