use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::UserMappingConfig;
use crate::errors::RunError;

/// The principal a request is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    Anonymous,
    User(String),
}

impl Identity {
    pub fn user(name: impl Into<String>) -> Self {
        Identity::User(name.into())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::User(name) => Some(name),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => write!(f, "<anonymous>"),
            Identity::User(name) => write!(f, "{name}"),
        }
    }
}

/// Maps an authenticated principal onto the local account its worker runs as.
#[derive(Debug, Clone)]
pub struct LocalUserMapper {
    default_local_user: Option<String>,
    pattern: Regex,
}

impl LocalUserMapper {
    pub fn new(config: &UserMappingConfig) -> Result<Self, RunError> {
        let pattern = Regex::new(&config.local_user_pattern).map_err(|e| {
            RunError::invalid_argument(format!(
                "local user pattern '{}' does not compile: {e}",
                config.local_user_pattern
            ))
        })?;
        Ok(Self {
            default_local_user: config.default_local_user.clone(),
            pattern,
        })
    }

    pub fn local_user_for(&self, identity: &Identity) -> Result<String, RunError> {
        let candidate = match (&self.default_local_user, identity) {
            (Some(fixed), _) => fixed.clone(),
            (None, Identity::User(name)) => name.to_lowercase(),
            (None, Identity::Anonymous) => {
                return Err(RunError::admission_denied(
                    "anonymous callers have no local account",
                ))
            }
        };

        if !self.pattern.is_match(&candidate) {
            return Err(RunError::admission_denied(format!(
                "'{candidate}' is not an acceptable local account name"
            )));
        }
        Ok(candidate)
    }
}
