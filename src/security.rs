//! Per-run security: who besides the owner may touch a run, and the credential
//! material the worker needs to talk to secured services on the owner's
//! behalf.
//!
//! Material is pushed to the worker exactly once, immediately before the run
//! starts executing. After that the delegate is sealed.

use async_trait::async_trait;
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::errors::{RemoteError, RunError};
use crate::identity::Identity;
use crate::run::validate_filename;

/// Access level granted to an identity on a single run. Each level implies the
/// ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    None,
    Read,
    Update,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    Password {
        service_uri: String,
        username: String,
        password: String,
    },
    KeyPair {
        service_uri: String,
        /// Key store file inside the run's working directory.
        key_file: String,
        alias: String,
        unlock_password: String,
    },
}

impl Credential {
    pub fn service_uri(&self) -> &str {
        match self {
            Credential::Password { service_uri, .. } | Credential::KeyPair { service_uri, .. } => {
                service_uri
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TrustedIdentity {
    /// Certificate file inside the run's working directory.
    CertificateFile(String),
    Pem(String),
}

/// Everything the worker receives in one conveyance.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityMaterial {
    pub owner: String,
    pub credentials: Vec<(String, Credential)>,
    pub trusted: Vec<(String, TrustedIdentity)>,
    pub keystore_password: String,
    pub uri_to_alias: BTreeMap<String, String>,
}

impl fmt::Debug for SecurityMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityMaterial")
            .field("owner", &self.owner)
            .field("credentials", &self.credentials.len())
            .field("trusted", &self.trusted.len())
            .field("keystore_password", &"<redacted>")
            .field("uri_to_alias", &self.uri_to_alias)
            .finish()
    }
}

/// Worker-side receiver of security material.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RemoteSecurityContext: Send + Sync {
    async fn install(&self, material: SecurityMaterial) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone)]
struct CredentialRules {
    uri: Regex,
    keystore_password_length: usize,
}

impl CredentialRules {
    fn new(config: &SecurityConfig) -> Result<Self, RunError> {
        let schemes = config
            .allowed_uri_schemes
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");
        let uri = Regex::new(&format!(r"^(?i:{schemes})://[^/\s?#]+(/\S*)?$")).map_err(|e| {
            RunError::invalid_argument(format!("allowed URI schemes do not form a pattern: {e}"))
        })?;
        Ok(Self {
            uri,
            keystore_password_length: config.keystore_password_length.max(8),
        })
    }

    fn validate_uri(&self, uri: &str) -> Result<(), RunError> {
        if self.uri.is_match(uri) {
            Ok(())
        } else {
            Err(RunError::invalid_credential(format!(
                "'{uri}' is not an absolute URI with a permitted scheme"
            )))
        }
    }

    fn validate_credential(&self, credential: &Credential) -> Result<(), RunError> {
        self.validate_uri(credential.service_uri())?;
        match credential {
            Credential::Password {
                username, password, ..
            } => {
                if username.trim().is_empty() {
                    return Err(RunError::invalid_credential("username is empty"));
                }
                if password.is_empty() {
                    return Err(RunError::invalid_credential("password is empty"));
                }
            }
            Credential::KeyPair {
                key_file,
                alias,
                unlock_password,
                ..
            } => {
                validate_filename(key_file)?;
                if alias.trim().is_empty() {
                    return Err(RunError::invalid_credential("key alias is empty"));
                }
                if unlock_password.is_empty() {
                    return Err(RunError::invalid_credential("key unlock password is empty"));
                }
            }
        }
        Ok(())
    }

    fn validate_trusted(&self, trusted: &TrustedIdentity) -> Result<(), RunError> {
        match trusted {
            TrustedIdentity::CertificateFile(path) => validate_filename(path),
            TrustedIdentity::Pem(pem) => {
                let pem = pem.trim();
                if pem.starts_with("-----BEGIN CERTIFICATE-----")
                    && pem.ends_with("-----END CERTIFICATE-----")
                {
                    Ok(())
                } else {
                    Err(RunError::invalid_credential(
                        "trusted identity is not a PEM certificate",
                    ))
                }
            }
        }
    }

    fn keystore_password(&self) -> String {
        rand::rng()
            .sample_iter(Alphanumeric)
            .take(self.keystore_password_length)
            .map(char::from)
            .collect()
    }
}

/// Ownership, per-identity permissions and credentials of one run.
pub struct SecurityDelegate {
    owner: String,
    rules: CredentialRules,
    permissions: RwLock<HashMap<String, Permission>>,
    credentials: Mutex<Vec<(String, Credential)>>,
    trusted: Mutex<Vec<(String, TrustedIdentity)>>,
    conveyed: AtomicBool,
}

impl fmt::Debug for SecurityDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityDelegate")
            .field("owner", &self.owner)
            .field("conveyed", &self.is_sealed())
            .finish_non_exhaustive()
    }
}

impl SecurityDelegate {
    fn new(owner: String, rules: CredentialRules) -> Self {
        Self {
            owner,
            rules,
            permissions: RwLock::new(HashMap::new()),
            credentials: Mutex::new(Vec::new()),
            trusted: Mutex::new(Vec::new()),
            conveyed: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_owner(&self, identity: &Identity) -> bool {
        identity.name() == Some(self.owner.as_str())
    }

    pub fn permission(&self, identity: &Identity) -> Permission {
        if self.is_owner(identity) {
            return Permission::Destroy;
        }
        let Some(name) = identity.name() else {
            return Permission::None;
        };
        self.permissions
            .read()
            .map(|p| p.get(name).copied().unwrap_or(Permission::None))
            .unwrap_or(Permission::None)
    }

    pub fn permits(&self, identity: &Identity, needed: Permission) -> bool {
        self.permission(identity) >= needed
    }

    pub fn set_permission(&self, user: &str, level: Permission) -> Result<(), RunError> {
        if user == self.owner {
            return Err(RunError::invalid_argument(
                "the owner's permissions cannot be changed",
            ));
        }
        let mut permissions = self
            .permissions
            .write()
            .map_err(|_| RunError::implementation("permission table poisoned"))?;
        if level == Permission::None {
            permissions.remove(user);
        } else {
            permissions.insert(user.to_string(), level);
        }
        Ok(())
    }

    fn holders(&self, level: Permission) -> Vec<String> {
        let mut holders: Vec<String> = self
            .permissions
            .read()
            .map(|p| {
                p.iter()
                    .filter(|(_, granted)| **granted >= level)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        holders.sort();
        holders
    }

    pub fn readers(&self) -> Vec<String> {
        self.holders(Permission::Read)
    }

    pub fn updaters(&self) -> Vec<String> {
        self.holders(Permission::Update)
    }

    pub fn destroyers(&self) -> Vec<String> {
        self.holders(Permission::Destroy)
    }

    pub fn is_sealed(&self) -> bool {
        self.conveyed.load(Ordering::Acquire)
    }

    fn ensure_unsealed(&self) -> Result<(), RunError> {
        if self.is_sealed() {
            Err(RunError::bad_state(
                "security material has already been conveyed to the worker",
            ))
        } else {
            Ok(())
        }
    }

    pub fn add_credential(&self, credential: Credential) -> Result<String, RunError> {
        self.ensure_unsealed()?;
        self.rules.validate_credential(&credential)?;
        let id = Uuid::new_v4().to_string();
        self.credentials
            .lock()
            .map_err(|_| RunError::implementation("credential list poisoned"))?
            .push((id.clone(), credential));
        Ok(id)
    }

    pub fn remove_credential(&self, id: &str) -> Result<(), RunError> {
        self.ensure_unsealed()?;
        let mut credentials = self
            .credentials
            .lock()
            .map_err(|_| RunError::implementation("credential list poisoned"))?;
        let before = credentials.len();
        credentials.retain(|(existing, _)| existing != id);
        if credentials.len() == before {
            return Err(RunError::invalid_argument(format!("no credential '{id}'")));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Vec<(String, Credential)> {
        self.credentials
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn add_trusted(&self, trusted: TrustedIdentity) -> Result<String, RunError> {
        self.ensure_unsealed()?;
        self.rules.validate_trusted(&trusted)?;
        let id = Uuid::new_v4().to_string();
        self.trusted
            .lock()
            .map_err(|_| RunError::implementation("trusted identity list poisoned"))?
            .push((id.clone(), trusted));
        Ok(id)
    }

    pub fn remove_trusted(&self, id: &str) -> Result<(), RunError> {
        self.ensure_unsealed()?;
        let mut trusted = self
            .trusted
            .lock()
            .map_err(|_| RunError::implementation("trusted identity list poisoned"))?;
        let before = trusted.len();
        trusted.retain(|(existing, _)| existing != id);
        if trusted.len() == before {
            return Err(RunError::invalid_argument(format!(
                "no trusted identity '{id}'"
            )));
        }
        Ok(())
    }

    pub fn trusted(&self) -> Vec<(String, TrustedIdentity)> {
        self.trusted.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn assemble(&self) -> SecurityMaterial {
        let credentials = self.credentials();
        let uri_to_alias = credentials
            .iter()
            .map(|(id, credential)| {
                let alias = match credential {
                    Credential::KeyPair { alias, .. } => alias.clone(),
                    Credential::Password { .. } => format!("password#{id}"),
                };
                (credential.service_uri().to_string(), alias)
            })
            .collect();

        SecurityMaterial {
            owner: self.owner.clone(),
            credentials,
            trusted: self.trusted(),
            keystore_password: self.rules.keystore_password(),
            uri_to_alias,
        }
    }

    /// Push the assembled material to the worker. One shot: the delegate is
    /// sealed before the remote call so a concurrent second caller cannot
    /// convey a diverging copy.
    pub async fn convey(&self, context: &dyn RemoteSecurityContext) -> Result<(), RunError> {
        if self
            .conveyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RunError::bad_state("security material already conveyed"));
        }

        let material = self.assemble();
        let credential_count = material.credentials.len();
        let trusted_count = material.trusted.len();

        if let Err(e) = context.install(material).await {
            self.conveyed.store(false, Ordering::Release);
            return Err(e.into());
        }

        info!(
            owner = %self.owner,
            credentials = credential_count,
            trusted = trusted_count,
            "Security material conveyed to worker"
        );
        Ok(())
    }
}

/// Opaque reference to a delegate held by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegateHandle(Uuid);

impl fmt::Display for DelegateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creates security delegates and resolves them by handle.
#[derive(Debug)]
pub struct SecurityContextFactory {
    rules: CredentialRules,
    delegates: RwLock<HashMap<DelegateHandle, Arc<SecurityDelegate>>>,
}

impl SecurityContextFactory {
    pub fn new(config: &SecurityConfig) -> Result<Self, RunError> {
        Ok(Self {
            rules: CredentialRules::new(config)?,
            delegates: RwLock::new(HashMap::new()),
        })
    }

    pub fn create(&self, owner: &str) -> Result<DelegateHandle, RunError> {
        let handle = DelegateHandle(Uuid::new_v4());
        let delegate = Arc::new(SecurityDelegate::new(owner.to_string(), self.rules.clone()));
        self.delegates
            .write()
            .map_err(|_| RunError::implementation("delegate table poisoned"))?
            .insert(handle, delegate);
        debug!(owner = %owner, handle = %handle, "Security delegate created");
        Ok(handle)
    }

    pub fn resolve(&self, handle: DelegateHandle) -> Result<Arc<SecurityDelegate>, RunError> {
        self.delegates
            .read()
            .map_err(|_| RunError::implementation("delegate table poisoned"))?
            .get(&handle)
            .cloned()
            .ok_or_else(|| RunError::bad_state(format!("security context {handle} was released")))
    }

    pub fn release(&self, handle: DelegateHandle) {
        if let Ok(mut delegates) = self.delegates.write() {
            delegates.remove(&handle);
        }
    }

    pub fn len(&self) -> usize {
        self.delegates.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> SecurityContextFactory {
        SecurityContextFactory::new(&SecurityConfig::default()).unwrap()
    }

    fn delegate(owner: &str) -> Arc<SecurityDelegate> {
        let factory = factory();
        let handle = factory.create(owner).unwrap();
        factory.resolve(handle).unwrap()
    }

    fn password(uri: &str) -> Credential {
        Credential::Password {
            service_uri: uri.to_string(),
            username: "alice".to_string(),
            password: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_owner_holds_every_permission() {
        let d = delegate("alice");
        assert!(d.permits(&Identity::user("alice"), Permission::Destroy));
        assert!(!d.permits(&Identity::user("bob"), Permission::Read));
        assert!(!d.permits(&Identity::Anonymous, Permission::Read));
    }

    #[test]
    fn test_higher_permission_implies_lower() {
        let d = delegate("alice");
        d.set_permission("bob", Permission::Update).unwrap();
        d.set_permission("carol", Permission::Read).unwrap();

        assert!(d.permits(&Identity::user("bob"), Permission::Read));
        assert!(!d.permits(&Identity::user("bob"), Permission::Destroy));
        assert_eq!(d.readers(), vec!["bob".to_string(), "carol".to_string()]);
        assert_eq!(d.updaters(), vec!["bob".to_string()]);
        assert!(d.destroyers().is_empty());

        d.set_permission("bob", Permission::None).unwrap();
        assert!(!d.permits(&Identity::user("bob"), Permission::Read));
        assert!(d.set_permission("alice", Permission::Read).is_err());
    }

    #[test]
    fn test_credentials_are_validated_on_add() {
        let d = delegate("alice");
        assert!(d.add_credential(password("https://example.org/service")).is_ok());

        let err = d.add_credential(password("ftp://example.org")).unwrap_err();
        assert!(matches!(err, RunError::InvalidCredential { .. }));
        assert!(d.add_credential(password("not a uri")).is_err());

        let err = d
            .add_credential(Credential::KeyPair {
                service_uri: "https://example.org".to_string(),
                key_file: "../../home/alice/.ssh/id".to_string(),
                alias: "me".to_string(),
                unlock_password: "pw".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, RunError::InvalidPath { .. }));

        assert!(d.add_trusted(TrustedIdentity::Pem("garbage".to_string())).is_err());
        assert!(d
            .add_trusted(TrustedIdentity::CertificateFile("certs/ca.pem".to_string()))
            .is_ok());
        assert_eq!(d.credentials().len(), 1);
    }

    #[tokio::test]
    async fn test_convey_is_one_shot_and_seals() {
        let d = delegate("alice");
        d.add_credential(password("https://example.org/a")).unwrap();

        let mut context = MockRemoteSecurityContext::new();
        context
            .expect_install()
            .withf(|material| {
                material.owner == "alice"
                    && material.credentials.len() == 1
                    && material.keystore_password.len() == 32
                    && material.uri_to_alias.contains_key("https://example.org/a")
            })
            .times(1)
            .returning(|_| Ok(()));

        d.convey(&context).await.unwrap();
        assert!(d.is_sealed());
        assert!(matches!(
            d.convey(&context).await.unwrap_err(),
            RunError::BadState { .. }
        ));
        assert!(matches!(
            d.add_credential(password("https://example.org/b")).unwrap_err(),
            RunError::BadState { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_convey_can_be_retried() {
        let d = delegate("alice");
        let mut context = MockRemoteSecurityContext::new();
        let mut calls = 0;
        context.expect_install().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(RemoteError::Unreachable("worker gone".to_string()))
            } else {
                Ok(())
            }
        });

        assert!(matches!(
            d.convey(&context).await.unwrap_err(),
            RunError::ConnectivityFailure { .. }
        ));
        assert!(!d.is_sealed());
        d.convey(&context).await.unwrap();
    }

    #[test]
    fn test_released_handles_no_longer_resolve() {
        let factory = factory();
        let handle = factory.create("alice").unwrap();
        assert_eq!(factory.len(), 1);
        factory.release(handle);
        assert!(factory.resolve(handle).is_err());
        assert!(factory.is_empty());
    }
}
