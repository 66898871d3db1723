//! In-memory principal directory.
//!
//! Principals are created by registration or by a first federated login and are
//! only ever soft-deleted. Passwords are stored as Argon2id PHC strings.

use anyhow::{Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use utoipa::ToSchema;

use super::{
    clock::Clock,
    error::{AuthError, AuthResult},
    types::{Factor, PrincipalId},
};

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 1024;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    #[schema(value_type = String, format = Uuid)]
    pub principal_id: PrincipalId,
    pub username: Option<String>,
    pub factors: BTreeSet<Factor>,
    /// Federation issuer -> external subject id.
    pub federated_identities: BTreeMap<String, String>,
    pub deactivated: bool,
    pub created_at: DateTime<Utc>,
}

struct PrincipalRecord {
    principal: Principal,
    password_hash: Option<String>,
}

/// What password verification needs, copied out of the directory.
pub(crate) struct PasswordEntry {
    pub principal_id: PrincipalId,
    pub password_hash: String,
    pub deactivated: bool,
}

pub struct PrincipalDirectory {
    clock: Arc<dyn Clock>,
    principals: DashMap<PrincipalId, PrincipalRecord>,
    usernames: DashMap<String, PrincipalId>,
    federated: DashMap<(String, String), PrincipalId>,
}

impl PrincipalDirectory {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            principals: DashMap::new(),
            usernames: DashMap::new(),
            federated: DashMap::new(),
        }
    }

    /// Register a password principal.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for a malformed username or weak password,
    /// `PrincipalExists` if the username is taken, `Internal` if hashing fails.
    pub async fn register(&self, username: &str, password: &SecretString) -> AuthResult<Principal> {
        let username = normalize_username(username);
        if !valid_username(&username) {
            return Err(AuthError::InvalidRequest(
                "username must be 3-32 characters of a-z, 0-9, '.', '_' or '-'".to_string(),
            ));
        }
        let length = password.expose_secret().chars().count();
        if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&length) {
            return Err(AuthError::InvalidRequest(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }
        if self.usernames.contains_key(&username) {
            return Err(AuthError::PrincipalExists);
        }

        let password = password.clone();
        let password_hash =
            tokio::task::spawn_blocking(move || hash_password(password.expose_secret()))
                .await
                .map_err(|err| anyhow!("password hashing task failed: {err}"))??;

        let principal = Principal {
            principal_id: PrincipalId::new(),
            username: Some(username.clone()),
            factors: BTreeSet::from([Factor::Password]),
            federated_identities: BTreeMap::new(),
            deactivated: false,
            created_at: self.clock.now(),
        };

        // The username slot is the uniqueness point; a concurrent register loses here.
        match self.usernames.entry(username) {
            Entry::Occupied(_) => return Err(AuthError::PrincipalExists),
            Entry::Vacant(slot) => {
                slot.insert(principal.principal_id);
            }
        }
        self.principals.insert(
            principal.principal_id,
            PrincipalRecord {
                principal: principal.clone(),
                password_hash: Some(password_hash),
            },
        );
        Ok(principal)
    }

    pub(crate) fn password_entry(&self, username: &str) -> Option<PasswordEntry> {
        let principal_id = *self.usernames.get(&normalize_username(username))?;
        let record = self.principals.get(&principal_id)?;
        Some(PasswordEntry {
            principal_id,
            password_hash: record.password_hash.clone()?,
            deactivated: record.principal.deactivated,
        })
    }

    /// Resolve a federated identity, creating the principal on first sight.
    ///
    /// # Errors
    /// Returns `Internal` if the index points at a missing record.
    pub fn find_or_create_federated(&self, issuer: &str, subject: &str) -> AuthResult<Principal> {
        let key = (issuer.to_string(), subject.to_string());
        let principal_id = match self.federated.entry(key) {
            Entry::Occupied(existing) => *existing.get(),
            Entry::Vacant(slot) => {
                let principal = Principal {
                    principal_id: PrincipalId::new(),
                    username: None,
                    factors: BTreeSet::from([Factor::Federated]),
                    federated_identities: BTreeMap::from([(
                        issuer.to_string(),
                        subject.to_string(),
                    )]),
                    deactivated: false,
                    created_at: self.clock.now(),
                };
                self.principals.insert(
                    principal.principal_id,
                    PrincipalRecord {
                        principal: principal.clone(),
                        password_hash: None,
                    },
                );
                slot.insert(principal.principal_id);
                return Ok(principal);
            }
        };
        self.get(principal_id)
            .ok_or_else(|| AuthError::Internal("federated index out of sync".to_string()))
    }

    /// Link an external identity to an existing principal.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for an unknown principal and `PrincipalExists`
    /// when the identity is already linked to someone else.
    pub fn link_federated(
        &self,
        principal_id: PrincipalId,
        issuer: &str,
        subject: &str,
    ) -> AuthResult<Principal> {
        if !self.principals.contains_key(&principal_id) {
            return Err(AuthError::InvalidRequest("unknown principal".to_string()));
        }
        match self.federated.entry((issuer.to_string(), subject.to_string())) {
            Entry::Occupied(existing) if *existing.get() != principal_id => {
                return Err(AuthError::PrincipalExists);
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(principal_id);
            }
        }
        self.update(principal_id, |principal| {
            principal
                .federated_identities
                .insert(issuer.to_string(), subject.to_string());
            principal.factors.insert(Factor::Federated);
        })
    }

    /// Record a newly verified factor.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if the principal does not exist.
    pub fn add_factor(&self, principal_id: PrincipalId, factor: Factor) -> AuthResult<Principal> {
        self.update(principal_id, |principal| {
            principal.factors.insert(factor);
        })
    }

    /// Soft-delete. The record stays so sessions keep a valid reference.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if the principal does not exist.
    pub fn deactivate(&self, principal_id: PrincipalId) -> AuthResult<Principal> {
        self.update(principal_id, |principal| principal.deactivated = true)
    }

    #[must_use]
    pub fn get(&self, principal_id: PrincipalId) -> Option<Principal> {
        self.principals
            .get(&principal_id)
            .map(|record| record.principal.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.principals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }

    fn update(
        &self,
        principal_id: PrincipalId,
        apply: impl FnOnce(&mut Principal),
    ) -> AuthResult<Principal> {
        let mut record = self
            .principals
            .get_mut(&principal_id)
            .ok_or_else(|| AuthError::InvalidRequest("unknown principal".to_string()))?;
        apply(&mut record.principal);
        Ok(record.principal.clone())
    }
}

fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

fn valid_username(username_normalized: &str) -> bool {
    Regex::new(r"^[a-z0-9][a-z0-9._-]{2,31}$").is_ok_and(|regex| regex.is_match(username_normalized))
}

/// Hash a password using Argon2id with a random salt.
///
/// # Errors
/// Returns an error if hashing fails.
pub(crate) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

pub(crate) fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

static DUMMY_HASH: OnceCell<String> = OnceCell::new();

/// Fixed hash verified against when the username is unknown, so both paths cost the same.
pub(crate) fn dummy_hash() -> Result<&'static str> {
    DUMMY_HASH
        .get_or_try_init(|| hash_password("ics-session-timing-equalizer"))
        .map(String::as_str)
}
