//! Secure credential storage.
//!
//! Three things live in the vault: the current credential, an offline
//! login record per identity (argon2 hash, never the plaintext secret),
//! and a snapshot of the last authenticated identity. The production
//! implementation is the OS keychain via `keyring`; [`MemoryVault`] serves
//! tests and keychain-less platforms.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use keyring::Entry;
use rand::rngs::OsRng as TokenRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::token::Credential;

/// Keychain service name
const SERVICE_NAME: &str = "spb-field";

/// Keychain account for the current credential blob
const CREDENTIAL_KEY: &str = "credential";

/// Keychain account for the last-known identity snapshot
const IDENTITY_KEY: &str = "identity";

/// Byte length of a locally minted offline token
const OFFLINE_TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("password hash error: {0}")]
    Hash(String),
}

/// Locally stored proof that an identity once logged in online.
/// Consumed only when connectivity is unavailable at login time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineCredentialRecord {
    pub subject_id: String,
    pub subject_name: String,
    /// Argon2 PHC string; the salt is embedded. Never the plaintext.
    pub password_hash: String,
    pub last_online_auth_at: DateTime<Utc>,
}

/// Last authenticated identity, kept so a reconnect can re-establish a
/// real server session after an offline login replaced the credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub subject_id: String,
    pub subject_name: String,
    pub refresh_token: Option<String>,
}

/// Storage seam for credentials and offline login material.
pub trait CredentialVault: Send + Sync + 'static {
    fn load_credential(&self) -> Result<Option<Credential>, VaultError>;
    fn store_credential(&self, credential: &Credential) -> Result<(), VaultError>;
    fn delete_credential(&self) -> Result<(), VaultError>;

    fn load_offline_record(
        &self,
        subject_name: &str,
    ) -> Result<Option<OfflineCredentialRecord>, VaultError>;
    fn store_offline_record(&self, record: &OfflineCredentialRecord) -> Result<(), VaultError>;

    fn load_identity(&self) -> Result<Option<IdentitySnapshot>, VaultError>;
    fn store_identity(&self, identity: &IdentitySnapshot) -> Result<(), VaultError>;
}

/// Hash a secret for the offline record. A fresh salt every time.
pub fn hash_secret(secret: &str) -> Result<String, VaultError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| VaultError::Hash(e.to_string()))
}

/// Verify a secret against a stored offline record hash. Runs entirely
/// locally; no network access.
pub fn verify_secret(secret: &str, password_hash: &str) -> Result<bool, VaultError> {
    let parsed = PasswordHash::new(password_hash).map_err(|e| VaultError::Hash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok())
}

/// Mint a random locally-scoped token for an offline-issued credential.
/// The server never sees it; callers gate remote work on `offline_issued`.
pub fn generate_offline_token() -> String {
    let mut bytes = [0u8; OFFLINE_TOKEN_BYTES];
    TokenRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// OS keychain-backed vault.
pub struct KeyringVault {
    service: String,
}

impl KeyringVault {
    pub fn new() -> Self {
        Self { service: SERVICE_NAME.to_string() }
    }

    /// Use a non-default keychain service name (e.g. per-environment).
    pub fn with_service(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, account: &str) -> Result<Entry, VaultError> {
        Ok(Entry::new(&self.service, account)?)
    }

    fn read(&self, account: &str) -> Result<Option<String>, VaultError> {
        match self.entry(account)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, account: &str, value: &str) -> Result<(), VaultError> {
        self.entry(account)?.set_password(value)?;
        Ok(())
    }

    fn delete(&self, account: &str) -> Result<(), VaultError> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn offline_key(subject_name: &str) -> String {
        format!("offline:{subject_name}")
    }
}

impl Default for KeyringVault {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialVault for KeyringVault {
    fn load_credential(&self) -> Result<Option<Credential>, VaultError> {
        match self.read(CREDENTIAL_KEY)? {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    fn store_credential(&self, credential: &Credential) -> Result<(), VaultError> {
        self.write(CREDENTIAL_KEY, &serde_json::to_string(credential)?)
    }

    fn delete_credential(&self) -> Result<(), VaultError> {
        self.delete(CREDENTIAL_KEY)
    }

    fn load_offline_record(
        &self,
        subject_name: &str,
    ) -> Result<Option<OfflineCredentialRecord>, VaultError> {
        match self.read(&Self::offline_key(subject_name))? {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    fn store_offline_record(&self, record: &OfflineCredentialRecord) -> Result<(), VaultError> {
        self.write(
            &Self::offline_key(&record.subject_name),
            &serde_json::to_string(record)?,
        )
    }

    fn load_identity(&self) -> Result<Option<IdentitySnapshot>, VaultError> {
        match self.read(IDENTITY_KEY)? {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    fn store_identity(&self, identity: &IdentitySnapshot) -> Result<(), VaultError> {
        self.write(IDENTITY_KEY, &serde_json::to_string(identity)?)
    }
}

/// In-memory vault for tests and platforms without a keychain.
#[derive(Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialVault for MemoryVault {
    fn load_credential(&self) -> Result<Option<Credential>, VaultError> {
        match self.entries().get(CREDENTIAL_KEY) {
            Some(blob) => Ok(Some(serde_json::from_str(blob)?)),
            None => Ok(None),
        }
    }

    fn store_credential(&self, credential: &Credential) -> Result<(), VaultError> {
        let blob = serde_json::to_string(credential)?;
        self.entries().insert(CREDENTIAL_KEY.to_string(), blob);
        Ok(())
    }

    fn delete_credential(&self) -> Result<(), VaultError> {
        self.entries().remove(CREDENTIAL_KEY);
        Ok(())
    }

    fn load_offline_record(
        &self,
        subject_name: &str,
    ) -> Result<Option<OfflineCredentialRecord>, VaultError> {
        match self.entries().get(&KeyringVault::offline_key(subject_name)) {
            Some(blob) => Ok(Some(serde_json::from_str(blob)?)),
            None => Ok(None),
        }
    }

    fn store_offline_record(&self, record: &OfflineCredentialRecord) -> Result<(), VaultError> {
        let blob = serde_json::to_string(record)?;
        self.entries()
            .insert(KeyringVault::offline_key(&record.subject_name), blob);
        Ok(())
    }

    fn load_identity(&self) -> Result<Option<IdentitySnapshot>, VaultError> {
        match self.entries().get(IDENTITY_KEY) {
            Some(blob) => Ok(Some(serde_json::from_str(blob)?)),
            None => Ok(None),
        }
    }

    fn store_identity(&self, identity: &IdentitySnapshot) -> Result<(), VaultError> {
        let blob = serde_json::to_string(identity)?;
        self.entries().insert(IDENTITY_KEY.to_string(), blob);
        Ok(())
    }
}
