//! Persistence extension hooks
//!
//! Callers implement [`PersistenceExtension`] to intercept storage
//! lifecycle around create/destroy and to supply the credential-hashing
//! strategy. Adapters drive the state machine
//! `before-hook -> native-operation -> after-hook`: a before-hook
//! failure aborts the native operation; an after-hook failure is
//! surfaced, but the native operation has already committed, so the
//! caller must treat it as advisory rather than a rollback.
//!
//! Hook implementations must not issue persistence operations against
//! the adapter that invoked them; re-entrancy would deadlock on pooled
//! connections.

use std::sync::Arc;

use anyhow::anyhow;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::config::{BackendKind, PropertyMap};
use crate::entry::Entry;
use crate::error::{HookStage, PersistError, Result};

/// Frozen context handed to every hook invocation.
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    backend: BackendKind,
    properties: PropertyMap,
}

impl ExtensionContext {
    pub fn new(backend: BackendKind, properties: PropertyMap) -> Self {
        ExtensionContext {
            backend,
            properties,
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }
}

/// Capability interface storage callers implement to observe lifecycle
/// events and to own credential hashing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceExtension: Send + Sync {
    async fn on_before_create(&self, _ctx: &ExtensionContext, _entry: &Entry) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_after_create(&self, _ctx: &ExtensionContext, _entry: &Entry) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_before_destroy(&self, _ctx: &ExtensionContext, _entry: &Entry) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_after_destroy(&self, _ctx: &ExtensionContext, _entry: &Entry) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produces the stored form of a plaintext credential.
    fn hash_credential(&self, plain: &str) -> anyhow::Result<String>;

    /// Checks a plaintext credential against its stored form.
    fn verify_credential(&self, plain: &str, stored: &str) -> anyhow::Result<bool>;
}

/// Adapter-side hook dispatcher. Owns the optional extension and the
/// frozen context, and maps hook failures into the error taxonomy.
pub struct Hooks {
    extension: Option<Arc<dyn PersistenceExtension>>,
    context: ExtensionContext,
}

impl Hooks {
    pub fn new(extension: Option<Arc<dyn PersistenceExtension>>, context: ExtensionContext) -> Self {
        Hooks { extension, context }
    }

    pub fn context(&self) -> &ExtensionContext {
        &self.context
    }

    pub fn is_installed(&self) -> bool {
        self.extension.is_some()
    }

    pub async fn before_create(&self, entry: &Entry) -> Result<()> {
        self.run(HookStage::BeforeCreate, entry).await
    }

    pub async fn after_create(&self, entry: &Entry) -> Result<()> {
        self.run(HookStage::AfterCreate, entry).await
    }

    pub async fn before_destroy(&self, entry: &Entry) -> Result<()> {
        self.run(HookStage::BeforeDestroy, entry).await
    }

    pub async fn after_destroy(&self, entry: &Entry) -> Result<()> {
        self.run(HookStage::AfterDestroy, entry).await
    }

    async fn run(&self, stage: HookStage, entry: &Entry) -> Result<()> {
        let Some(extension) = &self.extension else {
            return Ok(());
        };
        let outcome = match stage {
            HookStage::BeforeCreate => extension.on_before_create(&self.context, entry).await,
            HookStage::AfterCreate => extension.on_after_create(&self.context, entry).await,
            HookStage::BeforeDestroy => extension.on_before_destroy(&self.context, entry).await,
            HookStage::AfterDestroy => extension.on_after_destroy(&self.context, entry).await,
            HookStage::Credential => Ok(()),
        };
        outcome.map_err(|source| PersistError::Hook { stage, source })
    }

    /// Hashes a credential through the extension; `None` when no
    /// extension is installed and the value is stored as supplied.
    pub fn hash_credential(&self, plain: &str) -> Result<Option<String>> {
        match &self.extension {
            Some(extension) => extension
                .hash_credential(plain)
                .map(Some)
                .map_err(|source| PersistError::Hook {
                    stage: HookStage::Credential,
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Verifies a credential through the extension; `None` when no
    /// extension is installed and the adapter must use its native check.
    pub fn verify_credential(&self, plain: &str, stored: &str) -> Result<Option<bool>> {
        match &self.extension {
            Some(extension) => extension
                .verify_credential(plain, stored)
                .map(Some)
                .map_err(|source| PersistError::Hook {
                    stage: HookStage::Credential,
                    source,
                }),
            None => Ok(None),
        }
    }
}

/// Provided credential-hashing strategy: argon2id PHC strings for new
/// credentials, with verification support for values migrated from
/// directory deployments (`{SSHA}` / `{SSHA256}`).
#[derive(Debug, Default)]
pub struct ArgonCredentialHasher;

#[async_trait]
impl PersistenceExtension for ArgonCredentialHasher {
    fn hash_credential(&self, plain: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| anyhow!("argon2 hashing failed: {}", e))?;
        Ok(hash.to_string())
    }

    fn verify_credential(&self, plain: &str, stored: &str) -> anyhow::Result<bool> {
        verify_with_schemes(plain, stored)
    }
}

/// Scheme-aware credential check against a stored value: argon2 PHC
/// strings, legacy `{SSHA}`/`{SSHA256}` values, or plaintext when no
/// scheme marker is present. Adapters use this directly when no
/// extension is installed.
pub fn verify_with_schemes(plain: &str, stored: &str) -> anyhow::Result<bool> {
    if let Some(encoded) = stored.strip_prefix("{SSHA}") {
        return verify_salted_digest::<Sha1>(plain, encoded, 20);
    }
    if let Some(encoded) = stored.strip_prefix("{SSHA256}") {
        return verify_salted_digest::<Sha256>(plain, encoded, 32);
    }
    if stored.starts_with("$argon2") {
        let parsed =
            PasswordHash::new(stored).map_err(|e| anyhow!("malformed argon2 hash: {}", e))?;
        return Ok(Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok());
    }
    // No scheme marker: stored as plaintext.
    Ok(plain == stored)
}

/// Salted-digest verification: stored form is base64(digest || salt).
fn verify_salted_digest<D: Digest>(
    plain: &str,
    encoded: &str,
    digest_len: usize,
) -> anyhow::Result<bool> {
    let decoded = BASE64
        .decode(encoded)
        .map_err(|e| anyhow!("malformed salted hash: {}", e))?;
    if decoded.len() < digest_len {
        return Err(anyhow!("salted hash shorter than its digest"));
    }
    let (digest, salt) = decoded.split_at(digest_len);
    let mut hasher = D::new();
    hasher.update(plain.as_bytes());
    hasher.update(salt);
    Ok(hasher.finalize().as_slice() == digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExtensionContext {
        ExtensionContext::new(BackendKind::Sql, PropertyMap::new())
    }

    #[test]
    fn test_argon_round_trip() {
        let hasher = ArgonCredentialHasher;
        let stored = hasher.hash_credential("s3cret").unwrap();
        assert!(stored.starts_with("$argon2"));
        assert!(hasher.verify_credential("s3cret", &stored).unwrap());
        assert!(!hasher.verify_credential("wrong", &stored).unwrap());
    }

    #[test]
    fn test_legacy_ssha_verification() {
        // base64(sha1("secret" || salt) || salt) with salt = "salt"
        let salt = b"salt";
        let mut hasher = Sha1::new();
        hasher.update(b"secret");
        hasher.update(salt);
        let mut blob = hasher.finalize().to_vec();
        blob.extend_from_slice(salt);
        let stored = format!("{{SSHA}}{}", BASE64.encode(&blob));

        let ext = ArgonCredentialHasher;
        assert!(ext.verify_credential("secret", &stored).unwrap());
        assert!(!ext.verify_credential("other", &stored).unwrap());
    }

    #[test]
    fn test_plaintext_fallback() {
        let ext = ArgonCredentialHasher;
        assert!(ext.verify_credential("abc", "abc").unwrap());
        assert!(!ext.verify_credential("abc", "abd").unwrap());
    }

    #[tokio::test]
    async fn test_before_hook_failure_maps_to_stage() {
        let mut mock = MockPersistenceExtension::new();
        mock.expect_on_before_create()
            .returning(|_, _| Err(anyhow!("policy veto")));
        let hooks = Hooks::new(Some(Arc::new(mock)), context());
        let entry = Entry::new("inum=1,ou=people,o=identra");
        let err = hooks.before_create(&entry).await.unwrap_err();
        match err {
            PersistError::Hook { stage, .. } => assert_eq!(stage, HookStage::BeforeCreate),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_hooks_without_extension_are_noops() {
        let hooks = Hooks::new(None, context());
        let entry = Entry::new("inum=1,ou=people,o=identra");
        assert!(hooks.before_create(&entry).await.is_ok());
        assert!(hooks.hash_credential("x").unwrap().is_none());
        assert!(hooks.verify_credential("x", "y").unwrap().is_none());
    }
}
