//! Backend operation adapters
//!
//! One adapter per storage engine, all implementing the same capability
//! set over the filter algebra and entry model. An adapter owns its
//! connection pool for its whole lifetime and is the unit of mutual
//! exclusion; callers never touch raw connections.

pub mod distributed;
pub mod document;
pub mod ldap;
pub mod sql;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendKind, PersistConfig, PropertyMap};
use crate::entry::{AttributeChange, Entry, SearchScope};
use crate::error::{PersistError, Result};
use crate::extension::PersistenceExtension;
use crate::filter::Filter;

/// Attribute carrying the stored credential.
pub const USER_PASSWORD: &str = "userPassword";

/// Finite, non-restartable sequence of search results. Backends with
/// server-side paging produce entries lazily; the rest materialize.
pub type EntryStream = Pin<Box<dyn Stream<Item = Result<Entry>> + Send>>;

/// Deadline and cancellation carried by every adapter call.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl OpContext {
    pub fn background() -> Self {
        OpContext::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Runs a native call under this context. On cancellation the
    /// in-flight future is dropped (abandoning the native call where the
    /// client supports it) and the caller sees [`PersistError::Cancelled`].
    pub(crate) async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let bounded = async {
            match self.deadline {
                Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(PersistError::Cancelled(format!(
                        "{} deadline exceeded",
                        operation
                    ))),
                },
                None => fut.await,
            }
        };

        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(PersistError::Cancelled(format!("{} cancelled", operation))),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }
}

/// Uniform capability set implemented by every storage adapter.
///
/// Create/destroy operations drive the extension hook state machine:
/// before-hook failures abort the native operation; after-hook failures
/// surface as [`PersistError::Hook`] with the entity already persisted
/// (or destroyed) — advisory, never a rollback.
#[async_trait]
pub trait BackendOperations: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Entries under `base` matching `filter`. The stream is finite and
    /// cannot be restarted once consumed.
    async fn search(
        &self,
        ctx: &OpContext,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<EntryStream>;

    async fn add(&self, ctx: &OpContext, entry: &Entry) -> Result<()>;

    async fn modify(&self, ctx: &OpContext, dn: &str, changes: &[AttributeChange]) -> Result<()>;

    async fn remove(&self, ctx: &OpContext, dn: &str) -> Result<()>;

    async fn exists(&self, ctx: &OpContext, dn: &str) -> Result<bool>;

    async fn count(
        &self,
        ctx: &OpContext,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<u64>;

    /// Checks a credential against the entry's stored `userPassword`,
    /// through the extension when one is installed.
    async fn authenticate(&self, ctx: &OpContext, dn: &str, credential: &str) -> Result<bool>;

    /// Releases the adapter's pool/session. The adapter must not be used
    /// afterwards.
    async fn shutdown(&self) -> Result<()>;
}

/// Builds the configured adapter, wiring in the optional extension and
/// its frozen property map.
pub async fn connect(
    config: &PersistConfig,
    extension: Option<Arc<dyn PersistenceExtension>>,
    properties: PropertyMap,
) -> Result<Box<dyn BackendOperations>> {
    match config.backend {
        BackendKind::Ldap => {
            let section = config.ldap.as_ref().ok_or_else(|| {
                PersistError::Operation("ldap backend selected without ldap configuration".into())
            })?;
            let adapter = ldap::LdapBackend::connect(section, extension, properties).await?;
            Ok(Box::new(adapter))
        }
        BackendKind::Document => {
            let section = config.document.as_ref().ok_or_else(|| {
                PersistError::Operation(
                    "document backend selected without document configuration".into(),
                )
            })?;
            let adapter =
                document::DocumentBackend::connect(section, &config.base_dn, extension, properties)?;
            Ok(Box::new(adapter))
        }
        BackendKind::Sql => {
            let section = config.sql.as_ref().ok_or_else(|| {
                PersistError::Operation("sql backend selected without sql configuration".into())
            })?;
            let adapter =
                sql::SqlBackend::connect(section, &config.base_dn, extension, properties).await?;
            Ok(Box::new(adapter))
        }
        BackendKind::Distributed => {
            let section = config.distributed.as_ref().ok_or_else(|| {
                PersistError::Operation(
                    "distributed backend selected without distributed configuration".into(),
                )
            })?;
            let adapter = distributed::DistributedBackend::connect(
                section,
                &config.base_dn,
                extension,
                properties,
            )
            .await?;
            Ok(Box::new(adapter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ctx_deadline_exceeded() {
        let ctx = OpContext::background().with_deadline(Duration::from_millis(10));
        let result: Result<()> = ctx
            .run("search", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result.unwrap_err(), PersistError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_ctx_cancellation() {
        let token = CancellationToken::new();
        let ctx = OpContext::background().with_cancellation(token.clone());
        token.cancel();
        let result: Result<()> = ctx
            .run("add", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result.unwrap_err(), PersistError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_ctx_passthrough() {
        let ctx = OpContext::background();
        let result = ctx.run("exists", async { Ok(true) }).await;
        assert!(result.unwrap());
    }
}
