//! Unified error handling for the persistence core

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, PersistError>;

/// Hook stage that produced a [`PersistError::Hook`] failure.
///
/// Before-stages abort the native operation; after-stages fire once the
/// native operation has already committed, so their failures are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeCreate,
    AfterCreate,
    BeforeDestroy,
    AfterDestroy,
    Credential,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::BeforeCreate => "before-create",
            HookStage::AfterCreate => "after-create",
            HookStage::BeforeDestroy => "before-destroy",
            HookStage::AfterDestroy => "after-destroy",
            HookStage::Credential => "credential",
        }
    }

    /// Whether the native operation had already committed when this
    /// stage ran.
    pub fn is_advisory(&self) -> bool {
        matches!(self, HookStage::AfterCreate | HookStage::AfterDestroy)
    }
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence error taxonomy
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Unsupported filter for {backend} backend: {node}")]
    UnsupportedFilter { backend: &'static str, node: String },

    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("{stage} hook failed: {source}")]
    Hook {
        stage: HookStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl PersistError {
    /// Connection-level failures the caller may retry with backoff.
    /// The core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistError::BackendUnavailable(_))
    }
}

impl From<sqlx::Error> for PersistError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => PersistError::BackendUnavailable(err.to_string()),
            sqlx::Error::RowNotFound => PersistError::NotFound(err.to_string()),
            _ => PersistError::Operation(err.to_string()),
        }
    }
}

impl From<ldap3::LdapError> for PersistError {
    fn from(err: ldap3::LdapError) -> Self {
        match &err {
            ldap3::LdapError::Io { .. } | ldap3::LdapError::EndOfStream => {
                PersistError::BackendUnavailable(err.to_string())
            }
            _ => PersistError::Operation(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for PersistError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            PersistError::BackendUnavailable(err.to_string())
        } else {
            PersistError::Operation(err.to_string())
        }
    }
}
