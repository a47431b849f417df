//! Configuration for backend adapters and persistence extensions

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Storage engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Directory protocol (LDAP).
    Ldap,
    /// Document store (N1QL query service).
    Document,
    /// Relational engine with JSON columns (MySQL).
    Sql,
    /// Globally-distributed SQL engine (CockroachDB, Postgres wire).
    Distributed,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ldap => "ldap",
            BackendKind::Document => "document",
            BackendKind::Sql => "sql",
            BackendKind::Distributed => "distributed",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ldap" => Ok(BackendKind::Ldap),
            "document" | "couchbase" => Ok(BackendKind::Document),
            "sql" | "mysql" => Ok(BackendKind::Sql),
            "distributed" | "cockroach" => Ok(BackendKind::Distributed),
            other => anyhow::bail!("unknown backend kind '{}'", other),
        }
    }
}

/// Persistence layer configuration
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Selected backend
    pub backend: BackendKind,
    /// Base identifier all entries live under
    pub base_dn: String,
    /// Directory backend parameters
    pub ldap: Option<LdapConfig>,
    /// Document backend parameters
    pub document: Option<DocumentConfig>,
    /// Relational/JSON backend parameters
    pub sql: Option<SqlConfig>,
    /// Distributed SQL backend parameters
    pub distributed: Option<DistributedConfig>,
}

#[derive(Debug, Clone)]
pub struct LdapConfig {
    pub url: String,
    pub bind_dn: String,
    pub bind_password: String,
}

#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Query service endpoint (e.g. http://cb:8093)
    pub query_url: String,
    pub bucket: String,
    pub username: String,
    pub password: String,
    /// Request-plus scan consistency for reads after writes
    pub request_plus: bool,
    /// Whether the bucket carries indexes usable for substring (LIKE)
    /// predicates. Without them SUBSTRING filters are rejected instead
    /// of degrading into full scans.
    pub substring_search: bool,
}

#[derive(Debug, Clone)]
pub struct SqlConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct DistributedConfig {
    pub url: String,
    pub max_connections: u32,
}

impl PersistConfig {
    /// Load configuration from the environment (a local `.env` file is
    /// honored). Only the selected backend's section is required.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let backend: BackendKind = env::var("PERSIST_BACKEND")
            .unwrap_or_else(|_| "sql".to_string())
            .parse()
            .context("Invalid PERSIST_BACKEND")?;
        let base_dn = env::var("PERSIST_BASE_DN").unwrap_or_else(|_| "o=identra".to_string());

        let mut config = PersistConfig {
            backend,
            base_dn,
            ldap: None,
            document: None,
            sql: None,
            distributed: None,
        };

        match backend {
            BackendKind::Ldap => {
                config.ldap = Some(LdapConfig {
                    url: env::var("LDAP_URL").context("LDAP_URL is required")?,
                    bind_dn: env::var("LDAP_BIND_DN").context("LDAP_BIND_DN is required")?,
                    bind_password: env::var("LDAP_BIND_PASSWORD")
                        .context("LDAP_BIND_PASSWORD is required")?,
                });
            }
            BackendKind::Document => {
                config.document = Some(DocumentConfig {
                    query_url: env::var("DOCUMENT_QUERY_URL")
                        .context("DOCUMENT_QUERY_URL is required")?,
                    bucket: env::var("DOCUMENT_BUCKET").context("DOCUMENT_BUCKET is required")?,
                    username: env::var("DOCUMENT_USERNAME")
                        .context("DOCUMENT_USERNAME is required")?,
                    password: env::var("DOCUMENT_PASSWORD")
                        .context("DOCUMENT_PASSWORD is required")?,
                    request_plus: env::var("DOCUMENT_REQUEST_PLUS")
                        .map(|v| v == "true" || v == "1")
                        .unwrap_or(false),
                    substring_search: env::var("DOCUMENT_SUBSTRING_SEARCH")
                        .map(|v| v == "true" || v == "1")
                        .unwrap_or(true),
                });
            }
            BackendKind::Sql => {
                config.sql = Some(SqlConfig {
                    url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
                    max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                        .unwrap_or_else(|_| "10".to_string())
                        .parse()
                        .context("Invalid DATABASE_MAX_CONNECTIONS")?,
                    min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                        .unwrap_or_else(|_| "1".to_string())
                        .parse()
                        .context("Invalid DATABASE_MIN_CONNECTIONS")?,
                });
            }
            BackendKind::Distributed => {
                config.distributed = Some(DistributedConfig {
                    url: env::var("DISTRIBUTED_DATABASE_URL")
                        .context("DISTRIBUTED_DATABASE_URL is required")?,
                    max_connections: env::var("DISTRIBUTED_MAX_CONNECTIONS")
                        .unwrap_or_else(|_| "10".to_string())
                        .parse()
                        .context("Invalid DISTRIBUTED_MAX_CONNECTIONS")?,
                });
            }
        }

        Ok(config)
    }
}

/// A simple named property descriptor, the uniform configuration shape
/// shared by adapters and extension hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleProperty {
    pub name: String,
    pub value: String,
}

/// Immutable map of property descriptors. Built once, never mutated
/// after the owning adapter or extension is initialized.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    properties: HashMap<String, SimpleProperty>,
}

impl PropertyMap {
    pub fn new() -> Self {
        PropertyMap::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(
            name.to_string(),
            SimpleProperty {
                name: name.to_string(),
                value: value.to_string(),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&SimpleProperty> {
        self.properties.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(|p| p.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
