//! Distributed SQL adapter (CockroachDB, Postgres wire protocol)
//!
//! Same document-per-row model as the relational adapter, but on the
//! Postgres dialect: `$n` placeholders, JSONB operators (`->>`, `@>`,
//! `?`) instead of the MySQL JSON functions. JSONB containment covers
//! both array-shaped and scalar-shaped stored attributes, which keeps
//! multi-valued membership tests total.

use std::sync::Arc;

use futures::stream;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::{BackendOperations, EntryStream, OpContext, USER_PASSWORD};
use crate::config::{BackendKind, DistributedConfig, PropertyMap};
use crate::entry::{AttributeChange, Entry, SearchScope};
use crate::error::{PersistError, Result};
use crate::extension::{verify_with_schemes, ExtensionContext, Hooks, PersistenceExtension};
use crate::filter::processor::FilterProcessor;
use crate::filter::{Filter, FilterKind, FilterValue};
use crate::instrument::{OpInstrument, OperationKind};
use crate::key::KeyCodec;

pub struct DistributedBackend {
    pool: PgPool,
    codec: KeyCodec,
    hooks: Hooks,
    instrument: OpInstrument,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PgArg {
    Text(String),
    Int(i64),
    Bool(bool),
    Json(Value),
}

impl DistributedBackend {
    pub async fn connect(
        config: &DistributedConfig,
        base_dn: &str,
        extension: Option<Arc<dyn PersistenceExtension>>,
        properties: PropertyMap,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "distributed sql adapter connected"
        );

        Ok(DistributedBackend {
            pool,
            codec: KeyCodec::new(base_dn)?,
            hooks: Hooks::new(
                extension,
                ExtensionContext::new(BackendKind::Distributed, properties),
            ),
            instrument: OpInstrument::new("distributed"),
        })
    }

    fn bind_args<'q>(
        sql: &'q str,
        args: Vec<PgArg>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        let mut query = sqlx::query(sql);
        for arg in args {
            query = match arg {
                PgArg::Text(text) => query.bind(text),
                PgArg::Int(int) => query.bind(int),
                PgArg::Bool(boolean) => query.bind(boolean),
                PgArg::Json(value) => query.bind(value),
            };
        }
        query
    }

    async fn fetch_data(&self, table: &str, doc_id: &str) -> Result<Option<(String, Value)>> {
        let sql = format!("SELECT dn, data FROM {} WHERE doc_id = $1", table);
        let row = sqlx::query(&sql)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let dn: String = row.try_get("dn")?;
            let data: Value = row.try_get("data")?;
            Ok((dn, data))
        })
        .transpose()
    }
}

#[async_trait::async_trait]
impl BackendOperations for DistributedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    async fn search(
        &self,
        ctx: &OpContext,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<EntryStream> {
        let key = self.codec.container_key(base)?;
        let table = super::sql::table_of(&key)?;
        let mut args = Vec::new();
        let scoping = scope_predicate(&key, scope, &mut args);
        // Entry types are encoded in the table/key, not as a predicate.
        let predicate = match FilterProcessor::exclude_object_class_filters(filter) {
            Some(effective) => render_filter(&effective, &mut args)?,
            None => "TRUE".to_string(),
        };
        let sql = format!(
            "SELECT dn, data FROM {} WHERE {} AND {}",
            table, scoping, predicate
        );

        let rows = self
            .instrument
            .measure(
                OperationKind::Search,
                ctx.run("search", async {
                    Ok(Self::bind_args(&sql, args).fetch_all(&self.pool).await?)
                }),
            )
            .await?;

        let entries: Vec<Result<Entry>> = rows.into_iter().map(entry_from_row).collect();
        Ok(Box::pin(stream::iter(entries)))
    }

    async fn add(&self, ctx: &OpContext, entry: &Entry) -> Result<()> {
        let key = self.codec.parse_dn(entry.dn())?;
        let table = super::sql::table_of(key.key())?;
        self.hooks.before_create(entry).await?;

        let data = data_from_entry(entry, &self.hooks)?;
        let sql = format!(
            "INSERT INTO {} (doc_id, dn, data) VALUES ($1, $2, $3)",
            table
        );
        self.instrument
            .measure(
                OperationKind::Add,
                ctx.run("add", async {
                    sqlx::query(&sql)
                        .bind(key.key())
                        .bind(entry.dn())
                        .bind(&data)
                        .execute(&self.pool)
                        .await?;
                    Ok(())
                }),
            )
            .await?;

        self.hooks.after_create(entry).await
    }

    async fn modify(&self, ctx: &OpContext, dn: &str, changes: &[AttributeChange]) -> Result<()> {
        let key = self.codec.parse_dn(dn)?;
        let table = super::sql::table_of(key.key())?;
        let update = format!("UPDATE {} SET data = $1 WHERE doc_id = $2", table);

        self.instrument
            .measure(
                OperationKind::Modify,
                ctx.run("modify", async {
                    let (stored_dn, data) = self
                        .fetch_data(&table, key.key())
                        .await?
                        .ok_or_else(|| PersistError::NotFound(dn.to_string()))?;
                    let mut entry = entry_from_parts(&stored_dn, data)?;
                    for change in changes {
                        change.apply(&mut entry);
                    }
                    let data = data_from_entry(&entry, &self.hooks)?;
                    sqlx::query(&update)
                        .bind(&data)
                        .bind(key.key())
                        .execute(&self.pool)
                        .await?;
                    Ok(())
                }),
            )
            .await
    }

    async fn remove(&self, ctx: &OpContext, dn: &str) -> Result<()> {
        let key = self.codec.parse_dn(dn)?;
        let table = super::sql::table_of(key.key())?;
        let entry = Entry::new(dn);
        self.hooks.before_destroy(&entry).await?;

        let sql = format!("DELETE FROM {} WHERE doc_id = $1", table);
        self.instrument
            .measure(
                OperationKind::Remove,
                ctx.run("remove", async {
                    sqlx::query(&sql)
                        .bind(key.key())
                        .execute(&self.pool)
                        .await?;
                    Ok(())
                }),
            )
            .await?;

        self.hooks.after_destroy(&entry).await
    }

    async fn exists(&self, ctx: &OpContext, dn: &str) -> Result<bool> {
        let key = self.codec.parse_dn(dn)?;
        let table = super::sql::table_of(key.key())?;
        let sql = format!(
            "SELECT COUNT(*) AS total FROM {} WHERE doc_id = $1",
            table
        );
        self.instrument
            .measure(
                OperationKind::Exists,
                ctx.run("exists", async {
                    let row = sqlx::query(&sql)
                        .bind(key.key())
                        .fetch_one(&self.pool)
                        .await?;
                    let total: i64 = row.try_get("total")?;
                    Ok(total > 0)
                }),
            )
            .await
    }

    async fn count(
        &self,
        ctx: &OpContext,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<u64> {
        let key = self.codec.container_key(base)?;
        let table = super::sql::table_of(&key)?;
        let mut args = Vec::new();
        let scoping = scope_predicate(&key, scope, &mut args);
        let predicate = match FilterProcessor::exclude_object_class_filters(filter) {
            Some(effective) => render_filter(&effective, &mut args)?,
            None => "TRUE".to_string(),
        };
        let sql = format!(
            "SELECT COUNT(*) AS total FROM {} WHERE {} AND {}",
            table, scoping, predicate
        );

        self.instrument
            .measure(
                OperationKind::Count,
                ctx.run("count", async {
                    let row = Self::bind_args(&sql, args).fetch_one(&self.pool).await?;
                    let total: i64 = row.try_get("total")?;
                    Ok(total as u64)
                }),
            )
            .await
    }

    async fn authenticate(&self, ctx: &OpContext, dn: &str, credential: &str) -> Result<bool> {
        let key = self.codec.parse_dn(dn)?;
        let table = super::sql::table_of(key.key())?;
        let stored = self
            .instrument
            .measure(
                OperationKind::Authenticate,
                ctx.run("authenticate", self.fetch_data(&table, key.key())),
            )
            .await?;

        let Some((stored_dn, data)) = stored else {
            return Ok(false);
        };
        let entry = entry_from_parts(&stored_dn, data)?;
        let Some(stored_value) = entry.first_text(USER_PASSWORD) else {
            return Ok(false);
        };
        match self.hooks.verify_credential(credential, stored_value)? {
            Some(verified) => Ok(verified),
            None => verify_with_schemes(credential, stored_value)
                .map_err(|e| PersistError::Operation(e.to_string())),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn attribute_of(filter: &Filter) -> Result<&str> {
    let attribute = filter
        .attribute()
        .ok_or_else(|| PersistError::InvalidFilter(format!("missing attribute in {}", filter)))?;
    if !attribute
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PersistError::InvalidFilter(format!(
            "invalid attribute name '{}'",
            attribute
        )));
    }
    Ok(attribute)
}

fn push_arg(args: &mut Vec<PgArg>, arg: PgArg) -> String {
    args.push(arg);
    format!("${}", args.len())
}

fn regex_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\.+*?()[]{}|^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn like_escape(fragment: &str) -> String {
    fragment.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// `doc_id` predicate emulating hierarchical scope inside a table.
pub(crate) fn scope_predicate(key: &str, scope: SearchScope, args: &mut Vec<PgArg>) -> String {
    match scope {
        SearchScope::Base => {
            let placeholder = push_arg(args, PgArg::Text(key.to_string()));
            format!("doc_id = {}", placeholder)
        }
        SearchScope::One => {
            let pattern = format!("^{}_[^_]+$", regex_escape(key));
            let placeholder = push_arg(args, PgArg::Text(pattern));
            format!("doc_id ~ {}", placeholder)
        }
        SearchScope::Sub => {
            let exact = push_arg(args, PgArg::Text(key.to_string()));
            let prefix = push_arg(args, PgArg::Text(format!("{}\\_%", like_escape(key))));
            format!("(doc_id = {} OR doc_id LIKE {})", exact, prefix)
        }
    }
}

/// Renders the filter tree as a Postgres-dialect predicate over the
/// JSONB document column.
pub(crate) fn render_filter(filter: &Filter, args: &mut Vec<PgArg>) -> Result<String> {
    match filter.kind() {
        FilterKind::Equality => {
            let attribute = attribute_of(filter)?;
            if filter.value().is_null() {
                return Ok(format!("data->'{}' IS NULL", attribute));
            }
            if filter.is_multi_valued() == Some(true) {
                let candidate = match filter.value() {
                    FilterValue::Text(text) => Value::String(text.clone()),
                    FilterValue::Integer(int) => Value::from(*int),
                    FilterValue::Boolean(boolean) => Value::Bool(*boolean),
                    FilterValue::Null => Value::Null,
                };
                let placeholder = push_arg(args, PgArg::Json(candidate));
                return Ok(format!("data->'{}' @> {}", attribute, placeholder));
            }
            match filter.value() {
                FilterValue::Text(text) => {
                    let placeholder = push_arg(args, PgArg::Text(text.clone()));
                    Ok(format!("data->>'{}' = {}", attribute, placeholder))
                }
                FilterValue::Integer(int) => {
                    let placeholder = push_arg(args, PgArg::Int(*int));
                    Ok(format!(
                        "(data->>'{}')::numeric = {}",
                        attribute, placeholder
                    ))
                }
                FilterValue::Boolean(boolean) => {
                    let placeholder = push_arg(args, PgArg::Bool(*boolean));
                    Ok(format!("(data->>'{}')::bool = {}", attribute, placeholder))
                }
                FilterValue::Null => unreachable!("null handled above"),
            }
        }
        FilterKind::Presence => {
            let attribute = attribute_of(filter)?;
            Ok(format!("data ? '{}'", attribute))
        }
        FilterKind::LessOrEqual | FilterKind::GreaterOrEqual => {
            let attribute = attribute_of(filter)?;
            let sign = filter.kind().sign();
            match filter.value() {
                FilterValue::Integer(int) => {
                    let placeholder = push_arg(args, PgArg::Int(*int));
                    Ok(format!(
                        "(data->>'{}')::numeric {} {}",
                        attribute, sign, placeholder
                    ))
                }
                other => {
                    let placeholder = push_arg(args, PgArg::Text(other.render()));
                    Ok(format!("data->>'{}' {} {}", attribute, sign, placeholder))
                }
            }
        }
        FilterKind::Substring => {
            let attribute = attribute_of(filter)?;
            let mut pattern = String::new();
            if let Some(initial) = filter.sub_initial() {
                pattern.push_str(&like_escape(initial));
            }
            pattern.push('%');
            for any in filter.sub_any() {
                pattern.push_str(&like_escape(any));
                pattern.push('%');
            }
            if let Some(fin) = filter.sub_final() {
                pattern.push_str(&like_escape(fin));
            }
            let placeholder = push_arg(args, PgArg::Text(pattern));
            Ok(format!("data->>'{}' LIKE {}", attribute, placeholder))
        }
        FilterKind::Lowercase => {
            let child = &filter.children()[0];
            let attribute = attribute_of(child)?;
            let folded = child.value().render().to_lowercase();
            let placeholder = push_arg(args, PgArg::Text(folded));
            Ok(format!("LOWER(data->>'{}') = {}", attribute, placeholder))
        }
        FilterKind::Not => Ok(format!(
            "NOT ({})",
            render_filter(&filter.children()[0], args)?
        )),
        FilterKind::And | FilterKind::Or => {
            let connective = if filter.kind() == FilterKind::And {
                " AND "
            } else {
                " OR "
            };
            let rendered: Result<Vec<String>> = filter
                .children()
                .iter()
                .map(|child| render_filter(child, args))
                .collect();
            Ok(format!("({})", rendered?.join(connective)))
        }
        FilterKind::ApproximateMatch | FilterKind::Raw => Err(PersistError::UnsupportedFilter {
            backend: "distributed",
            node: filter.to_string(),
        }),
    }
}

fn data_from_entry(entry: &Entry, hooks: &Hooks) -> Result<Value> {
    let mut data = serde_json::Map::new();
    for (name, values) in entry.attributes() {
        let values: Vec<Value> = if name == USER_PASSWORD {
            values
                .iter()
                .map(|v| {
                    let plain = v.as_str().unwrap_or_default().to_string();
                    Ok(match hooks.hash_credential(&plain)? {
                        Some(hashed) => Value::String(hashed),
                        None => v.clone(),
                    })
                })
                .collect::<Result<Vec<Value>>>()?
        } else {
            values.to_vec()
        };
        let stored = if values.len() == 1 {
            values.into_iter().next().expect("one value")
        } else {
            Value::Array(values)
        };
        data.insert(name.to_string(), stored);
    }
    Ok(Value::Object(data))
}

fn entry_from_parts(dn: &str, data: Value) -> Result<Entry> {
    let Value::Object(map) = data else {
        return Err(PersistError::Operation(
            "stored document is not an object".to_string(),
        ));
    };
    let mut entry = Entry::new(dn);
    for (name, value) in map {
        let values = match value {
            Value::Array(values) => values,
            single => vec![single],
        };
        entry.set_attribute(&name, values);
    }
    Ok(entry)
}

fn entry_from_row(row: PgRow) -> Result<Entry> {
    let dn: String = row.try_get("dn")?;
    let data: Value = row.try_get("data")?;
    entry_from_parts(&dn, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_uses_positional_placeholders() {
        let filter = Filter::and(vec![
            Filter::equality("uid", "jdoe").unwrap(),
            Filter::greater_or_equal("loginCount", 5).unwrap(),
        ])
        .unwrap();
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(
            rendered,
            "(data->>'uid' = $1 AND (data->>'loginCount')::numeric >= $2)"
        );
        assert_eq!(
            args,
            vec![PgArg::Text("jdoe".to_string()), PgArg::Int(5)]
        );
    }

    #[test]
    fn test_render_membership_via_containment() {
        let filter = Filter::equality("memberOf", "admins")
            .unwrap()
            .multi_valued(true);
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(rendered, "data->'memberOf' @> $1");
        assert_eq!(args, vec![PgArg::Json(Value::String("admins".into()))]);
    }

    #[test]
    fn test_render_lowercase_appends_case_fold() {
        let filter =
            Filter::lowercase(Filter::equality("mail", "JDoe@Example.org").unwrap()).unwrap();
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(rendered, "LOWER(data->>'mail') = $1");
        assert_eq!(args, vec![PgArg::Text("jdoe@example.org".to_string())]);
    }

    #[test]
    fn test_render_presence_uses_exists_operator() {
        let filter = Filter::presence("mail").unwrap();
        let mut args = Vec::new();
        assert_eq!(render_filter(&filter, &mut args).unwrap(), "data ? 'mail'");
    }

    #[test]
    fn test_raw_unsupported() {
        let filter = Filter::raw("(uid=jdoe)");
        let mut args = Vec::new();
        assert!(matches!(
            render_filter(&filter, &mut args).unwrap_err(),
            PersistError::UnsupportedFilter {
                backend: "distributed",
                ..
            }
        ));
    }

    #[test]
    fn test_scope_one_level_regex() {
        let mut args = Vec::new();
        let predicate = scope_predicate("people", SearchScope::One, &mut args);
        assert_eq!(predicate, "doc_id ~ $1");
        assert_eq!(args, vec![PgArg::Text("^people_[^_]+$".to_string())]);
    }
}
