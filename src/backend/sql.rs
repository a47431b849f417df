//! Relational/JSON adapter (MySQL)
//!
//! Each top-level collection maps to a table of
//! `(doc_id, dn, data JSON)` rows; attributes live inside the JSON
//! document, so filter translation leans on the vendor JSON functions
//! (`JSON_EXTRACT`, `JSON_CONTAINS`, `JSON_CONTAINS_PATH`). Table
//! provisioning belongs to deployment tooling; schema migration is out
//! of scope here.

use std::sync::Arc;

use futures::stream;
use serde_json::Value;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;

use super::{BackendOperations, EntryStream, OpContext, USER_PASSWORD};
use crate::config::{BackendKind, PropertyMap, SqlConfig};
use crate::entry::{AttributeChange, Entry, SearchScope};
use crate::error::{PersistError, Result};
use crate::extension::{verify_with_schemes, ExtensionContext, Hooks, PersistenceExtension};
use crate::filter::processor::FilterProcessor;
use crate::filter::{Filter, FilterKind, FilterValue};
use crate::instrument::{OpInstrument, OperationKind};
use crate::key::KeyCodec;

pub struct SqlBackend {
    pool: MySqlPool,
    codec: KeyCodec,
    hooks: Hooks,
    instrument: OpInstrument,
}

/// Bind argument produced by filter translation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlArg {
    Text(String),
    Int(i64),
    Json(Value),
}

impl SqlBackend {
    pub async fn connect(
        config: &SqlConfig,
        base_dn: &str,
        extension: Option<Arc<dyn PersistenceExtension>>,
        properties: PropertyMap,
    ) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        tracing::info!(max_connections = config.max_connections, "sql adapter connected");

        Ok(SqlBackend {
            pool,
            codec: KeyCodec::new(base_dn)?,
            hooks: Hooks::new(extension, ExtensionContext::new(BackendKind::Sql, properties)),
            instrument: OpInstrument::new("sql"),
        })
    }

    fn bind_args<'q>(
        sql: &'q str,
        args: Vec<SqlArg>,
    ) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
        let mut query = sqlx::query(sql);
        for arg in args {
            query = match arg {
                SqlArg::Text(text) => query.bind(text),
                SqlArg::Int(int) => query.bind(int),
                SqlArg::Json(value) => query.bind(value),
            };
        }
        query
    }

    async fn fetch_data(&self, table: &str, doc_id: &str) -> Result<Option<(String, Value)>> {
        let sql = format!("SELECT dn, data FROM {} WHERE doc_id = ?", table);
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
impl BackendOperations for SqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    async fn search(
        &self,
        ctx: &OpContext,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<EntryStream> {
        let key = self.codec.container_key(base)?;
        let table = table_of(&key)?;
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
        let table = table_of(key.key())?;
        self.hooks.before_create(entry).await?;

        let data = data_from_entry(entry, &self.hooks)?;
        let sql = format!(
            "INSERT INTO {} (doc_id, dn, data) VALUES (?, ?, ?)",
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
        let table = table_of(key.key())?;
        let update = format!("UPDATE {} SET data = ? WHERE doc_id = ?", table);

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
        let table = table_of(key.key())?;
        let entry = Entry::new(dn);
        self.hooks.before_destroy(&entry).await?;

        let sql = format!("DELETE FROM {} WHERE doc_id = ?", table);
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
        let table = table_of(key.key())?;
        let sql = format!("SELECT COUNT(*) AS total FROM {} WHERE doc_id = ?", table);
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
        let table = table_of(&key)?;
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
        let table = table_of(key.key())?;
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

/// Table owning a composite key: its outermost container component.
pub(crate) fn table_of(key: &str) -> Result<String> {
    let first = key.split('_').next().unwrap_or_default();
    if first.is_empty() {
        return Err(PersistError::MalformedKey(format!(
            "key '{}' does not name a collection",
            key
        )));
    }
    if !first
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(PersistError::MalformedKey(format!(
            "collection '{}' is not a valid table name",
            first
        )));
    }
    Ok(first.replace('-', "_"))
}

fn json_path(filter: &Filter) -> Result<(String, String)> {
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
    Ok((attribute.to_string(), format!("'$.{}'", attribute)))
}

fn push_value(args: &mut Vec<SqlArg>, value: &FilterValue) {
    match value {
        FilterValue::Text(text) => args.push(SqlArg::Text(text.clone())),
        FilterValue::Integer(int) => args.push(SqlArg::Int(*int)),
        FilterValue::Boolean(boolean) => args.push(SqlArg::Text(boolean.to_string())),
        FilterValue::Null => args.push(SqlArg::Json(Value::Null)),
    }
}

/// `doc_id` predicate emulating hierarchical scope inside a table.
pub(crate) fn scope_predicate(key: &str, scope: SearchScope, args: &mut Vec<SqlArg>) -> String {
    match scope {
        SearchScope::Base => {
            args.push(SqlArg::Text(key.to_string()));
            "doc_id = ?".to_string()
        }
        SearchScope::One => {
            args.push(SqlArg::Text(format!("^{}_[^_]+$", regex_escape(key))));
            "doc_id REGEXP ?".to_string()
        }
        SearchScope::Sub => {
            args.push(SqlArg::Text(key.to_string()));
            args.push(SqlArg::Text(format!("{}\\_%", like_escape(key))));
            "(doc_id = ? OR doc_id LIKE ?)".to_string()
        }
    }
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

/// Renders the filter tree as a MySQL boolean predicate over the JSON
/// document column.
pub(crate) fn render_filter(filter: &Filter, args: &mut Vec<SqlArg>) -> Result<String> {
    match filter.kind() {
        FilterKind::Equality => {
            let (_, path) = json_path(filter)?;
            if filter.value().is_null() {
                return Ok(format!("JSON_EXTRACT(data, {}) IS NULL", path));
            }
            if filter.is_multi_valued() == Some(true) {
                return match filter.value() {
                    FilterValue::Text(text) => {
                        args.push(SqlArg::Text(text.clone()));
                        Ok(format!(
                            "JSON_CONTAINS(JSON_EXTRACT(data, {}), JSON_QUOTE(?))",
                            path
                        ))
                    }
                    other => {
                        args.push(SqlArg::Text(other.render()));
                        Ok(format!(
                            "JSON_CONTAINS(JSON_EXTRACT(data, {}), CAST(? AS JSON))",
                            path
                        ))
                    }
                };
            }
            match filter.value() {
                FilterValue::Text(text) => {
                    args.push(SqlArg::Text(text.clone()));
                    Ok(format!(
                        "JSON_UNQUOTE(JSON_EXTRACT(data, {})) = ?",
                        path
                    ))
                }
                FilterValue::Integer(int) => {
                    args.push(SqlArg::Int(*int));
                    Ok(format!("JSON_EXTRACT(data, {}) = ?", path))
                }
                FilterValue::Boolean(boolean) => {
                    args.push(SqlArg::Text(boolean.to_string()));
                    Ok(format!(
                        "JSON_EXTRACT(data, {}) = CAST(? AS JSON)",
                        path
                    ))
                }
                FilterValue::Null => unreachable!("null handled above"),
            }
        }
        FilterKind::Presence => {
            let (_, path) = json_path(filter)?;
            Ok(format!("JSON_CONTAINS_PATH(data, 'one', {})", path))
        }
        FilterKind::LessOrEqual | FilterKind::GreaterOrEqual => {
            let (_, path) = json_path(filter)?;
            let sign = filter.kind().sign();
            match filter.value() {
                FilterValue::Integer(int) => {
                    args.push(SqlArg::Int(*int));
                    Ok(format!("JSON_EXTRACT(data, {}) {} ?", path, sign))
                }
                other => {
                    push_value(args, other);
                    Ok(format!(
                        "JSON_UNQUOTE(JSON_EXTRACT(data, {})) {} ?",
                        path, sign
                    ))
                }
            }
        }
        FilterKind::Substring => {
            let (_, path) = json_path(filter)?;
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
            args.push(SqlArg::Text(pattern));
            Ok(format!(
                "JSON_UNQUOTE(JSON_EXTRACT(data, {})) LIKE ?",
                path
            ))
        }
        FilterKind::Lowercase => {
            let child = &filter.children()[0];
            let (_, path) = json_path(child)?;
            args.push(SqlArg::Text(child.value().render().to_lowercase()));
            Ok(format!(
                "LOWER(JSON_UNQUOTE(JSON_EXTRACT(data, {}))) = ?",
                path
            ))
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
            backend: "sql",
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

fn entry_from_row(row: MySqlRow) -> Result<Entry> {
    let dn: String = row.try_get("dn")?;
    let data: Value = row.try_get("data")?;
    entry_from_parts(&dn, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_equality_over_json_document() {
        let filter = Filter::equality("uid", "jdoe").unwrap();
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(rendered, "JSON_UNQUOTE(JSON_EXTRACT(data, '$.uid')) = ?");
        assert_eq!(args, vec![SqlArg::Text("jdoe".to_string())]);
    }

    #[test]
    fn test_render_multi_valued_membership() {
        let filter = Filter::equality("memberOf", "admins")
            .unwrap()
            .multi_valued(true);
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(
            rendered,
            "JSON_CONTAINS(JSON_EXTRACT(data, '$.memberOf'), JSON_QUOTE(?))"
        );
    }

    #[test]
    fn test_render_lowercase_appends_case_fold() {
        let filter =
            Filter::lowercase(Filter::equality("mail", "JDoe@Example.org").unwrap()).unwrap();
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(
            rendered,
            "LOWER(JSON_UNQUOTE(JSON_EXTRACT(data, '$.mail'))) = ?"
        );
        assert_eq!(args, vec![SqlArg::Text("jdoe@example.org".to_string())]);
    }

    #[test]
    fn test_render_composite_boolean_predicate() {
        let filter = Filter::or(vec![
            Filter::equality("status", "active").unwrap(),
            Filter::not(Filter::presence("locked").unwrap()),
        ])
        .unwrap();
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(
            rendered,
            "(JSON_UNQUOTE(JSON_EXTRACT(data, '$.status')) = ? OR NOT (JSON_CONTAINS_PATH(data, 'one', '$.locked')))"
        );
    }

    #[test]
    fn test_substring_unsupported_constructs_fail_loudly() {
        let filter = Filter::approximate_match("sn", "smith").unwrap();
        let mut args = Vec::new();
        match render_filter(&filter, &mut args).unwrap_err() {
            PersistError::UnsupportedFilter { backend, node } => {
                assert_eq!(backend, "sql");
                assert!(node.contains("sn~=smith"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_table_resolution() {
        assert_eq!(table_of("people_B1F3").unwrap(), "people");
        assert_eq!(table_of("clients_scopes_0A44").unwrap(), "clients");
        assert!(table_of("_").is_err());
        assert!(table_of("bad name_1").is_err());
    }

    #[test]
    fn test_scope_predicates() {
        let mut args = Vec::new();
        assert_eq!(
            scope_predicate("people_B1F3", SearchScope::Base, &mut args),
            "doc_id = ?"
        );
        assert_eq!(
            scope_predicate("people", SearchScope::Sub, &mut args),
            "(doc_id = ? OR doc_id LIKE ?)"
        );
        assert_eq!(
            args,
            vec![
                SqlArg::Text("people_B1F3".to_string()),
                SqlArg::Text("people".to_string()),
                SqlArg::Text("people\\_%".to_string()),
            ]
        );
    }

    #[test]
    fn test_attribute_name_validation_blocks_path_injection() {
        let filter = Filter::equality("uid' OR 1=1 --", "x").unwrap();
        let mut args = Vec::new();
        assert!(matches!(
            render_filter(&filter, &mut args).unwrap_err(),
            PersistError::InvalidFilter(_)
        ));
    }
}
