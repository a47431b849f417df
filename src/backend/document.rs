//! Document-store adapter (N1QL query service)
//!
//! Entries live in a single bucket keyed by the composite key the key
//! codec derives from their identifier; hierarchy is emulated with
//! `META().id` prefix predicates. Statements go through the HTTP query
//! service with positional parameters.

use std::sync::Arc;

use futures::stream;
use serde_json::{json, Value};

use super::{BackendOperations, EntryStream, OpContext, USER_PASSWORD};
use crate::config::{BackendKind, DocumentConfig, PropertyMap};
use crate::entry::{AttributeChange, Entry, SearchScope};
use crate::error::{PersistError, Result};
use crate::extension::{verify_with_schemes, ExtensionContext, Hooks, PersistenceExtension};
use crate::filter::processor::FilterProcessor;
use crate::filter::{Filter, FilterKind, FilterValue};
use crate::instrument::{OpInstrument, OperationKind};
use crate::key::KeyCodec;

const ALIAS: &str = "d";

pub struct DocumentBackend {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    username: String,
    password: String,
    request_plus: bool,
    substring_search: bool,
    codec: KeyCodec,
    hooks: Hooks,
    instrument: OpInstrument,
}

impl DocumentBackend {
    pub fn connect(
        config: &DocumentConfig,
        base_dn: &str,
        extension: Option<Arc<dyn PersistenceExtension>>,
        properties: PropertyMap,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(PersistError::from)?;
        check_identifier(&config.bucket)?;

        tracing::info!(url = %config.query_url, bucket = %config.bucket, "document adapter ready");

        Ok(DocumentBackend {
            http,
            endpoint: format!("{}/query/service", config.query_url.trim_end_matches('/')),
            bucket: config.bucket.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            request_plus: config.request_plus,
            substring_search: config.substring_search,
            codec: KeyCodec::new(base_dn)?,
            hooks: Hooks::new(
                extension,
                ExtensionContext::new(BackendKind::Document, properties),
            ),
            instrument: OpInstrument::new("document"),
        })
    }

    async fn execute(&self, statement: String, args: Vec<Value>) -> Result<Vec<Value>> {
        let mut body = json!({ "statement": statement, "args": args });
        if self.request_plus {
            body["scan_consistency"] = json!("request_plus");
        }

        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        let payload: Value = response.json().await?;

        if payload["status"] != "success" {
            let detail = payload["errors"][0]["msg"]
                .as_str()
                .unwrap_or("query failed")
                .to_string();
            return Err(PersistError::Operation(detail));
        }
        Ok(payload["results"].as_array().cloned().unwrap_or_default())
    }

    /// Rejects constructs the configured bucket cannot serve, naming the
    /// offending node.
    fn check_capabilities(&self, filter: &Filter) -> Result<()> {
        if self.substring_search {
            return Ok(());
        }
        if let Some(node) = find_node(filter, FilterKind::Substring) {
            return Err(PersistError::UnsupportedFilter {
                backend: "document",
                node: node.to_string(),
            });
        }
        Ok(())
    }

    async fn fetch_by_key(&self, key: &str) -> Result<Option<Value>> {
        let statement = format!(
            "SELECT RAW {a} FROM `{b}` AS {a} USE KEYS $1",
            a = ALIAS,
            b = self.bucket
        );
        let mut results = self.execute(statement, vec![json!(key)]).await?;
        Ok(if results.is_empty() {
            None
        } else {
            Some(results.remove(0))
        })
    }
}

#[async_trait::async_trait]
impl BackendOperations for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn search(
        &self,
        ctx: &OpContext,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<EntryStream> {
        self.check_capabilities(filter)?;
        let key = self.codec.container_key(base)?;
        let mut args = Vec::new();
        let mut predicates = Vec::new();
        if let Some(scoping) = scope_predicate(&key, scope, &mut args) {
            predicates.push(scoping);
        }
        // Entry types are encoded in the key, not as a predicate.
        predicates.push(match FilterProcessor::exclude_object_class_filters(filter) {
            Some(effective) => render_filter(&effective, &mut args)?,
            None => "TRUE".to_string(),
        });
        let statement = format!(
            "SELECT RAW {a} FROM `{b}` AS {a} WHERE {w}",
            a = ALIAS,
            b = self.bucket,
            w = predicates.join(" AND ")
        );

        let results = self
            .instrument
            .measure(
                OperationKind::Search,
                ctx.run("search", self.execute(statement, args)),
            )
            .await?;

        let entries: Vec<Result<Entry>> = results.into_iter().map(entry_from_doc).collect();
        Ok(Box::pin(stream::iter(entries)))
    }

    async fn add(&self, ctx: &OpContext, entry: &Entry) -> Result<()> {
        let key = self.codec.parse_dn(entry.dn())?;
        self.hooks.before_create(entry).await?;

        let doc = doc_from_entry(entry, &self.hooks)?;
        let statement = format!(
            "INSERT INTO `{b}` (KEY, VALUE) VALUES ($1, $2)",
            b = self.bucket
        );
        self.instrument
            .measure(
                OperationKind::Add,
                ctx.run("add", async {
                    self.execute(statement, vec![json!(key.key()), doc]).await?;
                    Ok(())
                }),
            )
            .await?;

        self.hooks.after_create(entry).await
    }

    async fn modify(&self, ctx: &OpContext, dn: &str, changes: &[AttributeChange]) -> Result<()> {
        let key = self.codec.parse_dn(dn)?;
        let statement = format!(
            "UPSERT INTO `{b}` (KEY, VALUE) VALUES ($1, $2)",
            b = self.bucket
        );

        self.instrument
            .measure(
                OperationKind::Modify,
                ctx.run("modify", async {
                    let doc = self
                        .fetch_by_key(key.key())
                        .await?
                        .ok_or_else(|| PersistError::NotFound(dn.to_string()))?;
                    let mut entry = entry_from_doc(doc)?;
                    for change in changes {
                        change.apply(&mut entry);
                    }
                    let doc = doc_from_entry(&entry, &self.hooks)?;
                    self.execute(statement, vec![json!(key.key()), doc]).await?;
                    Ok(())
                }),
            )
            .await
    }

    async fn remove(&self, ctx: &OpContext, dn: &str) -> Result<()> {
        let key = self.codec.parse_dn(dn)?;
        let entry = Entry::new(dn);
        self.hooks.before_destroy(&entry).await?;

        let statement = format!("DELETE FROM `{b}` USE KEYS $1", b = self.bucket);
        self.instrument
            .measure(
                OperationKind::Remove,
                ctx.run("remove", async {
                    self.execute(statement, vec![json!(key.key())]).await?;
                    Ok(())
                }),
            )
            .await?;

        self.hooks.after_destroy(&entry).await
    }

    async fn exists(&self, ctx: &OpContext, dn: &str) -> Result<bool> {
        let key = self.codec.parse_dn(dn)?;
        let statement = format!(
            "SELECT RAW META({a}).id FROM `{b}` AS {a} USE KEYS $1",
            a = ALIAS,
            b = self.bucket
        );
        self.instrument
            .measure(
                OperationKind::Exists,
                ctx.run("exists", async {
                    let results = self.execute(statement, vec![json!(key.key())]).await?;
                    Ok(!results.is_empty())
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
        self.check_capabilities(filter)?;
        let key = self.codec.container_key(base)?;
        let mut args = Vec::new();
        let mut predicates = Vec::new();
        if let Some(scoping) = scope_predicate(&key, scope, &mut args) {
            predicates.push(scoping);
        }
        predicates.push(match FilterProcessor::exclude_object_class_filters(filter) {
            Some(effective) => render_filter(&effective, &mut args)?,
            None => "TRUE".to_string(),
        });
        let statement = format!(
            "SELECT RAW COUNT(*) FROM `{b}` AS {a} WHERE {w}",
            a = ALIAS,
            b = self.bucket,
            w = predicates.join(" AND ")
        );

        self.instrument
            .measure(
                OperationKind::Count,
                ctx.run("count", async {
                    let results = self.execute(statement, args).await?;
                    Ok(results.first().and_then(Value::as_u64).unwrap_or(0))
                }),
            )
            .await
    }

    async fn authenticate(&self, ctx: &OpContext, dn: &str, credential: &str) -> Result<bool> {
        let key = self.codec.parse_dn(dn)?;
        let doc = self
            .instrument
            .measure(
                OperationKind::Authenticate,
                ctx.run("authenticate", self.fetch_by_key(key.key())),
            )
            .await?;

        let Some(doc) = doc else {
            return Ok(false);
        };
        let entry = entry_from_doc(doc)?;
        let Some(stored) = entry.first_text(USER_PASSWORD) else {
            return Ok(false);
        };
        match self.hooks.verify_credential(credential, stored)? {
            Some(verified) => Ok(verified),
            None => verify_with_schemes(credential, stored)
                .map_err(|e| PersistError::Operation(e.to_string())),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        // The query service is stateless over HTTP; nothing to release.
        Ok(())
    }
}

/// Timestamp form stored in the bucket: ISO instant with the UTC zone
/// designator dropped.
pub fn encode_time(time: chrono::DateTime<chrono::Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Inverse of [`encode_time`]; tolerates values that kept their zone
/// designator.
pub fn decode_time(text: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let with_zone = if text.ends_with('Z') {
        text.to_string()
    } else {
        format!("{text}Z")
    };
    chrono::DateTime::parse_from_rfc3339(&with_zone)
        .ok()
        .map(|time| time.with_timezone(&chrono::Utc))
}

fn find_node(filter: &Filter, kind: FilterKind) -> Option<&Filter> {
    if filter.kind() == kind {
        return Some(filter);
    }
    filter
        .children()
        .iter()
        .find_map(|child| find_node(child, kind))
}

fn check_identifier(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PersistError::Operation(format!(
            "invalid bucket or attribute identifier '{}'",
            name
        )));
    }
    Ok(())
}

fn check_attribute(filter: &Filter) -> Result<&str> {
    let attribute = filter
        .attribute()
        .ok_or_else(|| PersistError::InvalidFilter(format!("missing attribute in {}", filter)))?;
    if attribute.contains('`') {
        return Err(PersistError::InvalidFilter(format!(
            "invalid attribute name '{}'",
            attribute
        )));
    }
    Ok(attribute)
}

fn push_arg(args: &mut Vec<Value>, value: Value) -> String {
    args.push(value);
    format!("${}", args.len())
}

fn value_to_json(value: &FilterValue) -> Value {
    match value {
        FilterValue::Text(s) => json!(s),
        FilterValue::Integer(i) => json!(i),
        FilterValue::Boolean(b) => json!(b),
        FilterValue::Null => Value::Null,
    }
}

fn regex_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\.+*?()[]{}|^$/".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn like_escape(fragment: &str) -> String {
    fragment.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Key-prefix predicate emulating hierarchical scope over `META().id`.
fn scope_predicate(key: &str, scope: SearchScope, args: &mut Vec<Value>) -> Option<String> {
    let root = key == crate::key::ROOT_KEY;
    match scope {
        SearchScope::Base => {
            let placeholder = push_arg(args, json!(key));
            Some(format!("META({}).id = {}", ALIAS, placeholder))
        }
        SearchScope::One => {
            let pattern = if root {
                "^[^_]+$".to_string()
            } else {
                format!("^{}_[^_]+$", regex_escape(key))
            };
            Some(format!("REGEXP_CONTAINS(META({}).id, '{}')", ALIAS, pattern))
        }
        SearchScope::Sub => {
            if root {
                None
            } else {
                Some(format!(
                    "REGEXP_CONTAINS(META({}).id, '^{}(_|$)')",
                    ALIAS,
                    regex_escape(key)
                ))
            }
        }
    }
}

/// Renders the filter tree as an N1QL boolean expression with positional
/// parameters.
pub(crate) fn render_filter(filter: &Filter, args: &mut Vec<Value>) -> Result<String> {
    match filter.kind() {
        FilterKind::Equality => {
            let attribute = check_attribute(filter)?;
            if filter.value().is_null() {
                return Ok(format!("{}.`{}` IS NULL", ALIAS, attribute));
            }
            let placeholder = push_arg(args, value_to_json(filter.value()));
            if filter.is_multi_valued() == Some(true) {
                Ok(format!(
                    "ANY v_ IN {}.`{}` SATISFIES v_ = {} END",
                    ALIAS, attribute, placeholder
                ))
            } else {
                Ok(format!("{}.`{}` = {}", ALIAS, attribute, placeholder))
            }
        }
        FilterKind::Presence => {
            let attribute = check_attribute(filter)?;
            Ok(format!("{}.`{}` IS NOT MISSING", ALIAS, attribute))
        }
        FilterKind::LessOrEqual | FilterKind::GreaterOrEqual => {
            let attribute = check_attribute(filter)?;
            let placeholder = push_arg(args, value_to_json(filter.value()));
            Ok(format!(
                "{}.`{}` {} {}",
                ALIAS,
                attribute,
                filter.kind().sign(),
                placeholder
            ))
        }
        FilterKind::Substring => {
            let attribute = check_attribute(filter)?;
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
            let placeholder = push_arg(args, json!(pattern));
            Ok(format!("{}.`{}` LIKE {}", ALIAS, attribute, placeholder))
        }
        FilterKind::Lowercase => {
            let child = &filter.children()[0];
            let attribute = check_attribute(child)?;
            let folded = child.value().render().to_lowercase();
            let placeholder = push_arg(args, json!(folded));
            Ok(format!("LOWER({}.`{}`) = {}", ALIAS, attribute, placeholder))
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
            backend: "document",
            node: filter.to_string(),
        }),
    }
}

fn doc_from_entry(entry: &Entry, hooks: &Hooks) -> Result<Value> {
    let mut doc = serde_json::Map::new();
    doc.insert("dn".to_string(), json!(entry.dn()));
    for (name, values) in entry.attributes() {
        let values: Vec<Value> = if name == USER_PASSWORD {
            values
                .iter()
                .map(|v| {
                    let plain = v.as_str().unwrap_or_default().to_string();
                    Ok(match hooks.hash_credential(&plain)? {
                        Some(hashed) => json!(hashed),
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
        doc.insert(name.to_string(), stored);
    }
    Ok(Value::Object(doc))
}

fn entry_from_doc(doc: Value) -> Result<Entry> {
    let Value::Object(map) = doc else {
        return Err(PersistError::Operation(
            "document result is not an object".to_string(),
        ));
    };
    let dn = map
        .get("dn")
        .and_then(Value::as_str)
        .ok_or_else(|| PersistError::Operation("document has no dn field".to_string()))?
        .to_string();

    let mut entry = Entry::new(&dn);
    for (name, value) in map {
        if name == "dn" {
            continue;
        }
        let values = match value {
            Value::Array(values) => values,
            single => vec![single],
        };
        entry.set_attribute(&name, values);
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_equality_and_lowercase() {
        let filter = Filter::and(vec![
            Filter::equality("uid", "jdoe").unwrap(),
            Filter::lowercase(Filter::equality("mail", "JDoe@Example.org").unwrap()).unwrap(),
        ])
        .unwrap();
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(rendered, "(d.`uid` = $1 AND LOWER(d.`mail`) = $2)");
        assert_eq!(args, vec![json!("jdoe"), json!("jdoe@example.org")]);
    }

    #[test]
    fn test_render_multi_valued_membership() {
        let filter = Filter::equality("memberOf", "admins")
            .unwrap()
            .multi_valued(true);
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(rendered, "ANY v_ IN d.`memberOf` SATISFIES v_ = $1 END");
    }

    #[test]
    fn test_render_substring_escapes_like_wildcards() {
        let filter = Filter::substring("cn", Some("100%"), &[], None).unwrap();
        let mut args = Vec::new();
        let rendered = render_filter(&filter, &mut args).unwrap();
        assert_eq!(rendered, "d.`cn` LIKE $1");
        assert_eq!(args, vec![json!("100\\%%")]);
    }

    #[test]
    fn test_approximate_match_unsupported() {
        let filter = Filter::approximate_match("sn", "smith").unwrap();
        let mut args = Vec::new();
        let err = render_filter(&filter, &mut args).unwrap_err();
        match err {
            PersistError::UnsupportedFilter { backend, node } => {
                assert_eq!(backend, "document");
                assert_eq!(node, "(sn~=smith)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_scope_predicates() {
        let mut args = Vec::new();
        assert_eq!(
            scope_predicate("people_B1F3", SearchScope::Base, &mut args).unwrap(),
            "META(d).id = $1"
        );
        assert_eq!(
            scope_predicate("people", SearchScope::One, &mut args).unwrap(),
            "REGEXP_CONTAINS(META(d).id, '^people_[^_]+$')"
        );
        assert_eq!(
            scope_predicate("people", SearchScope::Sub, &mut args).unwrap(),
            "REGEXP_CONTAINS(META(d).id, '^people(_|$)')"
        );
        assert!(scope_predicate("_", SearchScope::Sub, &mut args).is_none());
    }

    #[test]
    fn test_time_codec_round_trip() {
        use chrono::{TimeZone, Utc};
        let time = Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 12).unwrap();
        let encoded = encode_time(time);
        assert_eq!(encoded, "2024-05-17T09:30:12.000");
        assert_eq!(decode_time(&encoded).unwrap(), time);
        assert_eq!(decode_time("2024-05-17T09:30:12.000Z").unwrap(), time);
    }

    #[test]
    fn test_doc_round_trip() {
        let hooks = Hooks::new(
            None,
            ExtensionContext::new(BackendKind::Document, PropertyMap::new()),
        );
        let entry = Entry::new("inum=1,ou=people,o=identra")
            .with_text_attribute("uid", "jdoe")
            .with_attribute("memberOf", vec![json!("admins"), json!("users")]);
        let doc = doc_from_entry(&entry, &hooks).unwrap();
        assert_eq!(doc["uid"], json!("jdoe"));
        assert_eq!(doc["memberOf"], json!(["admins", "users"]));
        let decoded = entry_from_doc(doc).unwrap();
        assert_eq!(decoded, entry);
    }
}
