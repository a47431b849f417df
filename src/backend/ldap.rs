//! Directory-protocol adapter
//!
//! Translates the filter tree into RFC 4515 filter strings and executes
//! them over `ldap3`. The directory is the one hierarchical backend, so
//! no key folding happens here; identifiers are used as-is. Search is
//! lazy: entries are surfaced as the server streams them.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream;
use ldap3::{Ldap, LdapConnAsync, LdapError, Mod, Scope, SearchEntry};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{BackendOperations, EntryStream, OpContext, USER_PASSWORD};
use crate::config::{BackendKind, LdapConfig, PropertyMap};
use crate::entry::{AttributeChange, Entry, SearchScope};
use crate::error::{PersistError, Result};
use crate::extension::{ExtensionContext, Hooks, PersistenceExtension};
use crate::filter::{Filter, FilterKind};
use crate::instrument::{OpInstrument, OperationKind};

const NO_SUCH_OBJECT: u32 = 32;

pub struct LdapBackend {
    ldap: Mutex<Ldap>,
    url: String,
    hooks: Hooks,
    instrument: OpInstrument,
}

impl LdapBackend {
    pub async fn connect(
        config: &LdapConfig,
        extension: Option<Arc<dyn PersistenceExtension>>,
        properties: PropertyMap,
    ) -> Result<Self> {
        let (conn, mut ldap) = LdapConnAsync::new(&config.url).await?;
        ldap3::drive!(conn);
        ldap.simple_bind(&config.bind_dn, &config.bind_password)
            .await?
            .success()?;

        tracing::info!(url = %config.url, "directory adapter connected");

        Ok(LdapBackend {
            ldap: Mutex::new(ldap),
            url: config.url.clone(),
            hooks: Hooks::new(extension, ExtensionContext::new(BackendKind::Ldap, properties)),
            instrument: OpInstrument::new("ldap"),
        })
    }

    fn scope_of(scope: SearchScope) -> Scope {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::One => Scope::OneLevel,
            SearchScope::Sub => Scope::Subtree,
        }
    }
}

#[async_trait::async_trait]
impl BackendOperations for LdapBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ldap
    }

    async fn search(
        &self,
        ctx: &OpContext,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<EntryStream> {
        let filter_string = render_filter(filter)?;
        let mut ldap = self.ldap.lock().await.clone();
        let base = base.to_string();
        let native_scope = Self::scope_of(scope);

        let search = self
            .instrument
            .measure(
                OperationKind::Search,
                ctx.run("search", async move {
                    ldap.streaming_search(
                        &base,
                        native_scope,
                        &filter_string,
                        vec!["*".to_string()],
                    )
                    .await
                    .map_err(PersistError::from)
                }),
            )
            .await?;

        let entries = stream::try_unfold(search, |mut search| async move {
            match search.next().await {
                Ok(Some(result_entry)) => {
                    let entry = to_entry(SearchEntry::construct(result_entry));
                    Ok(Some((entry, search)))
                }
                Ok(None) => {
                    let _ = search.finish().await;
                    Ok(None)
                }
                Err(err) => Err(PersistError::from(err)),
            }
        });
        Ok(Box::pin(entries))
    }

    async fn add(&self, ctx: &OpContext, entry: &Entry) -> Result<()> {
        self.hooks.before_create(entry).await?;

        let mut attrs: Vec<(String, HashSet<String>)> = Vec::new();
        for (name, values) in entry.attributes() {
            let mut rendered: HashSet<String> = values.iter().map(render_value).collect();
            if name == USER_PASSWORD {
                rendered = rendered
                    .into_iter()
                    .map(|plain| {
                        Ok(self
                            .hooks
                            .hash_credential(&plain)?
                            .unwrap_or(plain))
                    })
                    .collect::<Result<HashSet<String>>>()?;
            }
            attrs.push((name.to_string(), rendered));
        }

        let dn = entry.dn().to_string();
        self.instrument
            .measure(
                OperationKind::Add,
                ctx.run("add", async {
                    let mut ldap = self.ldap.lock().await;
                    ldap.add(&dn, attrs).await?.success()?;
                    Ok(())
                }),
            )
            .await?;

        self.hooks.after_create(entry).await
    }

    async fn modify(&self, ctx: &OpContext, dn: &str, changes: &[AttributeChange]) -> Result<()> {
        let mods: Vec<Mod<String>> = changes
            .iter()
            .map(|change| match change {
                AttributeChange::Set(name, values) => {
                    Mod::Replace(name.clone(), values.iter().map(render_value).collect())
                }
                AttributeChange::Add(name, values) => {
                    Mod::Add(name.clone(), values.iter().map(render_value).collect())
                }
                AttributeChange::Remove(name) => Mod::Delete(name.clone(), HashSet::new()),
            })
            .collect();

        let dn = dn.to_string();
        self.instrument
            .measure(
                OperationKind::Modify,
                ctx.run("modify", async {
                    let mut ldap = self.ldap.lock().await;
                    ldap.modify(&dn, mods).await?.success()?;
                    Ok(())
                }),
            )
            .await
    }

    async fn remove(&self, ctx: &OpContext, dn: &str) -> Result<()> {
        let entry = Entry::new(dn);
        self.hooks.before_destroy(&entry).await?;

        let target = dn.to_string();
        self.instrument
            .measure(
                OperationKind::Remove,
                ctx.run("remove", async {
                    let mut ldap = self.ldap.lock().await;
                    ldap.delete(&target).await?.success()?;
                    Ok(())
                }),
            )
            .await?;

        self.hooks.after_destroy(&entry).await
    }

    async fn exists(&self, ctx: &OpContext, dn: &str) -> Result<bool> {
        let dn = dn.to_string();
        self.instrument
            .measure(
                OperationKind::Exists,
                ctx.run("exists", async {
                    let mut ldap = self.ldap.lock().await;
                    let outcome = ldap
                        .search(&dn, Scope::Base, "(objectClass=*)", vec!["1.1"])
                        .await?
                        .success();
                    match outcome {
                        Ok((entries, _)) => Ok(!entries.is_empty()),
                        Err(LdapError::LdapResult { result }) if result.rc == NO_SUCH_OBJECT => {
                            Ok(false)
                        }
                        Err(err) => Err(PersistError::from(err)),
                    }
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
        let filter_string = render_filter(filter)?;
        let base = base.to_string();
        let native_scope = Self::scope_of(scope);
        // The directory protocol has no server-side count; entries are
        // streamed with no attributes and tallied.
        self.instrument
            .measure(
                OperationKind::Count,
                ctx.run("count", async {
                    let mut ldap = self.ldap.lock().await;
                    let (entries, _) = ldap
                        .search(&base, native_scope, &filter_string, vec!["1.1"])
                        .await?
                        .success()?;
                    Ok(entries.len() as u64)
                }),
            )
            .await
    }

    async fn authenticate(&self, ctx: &OpContext, dn: &str, credential: &str) -> Result<bool> {
        if self.hooks.is_installed() {
            let dn_owned = dn.to_string();
            let stored = self
                .instrument
                .measure(
                    OperationKind::Authenticate,
                    ctx.run("authenticate", async {
                        let mut ldap = self.ldap.lock().await;
                        let (entries, _) = ldap
                            .search(
                                &dn_owned,
                                Scope::Base,
                                "(objectClass=*)",
                                vec![USER_PASSWORD],
                            )
                            .await?
                            .success()?;
                        Ok(entries.into_iter().next())
                    }),
                )
                .await?;

            let Some(result_entry) = stored else {
                return Ok(false);
            };
            let entry = to_entry(SearchEntry::construct(result_entry));
            let Some(stored_value) = entry.first_text(USER_PASSWORD) else {
                return Ok(false);
            };
            return Ok(self
                .hooks
                .verify_credential(credential, stored_value)?
                .unwrap_or(false));
        }

        // No extension: a plain bind on a dedicated connection, so the
        // pooled handle keeps its service identity.
        let url = self.url.clone();
        let dn = dn.to_string();
        let credential = credential.to_string();
        self.instrument
            .measure(
                OperationKind::Authenticate,
                ctx.run("authenticate", async move {
                    let (conn, mut ldap) = LdapConnAsync::new(&url).await?;
                    ldap3::drive!(conn);
                    let bound = ldap.simple_bind(&dn, &credential).await?.success().is_ok();
                    let _ = ldap.unbind().await;
                    Ok(bound)
                }),
            )
            .await
    }

    async fn shutdown(&self) -> Result<()> {
        let mut ldap = self.ldap.lock().await;
        ldap.unbind().await?;
        Ok(())
    }
}

fn to_entry(search_entry: SearchEntry) -> Entry {
    let mut entry = Entry::new(&search_entry.dn);
    for (name, values) in search_entry.attrs {
        entry.set_attribute(&name, values.into_iter().map(Value::String).collect());
    }
    entry
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// RFC 4515 value escaping.
fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\5c"),
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\0' => escaped.push_str("\\00"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Renders the filter tree in the directory protocol's string syntax.
/// The case-fold marker is realized at the application layer: the
/// assertion value is folded before the filter is sent.
pub(crate) fn render_filter(filter: &Filter) -> Result<String> {
    match filter.kind() {
        FilterKind::Raw => Ok(filter.raw_expression().unwrap_or_default().to_string()),
        FilterKind::Presence => Ok(format!("({}=*)", filter.attribute().unwrap_or_default())),
        FilterKind::Equality
        | FilterKind::LessOrEqual
        | FilterKind::GreaterOrEqual
        | FilterKind::ApproximateMatch => Ok(format!(
            "({}{}{})",
            filter.attribute().unwrap_or_default(),
            filter.kind().sign(),
            escape_value(&filter.value().render())
        )),
        FilterKind::Substring => {
            let mut rendered = format!("({}=", filter.attribute().unwrap_or_default());
            if let Some(initial) = filter.sub_initial() {
                rendered.push_str(&escape_value(initial));
            }
            rendered.push('*');
            for any in filter.sub_any() {
                rendered.push_str(&escape_value(any));
                rendered.push('*');
            }
            if let Some(fin) = filter.sub_final() {
                rendered.push_str(&escape_value(fin));
            }
            rendered.push(')');
            Ok(rendered)
        }
        FilterKind::Not => Ok(format!("(!{})", render_filter(&filter.children()[0])?)),
        FilterKind::And | FilterKind::Or => {
            let mut rendered = format!("({}", filter.kind().sign());
            for child in filter.children() {
                rendered.push_str(&render_filter(child)?);
            }
            rendered.push(')');
            Ok(rendered)
        }
        FilterKind::Lowercase => {
            let child = &filter.children()[0];
            Ok(format!(
                "({}={})",
                child.attribute().unwrap_or_default(),
                escape_value(&child.value().render().to_lowercase())
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_composite() {
        let filter = Filter::and(vec![
            Filter::equality("uid", "jdoe").unwrap(),
            Filter::or(vec![
                Filter::presence("mail").unwrap(),
                Filter::not(Filter::greater_or_equal("loginCount", 5).unwrap()),
            ])
            .unwrap(),
        ])
        .unwrap();
        assert_eq!(
            render_filter(&filter).unwrap(),
            "(&(uid=jdoe)(|(mail=*)(!(loginCount>=5))))"
        );
    }

    #[test]
    fn test_render_escapes_special_characters() {
        let filter = Filter::equality("cn", "a*(b)\\c").unwrap();
        assert_eq!(
            render_filter(&filter).unwrap(),
            "(cn=a\\2a\\28b\\29\\5cc)"
        );
    }

    #[test]
    fn test_render_lowercase_folds_at_application_layer() {
        let filter =
            Filter::lowercase(Filter::equality("objectClass", "PERSON").unwrap()).unwrap();
        assert_eq!(render_filter(&filter).unwrap(), "(objectClass=person)");
    }

    #[test]
    fn test_render_substring() {
        let filter = Filter::substring("cn", Some("Jo"), &["h"], Some("n")).unwrap();
        assert_eq!(render_filter(&filter).unwrap(), "(cn=Jo*h*n)");
    }

    #[test]
    fn test_render_approximate_uses_tilde_sign() {
        let filter = Filter::approximate_match("sn", "smith").unwrap();
        assert_eq!(render_filter(&filter).unwrap(), "(sn~=smith)");
    }

    #[test]
    fn test_render_raw_passthrough() {
        let filter = Filter::raw("(uid=jdoe)");
        assert_eq!(render_filter(&filter).unwrap(), "(uid=jdoe)");
    }
}
