//! Attribute shortener: verbose schema names -> compact storage tokens
//!
//! Flat backends keep composite keys and stored field names short by
//! mapping schema attribute names through a deterministic, reversible
//! rule: strip the vendor namespace prefix, then collapse a trailing
//! `Type` class-indicator word to `_t` (abbreviating well-known stems).
//! The mapping must be injective over the schema set actually in use;
//! that is validated once when the table is built, never per call. All
//! processes sharing a flat-backend dataset must be built from the same
//! schema set, otherwise decoding fails.

use std::collections::HashMap;

use anyhow::bail;

use crate::error::{PersistError, Result};

/// Vendor/schema namespace prefixes, longest first so compound prefixes
/// win over their stems.
const PREFIXES: &[&str] = &["oxAuth", "oxTrust", "gluu", "jans", "ox"];

/// Whole-stem abbreviations applied when the `Type` suffix collapses.
const STEM_ABBREVIATIONS: &[(&str, &str)] = &[
    ("attribute", "attr"),
    ("application", "app"),
    ("configuration", "conf"),
];

const TYPE_SUFFIX: &str = "Type";
const TYPE_TOKEN: &str = "_t";

/// Computes the storage token for an attribute name. Deterministic and
/// total; injectivity over a concrete schema set is the table's job.
pub fn shortcut_name(attribute: &str) -> String {
    let stripped = strip_prefix(attribute);
    if let Some(stem) = stripped.strip_suffix(TYPE_SUFFIX) {
        if !stem.is_empty() {
            return format!("{}{}", abbreviate(&decapitalize(stem)), TYPE_TOKEN);
        }
    }
    decapitalize(stripped)
}

fn strip_prefix(attribute: &str) -> &str {
    for prefix in PREFIXES {
        if let Some(rest) = attribute.strip_prefix(prefix) {
            // Only treat it as a namespace prefix when a camel-case word
            // follows; "oxygen" keeps its name.
            if rest.starts_with(|c: char| c.is_ascii_uppercase()) {
                return rest;
            }
        }
    }
    attribute
}

fn decapitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn abbreviate(stem: &str) -> String {
    for (word, short) in STEM_ABBREVIATIONS {
        if stem == *word {
            return (*short).to_string();
        }
    }
    stem.to_string()
}

/// Forward and inverse shortcut tables over a schema's attribute set.
/// Built once at process start; read-only afterwards.
#[derive(Debug, Clone)]
pub struct ShortcutTable {
    forward: HashMap<String, String>,
    inverse: HashMap<String, String>,
}

impl ShortcutTable {
    /// Builds the table, verifying the mapping is injective over the
    /// supplied attribute set.
    pub fn build<'a>(attributes: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Self> {
        let mut forward = HashMap::new();
        let mut inverse: HashMap<String, String> = HashMap::new();
        for attribute in attributes {
            let token = shortcut_name(attribute);
            if let Some(existing) = inverse.get(&token) {
                if existing != attribute {
                    bail!(
                        "shortcut collision: '{}' and '{}' both map to '{}'",
                        existing,
                        attribute,
                        token
                    );
                }
                continue;
            }
            inverse.insert(token.clone(), attribute.to_string());
            forward.insert(attribute.to_string(), token);
        }
        Ok(ShortcutTable { forward, inverse })
    }

    /// Storage token for an attribute. Total: names outside the schema
    /// set fall back to the deterministic rule.
    pub fn shortcut(&self, attribute: &str) -> String {
        self.forward
            .get(attribute)
            .cloned()
            .unwrap_or_else(|| shortcut_name(attribute))
    }

    /// Reverses a storage token. Unknown tokens indicate a table mismatch
    /// between writer and reader.
    pub fn unshortcut(&self, token: &str) -> Result<&str> {
        self.inverse
            .get(token)
            .map(String::as_str)
            .ok_or_else(|| {
                PersistError::MalformedKey(format!(
                    "unknown shortcut token '{}': shortcut-table mismatch",
                    token
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const SCHEMA: &[&str] = &[
        "gluuAttributeType",
        "oxAuthAppType",
        "oxAuthLogoutSessionRequired",
        "oxIconUrl",
        "oxTrustActive",
        "jansScimStatus",
        "uid",
        "mail",
        "memberOf",
    ];

    #[rstest]
    #[case("gluuAttributeType", "attr_t")]
    #[case("oxAuthAppType", "app_t")]
    #[case("oxAuthLogoutSessionRequired", "logoutSessionRequired")]
    #[case("oxIconUrl", "iconUrl")]
    #[case("oxTrustActive", "active")]
    fn test_reference_oracle(#[case] attribute: &str, #[case] token: &str) {
        assert_eq!(shortcut_name(attribute), token);
    }

    #[test]
    fn test_unprefixed_names_pass_through() {
        assert_eq!(shortcut_name("uid"), "uid");
        assert_eq!(shortcut_name("memberOf"), "memberOf");
        assert_eq!(shortcut_name("oxygen"), "oxygen");
    }

    #[test]
    fn test_table_round_trip_over_schema() {
        let table = ShortcutTable::build(SCHEMA.iter().copied()).unwrap();
        for attribute in SCHEMA {
            let token = table.shortcut(attribute);
            assert_eq!(table.unshortcut(&token).unwrap(), *attribute);
        }
    }

    #[test]
    fn test_injectivity_over_schema() {
        let table = ShortcutTable::build(SCHEMA.iter().copied()).unwrap();
        let mut tokens: Vec<String> = SCHEMA.iter().map(|a| table.shortcut(a)).collect();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), SCHEMA.len());
    }

    #[test]
    fn test_collision_fails_at_build() {
        // Both collapse to attr_t once their prefixes are stripped.
        let err = ShortcutTable::build(["gluuAttributeType", "oxAttributeType"]).unwrap_err();
        assert!(err.to_string().contains("attr_t"));
    }

    #[test]
    fn test_unknown_token_is_table_mismatch() {
        let table = ShortcutTable::build(SCHEMA.iter().copied()).unwrap();
        assert!(matches!(
            table.unshortcut("nope_t").unwrap_err(),
            PersistError::MalformedKey(_)
        ));
    }

    #[test]
    fn test_duplicate_attribute_is_not_a_collision() {
        let table = ShortcutTable::build(["oxIconUrl", "oxIconUrl"]).unwrap();
        assert_eq!(table.len(), 1);
    }
}
