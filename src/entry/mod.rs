//! Persisted object model shared by all backend adapters

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Search scope relative to the base identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchScope {
    /// The base entry itself.
    Base,
    /// Direct children of the base.
    One,
    /// The whole subtree.
    Sub,
}

/// A persisted object: a hierarchical identifier plus an opaque map of
/// multi-valued attributes supplied by the caller's object mapping.
///
/// Attribute order is kept stable (sorted) so rendered queries and
/// serialized documents are reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    dn: String,
    attributes: BTreeMap<String, Vec<Value>>,
}

impl Entry {
    pub fn new(dn: &str) -> Self {
        Entry {
            dn: dn.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn with_attribute(mut self, name: &str, values: Vec<Value>) -> Self {
        self.attributes.insert(name.to_string(), values);
        self
    }

    pub fn with_text_attribute(self, name: &str, value: &str) -> Self {
        self.with_attribute(name, vec![Value::String(value.to_string())])
    }

    pub fn set_attribute(&mut self, name: &str, values: Vec<Value>) {
        self.attributes.insert(name.to_string(), values);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Vec<Value>> {
        self.attributes.remove(name)
    }

    pub fn attribute(&self, name: &str) -> Option<&[Value]> {
        self.attributes.get(name).map(Vec::as_slice)
    }

    /// First value of the attribute, rendered as text.
    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)?
            .first()
            .and_then(Value::as_str)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.attributes
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn object_classes(&self) -> Vec<&str> {
        self.attribute("objectClass")
            .map(|values| values.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// A single mutation applied by `modify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeChange {
    /// Replace the attribute's values (creating it if absent).
    Set(String, Vec<Value>),
    /// Append values to the attribute.
    Add(String, Vec<Value>),
    /// Drop the attribute entirely.
    Remove(String),
}

impl AttributeChange {
    pub fn attribute(&self) -> &str {
        match self {
            AttributeChange::Set(name, _)
            | AttributeChange::Add(name, _)
            | AttributeChange::Remove(name) => name,
        }
    }

    /// Applies this change to an attribute map form of an entry. Used by
    /// the flat backends, which rewrite the stored document.
    pub fn apply(&self, entry: &mut Entry) {
        match self {
            AttributeChange::Set(name, values) => {
                entry.set_attribute(name, values.clone());
            }
            AttributeChange::Add(name, values) => {
                let mut merged = entry
                    .attribute(name)
                    .map(<[Value]>::to_vec)
                    .unwrap_or_default();
                merged.extend(values.iter().cloned());
                entry.set_attribute(name, merged);
            }
            AttributeChange::Remove(name) => {
                entry.remove_attribute(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_attribute_accessors() {
        let entry = Entry::new("inum=1,ou=people,o=identra")
            .with_text_attribute("uid", "jdoe")
            .with_attribute("memberOf", vec![json!("admins"), json!("users")]);
        assert_eq!(entry.first_text("uid"), Some("jdoe"));
        assert_eq!(entry.attribute("memberOf").unwrap().len(), 2);
        assert_eq!(entry.first_text("missing"), None);
    }

    #[test]
    fn test_changes_apply() {
        let mut entry = Entry::new("inum=1,ou=people,o=identra")
            .with_text_attribute("mail", "a@example.org")
            .with_text_attribute("sn", "Doe");

        AttributeChange::Set("mail".into(), vec![json!("b@example.org")]).apply(&mut entry);
        AttributeChange::Add("mail".into(), vec![json!("c@example.org")]).apply(&mut entry);
        AttributeChange::Remove("sn".into()).apply(&mut entry);

        assert_eq!(
            entry.attribute("mail").unwrap(),
            &[json!("b@example.org"), json!("c@example.org")]
        );
        assert!(entry.attribute("sn").is_none());
    }

    #[test]
    fn test_object_classes() {
        let entry = Entry::new("inum=1,ou=people,o=identra")
            .with_attribute("objectClass", vec![json!("top"), json!("person")]);
        assert_eq!(entry.object_classes(), vec!["top", "person"]);
    }
}
