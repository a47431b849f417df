//! Key codec: hierarchical identifiers <-> flat composite keys
//!
//! Flat backends (document store, relational/JSON, distributed SQL) have
//! no native hierarchical namespace. The codec folds a directory-style
//! identifier such as `inum=B1F3-DE2F,ou=people,o=identra` into the
//! composite key `people_B1F3-DE2F`, preserving enough structure to
//! reconstruct the identifier and to scope queries to a subtree by key
//! prefix.

pub mod shortcut;

use serde::{Deserialize, Serialize};

use crate::error::{PersistError, Result};

/// Unique-id RDN attribute carried by every persisted entry.
const ID_ATTRIBUTE: &str = "inum";
/// Container RDN attribute.
const CONTAINER_ATTRIBUTE: &str = "ou";
/// Composite key separator.
const SEPARATOR: char = '_';
/// Key of the root (base) entry.
pub const ROOT_KEY: &str = "_";

/// Flat-backend identity of an entry: the full composite `key`, the
/// immediate container `name` (the entry's type/collection) and the
/// unique internal identifier `inum`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedKey {
    key: String,
    name: String,
    inum: String,
}

impl ParsedKey {
    pub fn new(key: &str, name: &str, inum: &str) -> Self {
        ParsedKey {
            key: key.to_string(),
            name: name.to_string(),
            inum: inum.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inum(&self) -> &str {
        &self.inum
    }
}

/// Bidirectional mapping between identifiers under a configured base and
/// composite keys. Values must not contain the `_` separator; the codec
/// rejects them rather than producing undecodable keys.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    base_dn: String,
    base_rdns: Vec<(String, String)>,
}

impl KeyCodec {
    pub fn new(base_dn: &str) -> Result<Self> {
        let base_rdns = parse_rdns(base_dn)?;
        Ok(KeyCodec {
            base_dn: base_dn.to_string(),
            base_rdns,
        })
    }

    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Derives the flat identity of an entry identifier. The leaf RDN
    /// must carry the internal unique id.
    pub fn parse_dn(&self, dn: &str) -> Result<ParsedKey> {
        let scoped = self.strip_base(dn)?;
        if scoped.is_empty() {
            return Err(PersistError::MalformedKey(format!(
                "'{}' has no unique-id component",
                dn
            )));
        }

        let (leaf_attr, inum) = &scoped[0];
        if !leaf_attr.eq_ignore_ascii_case(ID_ATTRIBUTE) {
            return Err(PersistError::MalformedKey(format!(
                "'{}' has no unique-id component: leaf RDN is '{}'",
                dn, leaf_attr
            )));
        }
        check_value(dn, inum)?;

        let mut containers = Vec::with_capacity(scoped.len() - 1);
        for (attr, value) in &scoped[1..] {
            if !attr.eq_ignore_ascii_case(CONTAINER_ATTRIBUTE) {
                return Err(PersistError::MalformedKey(format!(
                    "'{}' has a non-container RDN '{}' above the unique id",
                    dn, attr
                )));
            }
            check_value(dn, value)?;
            containers.push(value.clone());
        }

        let name = containers.first().cloned().unwrap_or_default();
        let mut components: Vec<&str> = containers.iter().rev().map(String::as_str).collect();
        components.push(inum);
        let key = components.join(&SEPARATOR.to_string());

        Ok(ParsedKey {
            key,
            name,
            inum: inum.clone(),
        })
    }

    /// Inverts [`parse_dn`]: reconstructs the hierarchical identifier.
    pub fn to_dn(&self, parsed: &ParsedKey) -> Result<String> {
        if parsed.inum.is_empty() {
            return Err(PersistError::MalformedKey(
                "key has an empty unique id".to_string(),
            ));
        }

        let mut components: Vec<&str> = parsed.key.split(SEPARATOR).collect();
        match components.pop() {
            Some(last) if last == parsed.inum => {}
            _ => {
                return Err(PersistError::MalformedKey(format!(
                    "key '{}' does not end with unique id '{}'",
                    parsed.key, parsed.inum
                )));
            }
        }

        // components are outermost-first containers
        let immediate = components.last().copied().unwrap_or_default();
        if immediate != parsed.name {
            return Err(PersistError::MalformedKey(format!(
                "key '{}' names container '{}', expected '{}'",
                parsed.key, immediate, parsed.name
            )));
        }

        let mut dn = format!("{}={}", ID_ATTRIBUTE, parsed.inum);
        for container in components.iter().rev() {
            dn.push_str(&format!(",{}={}", CONTAINER_ATTRIBUTE, container));
        }
        dn.push(',');
        dn.push_str(&self.base_dn);
        Ok(dn)
    }

    /// Key prefix for a search base: the base itself maps to the root
    /// key, container paths map to their chain, entry identifiers map to
    /// their full key.
    pub fn container_key(&self, dn: &str) -> Result<String> {
        let scoped = self.strip_base(dn)?;
        if scoped.is_empty() {
            return Ok(ROOT_KEY.to_string());
        }

        let mut components = Vec::with_capacity(scoped.len());
        for (index, (attr, value)) in scoped.iter().enumerate() {
            let is_leaf_id = index == 0 && attr.eq_ignore_ascii_case(ID_ATTRIBUTE);
            if !is_leaf_id && !attr.eq_ignore_ascii_case(CONTAINER_ATTRIBUTE) {
                return Err(PersistError::MalformedKey(format!(
                    "'{}' is not a container path or entry identifier",
                    dn
                )));
            }
            check_value(dn, value)?;
            components.push(value.as_str());
        }
        components.reverse();
        Ok(components.join(&SEPARATOR.to_string()))
    }

    /// RDNs of `dn` above the configured base, leaf first.
    fn strip_base(&self, dn: &str) -> Result<Vec<(String, String)>> {
        let rdns = parse_rdns(dn)?;
        if rdns.len() < self.base_rdns.len() {
            return Err(PersistError::MalformedKey(format!(
                "'{}' is not under base '{}'",
                dn, self.base_dn
            )));
        }
        let split = rdns.len() - self.base_rdns.len();
        for (rdn, base_rdn) in rdns[split..].iter().zip(&self.base_rdns) {
            if !rdn.0.eq_ignore_ascii_case(&base_rdn.0) || !rdn.1.eq_ignore_ascii_case(&base_rdn.1)
            {
                return Err(PersistError::MalformedKey(format!(
                    "'{}' is not under base '{}'",
                    dn, self.base_dn
                )));
            }
        }
        Ok(rdns[..split].to_vec())
    }
}

/// Fresh internal unique identifier for a new entry.
pub fn generate_inum() -> String {
    uuid::Uuid::new_v4().to_string().to_uppercase()
}

fn parse_rdns(dn: &str) -> Result<Vec<(String, String)>> {
    if dn.trim().is_empty() {
        return Err(PersistError::MalformedKey("empty identifier".to_string()));
    }
    dn.split(',')
        .map(|rdn| {
            let rdn = rdn.trim();
            match rdn.split_once('=') {
                Some((attr, value)) if !attr.trim().is_empty() && !value.trim().is_empty() => {
                    Ok((attr.trim().to_string(), value.trim().to_string()))
                }
                _ => Err(PersistError::MalformedKey(format!(
                    "malformed RDN '{}' in '{}'",
                    rdn, dn
                ))),
            }
        })
        .collect()
}

fn check_value(dn: &str, value: &str) -> Result<()> {
    if value.contains(SEPARATOR) {
        return Err(PersistError::MalformedKey(format!(
            "RDN value '{}' in '{}' contains the key separator",
            value, dn
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn codec() -> KeyCodec {
        KeyCodec::new("o=identra").unwrap()
    }

    #[test]
    fn test_parse_entry_dn() {
        let parsed = codec()
            .parse_dn("inum=B1F3-DE2F,ou=people,o=identra")
            .unwrap();
        assert_eq!(parsed.key(), "people_B1F3-DE2F");
        assert_eq!(parsed.name(), "people");
        assert_eq!(parsed.inum(), "B1F3-DE2F");
    }

    #[test]
    fn test_parse_nested_containers() {
        let parsed = codec()
            .parse_dn("inum=0A44,ou=scopes,ou=clients,o=identra")
            .unwrap();
        assert_eq!(parsed.key(), "clients_scopes_0A44");
        assert_eq!(parsed.name(), "scopes");
    }

    #[rstest]
    #[case("inum=B1F3-DE2F,ou=people,o=identra")]
    #[case("inum=0A44,ou=scopes,ou=clients,o=identra")]
    #[case("inum=1800.9DEA,o=identra")]
    fn test_round_trip(#[case] dn: &str) {
        let codec = codec();
        let parsed = codec.parse_dn(dn).unwrap();
        assert_eq!(codec.to_dn(&parsed).unwrap(), dn);
    }

    #[test]
    fn test_missing_unique_id_rejected() {
        let err = codec().parse_dn("ou=people,o=identra").unwrap_err();
        assert!(matches!(err, PersistError::MalformedKey(_)));
    }

    #[test]
    fn test_foreign_base_rejected() {
        let err = codec().parse_dn("inum=1,ou=people,o=other").unwrap_err();
        assert!(matches!(err, PersistError::MalformedKey(_)));
    }

    #[test]
    fn test_separator_in_value_rejected() {
        let err = codec().parse_dn("inum=a_b,ou=people,o=identra").unwrap_err();
        assert!(matches!(err, PersistError::MalformedKey(_)));
    }

    #[test]
    fn test_container_key_scoping() {
        let codec = codec();
        assert_eq!(codec.container_key("o=identra").unwrap(), "_");
        assert_eq!(codec.container_key("ou=people,o=identra").unwrap(), "people");
        assert_eq!(
            codec.container_key("ou=scopes,ou=clients,o=identra").unwrap(),
            "clients_scopes"
        );
        assert_eq!(
            codec
                .container_key("inum=B1F3,ou=people,o=identra")
                .unwrap(),
            "people_B1F3"
        );
    }

    #[test]
    fn test_generated_inum_round_trips() {
        let codec = codec();
        let dn = format!("inum={},ou=people,o=identra", generate_inum());
        let parsed = codec.parse_dn(&dn).unwrap();
        assert_eq!(codec.to_dn(&parsed).unwrap(), dn);
    }

    #[test]
    fn test_tampered_key_rejected() {
        let codec = codec();
        let tampered = ParsedKey::new("people_XXXX", "people", "B1F3");
        assert!(matches!(
            codec.to_dn(&tampered).unwrap_err(),
            PersistError::MalformedKey(_)
        ));
        let wrong_name = ParsedKey::new("people_B1F3", "groups", "B1F3");
        assert!(matches!(
            codec.to_dn(&wrong_name).unwrap_err(),
            PersistError::MalformedKey(_)
        ));
    }
}
