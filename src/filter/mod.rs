//! Backend-independent search filter algebra
//!
//! Callers express search predicates as immutable [`Filter`] trees built
//! through the factory constructors here; each backend adapter translates
//! the tree into its native query form. Equality of filters is structural.

pub mod processor;

use serde::{Deserialize, Serialize};

use crate::error::{PersistError, Result};

/// Node variants of the filter tree, with the symbolic sign each carries
/// in the directory-protocol string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    Raw,
    Presence,
    Equality,
    LessOrEqual,
    GreaterOrEqual,
    ApproximateMatch,
    Substring,
    Not,
    Or,
    And,
    Lowercase,
}

impl FilterKind {
    /// Directory-protocol sign for this variant.
    pub fn sign(&self) -> &'static str {
        match self {
            FilterKind::Raw => "",
            FilterKind::Presence => "=",
            FilterKind::Equality => "=",
            FilterKind::LessOrEqual => "<=",
            FilterKind::GreaterOrEqual => ">=",
            FilterKind::ApproximateMatch => "~=",
            FilterKind::Substring => "=",
            FilterKind::Not => "!",
            FilterKind::Or => "|",
            FilterKind::And => "&",
            FilterKind::Lowercase => "",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            FilterKind::Not | FilterKind::Or | FilterKind::And | FilterKind::Lowercase
        )
    }
}

/// Assertion value carried by leaf filter nodes.
///
/// `Null` doubles as the wildcard in processor exclusion patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Null,
}

impl FilterValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FilterValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FilterValue::Null)
    }

    /// String form used when a backend compares against a folded or
    /// rendered value.
    pub fn render(&self) -> String {
        match self {
            FilterValue::Text(s) => s.clone(),
            FilterValue::Integer(i) => i.to_string(),
            FilterValue::Boolean(b) => b.to_string(),
            FilterValue::Null => String::new(),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Integer(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Boolean(value)
    }
}

impl std::fmt::Display for FilterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Immutable search predicate node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    kind: FilterKind,
    attribute: Option<String>,
    value: FilterValue,
    sub_initial: Option<String>,
    sub_any: Vec<String>,
    sub_final: Option<String>,
    raw: Option<String>,
    children: Vec<Filter>,
    multi_valued: Option<bool>,
}

impl Filter {
    fn leaf(kind: FilterKind, attribute: &str, value: FilterValue) -> Result<Filter> {
        if attribute.is_empty() {
            return Err(PersistError::InvalidFilter(format!(
                "{:?} filter requires a non-empty attribute name",
                kind
            )));
        }
        Ok(Filter {
            kind,
            attribute: Some(attribute.to_string()),
            value,
            sub_initial: None,
            sub_any: Vec::new(),
            sub_final: None,
            raw: None,
            children: Vec::new(),
            multi_valued: None,
        })
    }

    fn composite(kind: FilterKind, children: Vec<Filter>) -> Filter {
        Filter {
            kind,
            attribute: None,
            value: FilterValue::Null,
            sub_initial: None,
            sub_any: Vec::new(),
            sub_final: None,
            raw: None,
            children,
            multi_valued: None,
        }
    }

    pub fn equality(attribute: &str, value: impl Into<FilterValue>) -> Result<Filter> {
        Filter::leaf(FilterKind::Equality, attribute, value.into())
    }

    pub fn presence(attribute: &str) -> Result<Filter> {
        Filter::leaf(FilterKind::Presence, attribute, FilterValue::Null)
    }

    pub fn less_or_equal(attribute: &str, value: impl Into<FilterValue>) -> Result<Filter> {
        Filter::leaf(FilterKind::LessOrEqual, attribute, value.into())
    }

    pub fn greater_or_equal(attribute: &str, value: impl Into<FilterValue>) -> Result<Filter> {
        Filter::leaf(FilterKind::GreaterOrEqual, attribute, value.into())
    }

    pub fn approximate_match(attribute: &str, value: impl Into<FilterValue>) -> Result<Filter> {
        Filter::leaf(FilterKind::ApproximateMatch, attribute, value.into())
    }

    pub fn substring(
        attribute: &str,
        initial: Option<&str>,
        any: &[&str],
        fin: Option<&str>,
    ) -> Result<Filter> {
        let mut filter = Filter::leaf(FilterKind::Substring, attribute, FilterValue::Null)?;
        filter.sub_initial = initial.map(str::to_string);
        filter.sub_any = any.iter().map(|s| s.to_string()).collect();
        filter.sub_final = fin.map(str::to_string);
        if filter.sub_initial.is_none() && filter.sub_any.is_empty() && filter.sub_final.is_none() {
            return Err(PersistError::InvalidFilter(format!(
                "substring filter on '{}' requires at least one fragment",
                attribute
            )));
        }
        Ok(filter)
    }

    pub fn and(children: Vec<Filter>) -> Result<Filter> {
        if children.is_empty() {
            return Err(PersistError::InvalidFilter(
                "AND filter requires at least one child".to_string(),
            ));
        }
        Ok(Filter::composite(FilterKind::And, children))
    }

    pub fn or(children: Vec<Filter>) -> Result<Filter> {
        if children.is_empty() {
            return Err(PersistError::InvalidFilter(
                "OR filter requires at least one child".to_string(),
            ));
        }
        Ok(Filter::composite(FilterKind::Or, children))
    }

    pub fn not(child: Filter) -> Filter {
        Filter::composite(FilterKind::Not, vec![child])
    }

    /// Marks the wrapped equality comparison as case-insensitive. Each
    /// adapter realizes the fold natively (application-layer folding for
    /// the directory protocol, a case-fold function call for SQL-like
    /// engines).
    pub fn lowercase(child: Filter) -> Result<Filter> {
        if child.kind != FilterKind::Equality {
            return Err(PersistError::InvalidFilter(format!(
                "lowercase marker wraps an equality filter, got {:?}",
                child.kind
            )));
        }
        Ok(Filter::composite(FilterKind::Lowercase, vec![child]))
    }

    /// Pass-through native filter expression. Only the directory adapter
    /// accepts RAW nodes; translating ones are expected to reject them.
    pub fn raw(expression: &str) -> Filter {
        Filter {
            kind: FilterKind::Raw,
            attribute: None,
            value: FilterValue::Null,
            sub_initial: None,
            sub_any: Vec::new(),
            sub_final: None,
            raw: Some(expression.to_string()),
            children: Vec::new(),
            multi_valued: None,
        }
    }

    /// Directs flat backends to translate the comparison against a
    /// JSON-array (multi-valued) attribute.
    pub fn multi_valued(mut self, multi_valued: bool) -> Filter {
        self.multi_valued = Some(multi_valued);
        self
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn attribute(&self) -> Option<&str> {
        self.attribute.as_deref()
    }

    pub fn value(&self) -> &FilterValue {
        &self.value
    }

    pub fn sub_initial(&self) -> Option<&str> {
        self.sub_initial.as_deref()
    }

    pub fn sub_any(&self) -> &[String] {
        &self.sub_any
    }

    pub fn sub_final(&self) -> Option<&str> {
        self.sub_final.as_deref()
    }

    pub fn raw_expression(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn children(&self) -> &[Filter] {
        &self.children
    }

    pub fn is_multi_valued(&self) -> Option<bool> {
        self.multi_valued
    }

    /// Total number of nodes in this tree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Filter::node_count).sum::<usize>()
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FilterKind::Raw => write!(f, "{}", self.raw.as_deref().unwrap_or("")),
            FilterKind::Presence => write!(f, "({}=*)", self.attribute.as_deref().unwrap_or("")),
            FilterKind::Equality
            | FilterKind::LessOrEqual
            | FilterKind::GreaterOrEqual
            | FilterKind::ApproximateMatch => write!(
                f,
                "({}{}{})",
                self.attribute.as_deref().unwrap_or(""),
                self.kind.sign(),
                self.value
            ),
            FilterKind::Substring => {
                write!(f, "({}=", self.attribute.as_deref().unwrap_or(""))?;
                if let Some(initial) = &self.sub_initial {
                    write!(f, "{}", initial)?;
                }
                write!(f, "*")?;
                for any in &self.sub_any {
                    write!(f, "{}*", any)?;
                }
                if let Some(fin) = &self.sub_final {
                    write!(f, "{}", fin)?;
                }
                write!(f, ")")
            }
            FilterKind::Not => write!(f, "(!{})", self.children[0]),
            FilterKind::And | FilterKind::Or => {
                write!(f, "({}", self.kind.sign())?;
                for child in &self.children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            FilterKind::Lowercase => write!(f, "lower{}", self.children[0]),
        }
    }
}
