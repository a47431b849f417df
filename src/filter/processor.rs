//! Algebraic simplification passes over the filter tree
//!
//! Flat backends encode object-class discrimination structurally (in the
//! storage key) instead of as a predicate, so the object-class subtrees a
//! caller builds for directory compatibility are stripped before
//! translation. Both passes are pure and total: a no-op match returns the
//! input tree unchanged.

use super::{Filter, FilterKind, FilterValue};
use crate::error::Result;

pub const OBJECT_CLASS: &str = "objectClass";

pub struct FilterProcessor;

impl FilterProcessor {
    /// Prepends the schema-discrimination predicate callers rely on for
    /// directory compatibility. Only the first object class discriminates
    /// the entry type.
    pub fn add_object_class_filter(
        filter: Option<Filter>,
        object_classes: &[&str],
    ) -> Result<Filter> {
        let Some(first) = object_classes.first() else {
            return filter.ok_or_else(|| {
                crate::error::PersistError::InvalidFilter(
                    "neither a filter nor an object class was given".to_string(),
                )
            });
        };
        let discriminator = Filter::equality(OBJECT_CLASS, *first)?;
        match filter {
            Some(filter) => Filter::and(vec![discriminator, filter]),
            None => Ok(discriminator),
        }
    }

    /// Strips the object-class predicates again for backends that encode
    /// the entry type structurally (in the storage key) instead.
    pub fn exclude_object_class_filters(filter: &Filter) -> Option<Filter> {
        Self::exclude(filter, &Self::object_class_patterns()).map(|f| Self::simplify(&f))
    }

    /// Patterns matching the object-class predicates used only for schema
    /// discrimination: any-valued equality plus presence.
    pub fn object_class_patterns() -> Vec<Filter> {
        vec![
            Filter::equality(OBJECT_CLASS, FilterValue::Null).expect("const attribute"),
            Filter::presence(OBJECT_CLASS).expect("const attribute"),
        ]
    }

    /// Removes every subtree matching one of `patterns`, returning a new
    /// tree. `None` means the whole tree was excluded. Never increases
    /// the node count; applying the same exclusion twice is idempotent.
    pub fn exclude(filter: &Filter, patterns: &[Filter]) -> Option<Filter> {
        if patterns.iter().any(|p| Self::matches(filter, p)) {
            return None;
        }

        match filter.kind() {
            FilterKind::And | FilterKind::Or => {
                let children: Vec<Filter> = filter
                    .children()
                    .iter()
                    .filter_map(|child| Self::exclude(child, patterns))
                    .collect();
                if children.is_empty() {
                    None
                } else if filter.kind() == FilterKind::And {
                    Some(Filter::and(children).expect("non-empty children"))
                } else {
                    Some(Filter::or(children).expect("non-empty children"))
                }
            }
            FilterKind::Not => {
                let child = Self::exclude(&filter.children()[0], patterns)?;
                Some(Filter::not(child))
            }
            _ => Some(filter.clone()),
        }
    }

    /// Collapses degenerate composite nodes: an AND/OR left with a single
    /// child becomes that child.
    pub fn simplify(filter: &Filter) -> Filter {
        match filter.kind() {
            FilterKind::And | FilterKind::Or => {
                let children: Vec<Filter> = filter.children().iter().map(Self::simplify).collect();
                if children.len() == 1 {
                    children.into_iter().next().expect("one child")
                } else if filter.kind() == FilterKind::And {
                    Filter::and(children).expect("non-empty children")
                } else {
                    Filter::or(children).expect("non-empty children")
                }
            }
            FilterKind::Not => Filter::not(Self::simplify(&filter.children()[0])),
            _ => filter.clone(),
        }
    }

    /// A node matches a pattern when kind and attribute agree (attribute
    /// comparison is case-insensitive) and the pattern value is either a
    /// wildcard (`Null`) or equal. Case-fold markers are transparent: the
    /// wrapped equality is what gets compared.
    fn matches(filter: &Filter, pattern: &Filter) -> bool {
        let effective = if filter.kind() == FilterKind::Lowercase {
            &filter.children()[0]
        } else {
            filter
        };

        if effective.kind() != pattern.kind() {
            return false;
        }
        let (Some(attr), Some(pattern_attr)) = (effective.attribute(), pattern.attribute()) else {
            return false;
        };
        if !attr.eq_ignore_ascii_case(pattern_attr) {
            return false;
        }
        pattern.value().is_null() || effective.value() == pattern.value()
    }
}
