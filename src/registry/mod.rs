//! Context registry: legal values, other-bucket policies, filter mappings
//!
//! The registry is externally authored, read-only configuration. Per
//! context dimension it declares the legal values, an other-bucket policy,
//! and per-source filter mappings, and it supplies the metadata the MECE
//! (mutually exclusive, collectively exhaustive) checker needs: whether a
//! key's full value set partitions the space so that summing its slices
//! yields a true total.
//!
//! # Other-bucket policies
//!
//! | Policy                  | "other" exists?             | MECE condition                    |
//! |-------------------------|-----------------------------|-----------------------------------|
//! | none-asserted-complete  | no                          | all explicit values present       |
//! | computed-residual       | yes, filter derived         | explicit values + "other" present |
//! | explicit-residual       | yes, registry-declared      | explicit values + "other" present |
//! | none-incomplete         | no                          | never MECE                        |

pub mod loader;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::ConfigurationError;

pub use loader::load_from_dir;

/// The synthetic residual value name
pub const OTHER_VALUE: &str = "other";

/// How a context key treats values outside its explicit enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OtherPolicy {
    /// The explicit values are asserted to cover everything; no "other"
    NoneAssertedComplete,
    /// A synthetic "other" exists; its filter is derived at query time as
    /// NOT (all explicit filters ORed)
    ComputedResidual,
    /// A synthetic "other" exists with a registry-declared filter
    ExplicitResidual,
    /// The enumeration is known to be incomplete and has no residual;
    /// never safely summable to a total
    NoneIncomplete,
}

impl OtherPolicy {
    /// Whether the synthetic "other" value exists under this policy
    pub fn has_other(&self) -> bool {
        matches!(
            self,
            OtherPolicy::ComputedResidual | OtherPolicy::ExplicitResidual
        )
    }

    /// Whether any value coverage can ever make this key MECE
    pub fn mece_capable(&self) -> bool {
        !matches!(self, OtherPolicy::NoneIncomplete)
    }
}

/// One per-source filter mapping: exactly one of predicate or pattern
///
/// The tagged variant makes "both" or "neither" unrepresentable; the
/// loader rejects raw entries that violate this before a registry is ever
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMapping {
    /// Explicit field equality predicate
    Predicate {
        /// Provider field name
        field: String,
        /// Required field value
        value: String,
    },
    /// Regex pattern with flags
    Pattern {
        /// The pattern source
        pattern: String,
        /// Flag characters, e.g. "i"
        flags: String,
    },
}

impl FilterMapping {
    /// Validate a pattern mapping by compiling it
    pub fn validate(&self, context: &str, value: &str) -> Result<(), ConfigurationError> {
        if let FilterMapping::Pattern { pattern, flags } = self {
            let mut builder = RegexBuilder::new(pattern);
            for flag in flags.chars() {
                match flag {
                    'i' => {
                        builder.case_insensitive(true);
                    },
                    'm' => {
                        builder.multi_line(true);
                    },
                    's' => {
                        builder.dot_matches_new_line(true);
                    },
                    other => {
                        return Err(ConfigurationError::InvalidPattern {
                            context: context.to_string(),
                            value: value.to_string(),
                            reason: format!("unsupported flag '{}'", other),
                        });
                    },
                }
            }
            builder.build().map_err(|e| ConfigurationError::InvalidPattern {
                context: context.to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

impl fmt::Display for FilterMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMapping::Predicate { field, value } => write!(f, "{}=={}", field, value),
            FilterMapping::Pattern { pattern, flags } => {
                write!(f, "~/{}/{}", pattern, flags)
            },
        }
    }
}

/// A provider-agnostic filter expression
///
/// Adapters translate these into provider-native syntax; the engine only
/// composes them (residual derivation) and renders them into the query
/// spec used for signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    /// One concrete mapping
    Leaf(FilterMapping),
    /// Disjunction of sub-filters
    AnyOf(Vec<FilterExpr>),
    /// Negation
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Canonical textual rendering, stable for signature hashing
    pub fn describe(&self) -> String {
        match self {
            FilterExpr::Leaf(mapping) => mapping.to_string(),
            FilterExpr::AnyOf(parts) => {
                let inner: Vec<String> = parts.iter().map(FilterExpr::describe).collect();
                format!("any({})", inner.join("|"))
            },
            FilterExpr::Not(inner) => format!("not({})", inner.describe()),
        }
    }
}

/// One enumerated value and its per-source mappings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextValueDef {
    /// The value as it appears in slice keys
    pub value: String,
    /// Filter mapping per source identifier
    pub sources: HashMap<String, FilterMapping>,
}

impl ContextValueDef {
    /// A value with no source mappings
    pub fn bare(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            sources: HashMap::new(),
        }
    }

    /// Attach one source mapping
    pub fn with_source(mut self, source: impl Into<String>, mapping: FilterMapping) -> Self {
        self.sources.insert(source.into(), mapping);
        self
    }
}

/// Registry entry for one context dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDefinition {
    /// Context key, e.g. "channel"
    pub id: String,
    /// Explicit values in declaration order
    pub values: Vec<ContextValueDef>,
    /// Other-bucket policy
    pub other_policy: OtherPolicy,
    /// Per-source mappings for the explicit residual, when the policy is
    /// [`OtherPolicy::ExplicitResidual`]
    pub other_sources: HashMap<String, FilterMapping>,
}

impl ContextDefinition {
    /// A definition with enumerated values and no source mappings
    ///
    /// Convenient for tests and demos that never resolve filters.
    pub fn enumerated(id: &str, values: &[&str], other_policy: OtherPolicy) -> Self {
        Self {
            id: id.to_string(),
            values: values.iter().map(|v| ContextValueDef::bare(*v)).collect(),
            other_policy,
            other_sources: HashMap::new(),
        }
    }

    /// Alias used widely in tests
    pub fn for_tests(id: &str, values: &[&str], other_policy: OtherPolicy) -> Self {
        Self::enumerated(id, values, other_policy)
    }

    /// Explicit values in declaration order
    pub fn explicit_values(&self) -> Vec<String> {
        self.values.iter().map(|v| v.value.clone()).collect()
    }

    /// All legal values, including the synthetic "other" when the policy
    /// declares one
    pub fn all_values(&self) -> Vec<String> {
        let mut values = self.explicit_values();
        if self.other_policy.has_other() {
            values.push(OTHER_VALUE.to_string());
        }
        values
    }

    /// Whether a value is legal for this key
    pub fn is_legal_value(&self, value: &str) -> bool {
        if value == OTHER_VALUE {
            return self.other_policy.has_other();
        }
        self.values.iter().any(|v| v.value == value)
    }

    /// The value set whose complete presence makes a sum a true total, or
    /// `None` when this key can never be MECE
    pub fn mece_values(&self) -> Option<Vec<String>> {
        match self.other_policy {
            OtherPolicy::NoneAssertedComplete => Some(self.explicit_values()),
            OtherPolicy::ComputedResidual | OtherPolicy::ExplicitResidual => {
                Some(self.all_values())
            },
            OtherPolicy::NoneIncomplete => None,
        }
    }
}

/// The full registry: externally authored, read-only
///
/// Declaration order is meaningful: it is the documented tie-break when
/// several context keys could each provide a complete MECE total.
#[derive(Debug, Clone, Default)]
pub struct ContextRegistry {
    contexts: Vec<ContextDefinition>,
    by_key: HashMap<String, usize>,
}

impl ContextRegistry {
    /// Build a registry from definitions, validating as a whole
    pub fn from_definitions(
        definitions: Vec<ContextDefinition>,
    ) -> Result<Self, ConfigurationError> {
        let mut by_key = HashMap::with_capacity(definitions.len());
        for (index, definition) in definitions.iter().enumerate() {
            if by_key.insert(definition.id.clone(), index).is_some() {
                return Err(ConfigurationError::DuplicateValue {
                    context: definition.id.clone(),
                    value: definition.id.clone(),
                });
            }
            let mut seen = std::collections::HashSet::new();
            for value_def in &definition.values {
                if value_def.value == OTHER_VALUE {
                    return Err(ConfigurationError::InvalidMapping {
                        context: definition.id.clone(),
                        value: value_def.value.clone(),
                        reason: "'other' is reserved for the residual bucket".to_string(),
                    });
                }
                if !seen.insert(value_def.value.clone()) {
                    return Err(ConfigurationError::DuplicateValue {
                        context: definition.id.clone(),
                        value: value_def.value.clone(),
                    });
                }
                for mapping in value_def.sources.values() {
                    mapping.validate(&definition.id, &value_def.value)?;
                }
            }
            for mapping in definition.other_sources.values() {
                mapping.validate(&definition.id, OTHER_VALUE)?;
            }
        }
        Ok(Self {
            contexts: definitions,
            by_key,
        })
    }

    /// Context keys in declaration order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.contexts.iter().map(|c| c.id.as_str())
    }

    /// Look up one context definition
    pub fn context(&self, key: &str) -> Result<&ContextDefinition, ConfigurationError> {
        self.by_key
            .get(key)
            .map(|&i| &self.contexts[i])
            .ok_or_else(|| ConfigurationError::UnknownContext(key.to_string()))
    }

    /// All legal values for a key, including the synthetic "other" only
    /// for residual policies
    pub fn values_for(&self, key: &str) -> Result<Vec<String>, ConfigurationError> {
        Ok(self.context(key)?.all_values())
    }

    /// The filter for one (key, value) pair on one source
    ///
    /// Returns exactly one of an explicit predicate or a pattern; for the
    /// synthetic "other" it returns the declared residual filter or the
    /// derived NOT-of-all-explicit filter depending on the policy.
    pub fn source_mapping(
        &self,
        key: &str,
        value: &str,
        source: &str,
    ) -> Result<FilterExpr, ConfigurationError> {
        let definition = self.context(key)?;
        if value == OTHER_VALUE {
            return match definition.other_policy {
                OtherPolicy::ComputedResidual => self.computed_other_filter(key, source),
                OtherPolicy::ExplicitResidual => definition
                    .other_sources
                    .get(source)
                    .cloned()
                    .map(FilterExpr::Leaf)
                    .ok_or_else(|| ConfigurationError::MissingMapping {
                        context: key.to_string(),
                        value: OTHER_VALUE.to_string(),
                        source_id: source.to_string(),
                    }),
                _ => Err(ConfigurationError::UnknownValue {
                    context: key.to_string(),
                    value: value.to_string(),
                }),
            };
        }
        let value_def = definition
            .values
            .iter()
            .find(|v| v.value == value)
            .ok_or_else(|| ConfigurationError::UnknownValue {
                context: key.to_string(),
                value: value.to_string(),
            })?;
        value_def
            .sources
            .get(source)
            .cloned()
            .map(FilterExpr::Leaf)
            .ok_or_else(|| ConfigurationError::MissingMapping {
                context: key.to_string(),
                value: value.to_string(),
                source_id: source.to_string(),
            })
    }

    /// Derive the computed-residual filter: NOT (all explicit filters ORed)
    pub fn computed_other_filter(
        &self,
        key: &str,
        source: &str,
    ) -> Result<FilterExpr, ConfigurationError> {
        let definition = self.context(key)?;
        let mut parts = Vec::with_capacity(definition.values.len());
        for value_def in &definition.values {
            let mapping = value_def.sources.get(source).cloned().ok_or_else(|| {
                ConfigurationError::MissingMapping {
                    context: key.to_string(),
                    value: value_def.value.clone(),
                    source_id: source.to_string(),
                }
            })?;
            parts.push(FilterExpr::Leaf(mapping));
        }
        Ok(FilterExpr::Not(Box::new(FilterExpr::AnyOf(parts))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_definition() -> ContextDefinition {
        ContextDefinition {
            id: "channel".to_string(),
            values: vec![
                ContextValueDef::bare("google").with_source(
                    "ga4",
                    FilterMapping::Predicate {
                        field: "sessionSource".to_string(),
                        value: "google".to_string(),
                    },
                ),
                ContextValueDef::bare("bing").with_source(
                    "ga4",
                    FilterMapping::Pattern {
                        pattern: "^bing".to_string(),
                        flags: "i".to_string(),
                    },
                ),
            ],
            other_policy: OtherPolicy::ComputedResidual,
            other_sources: HashMap::new(),
        }
    }

    #[test]
    fn test_values_include_other_for_residual_policies() {
        let registry = ContextRegistry::from_definitions(vec![mapped_definition()]).unwrap();
        let values = registry.values_for("channel").unwrap();
        assert_eq!(values, vec!["google", "bing", "other"]);
    }

    #[test]
    fn test_values_exclude_other_for_none_policies() {
        let registry = ContextRegistry::from_definitions(vec![
            ContextDefinition::enumerated("b", &["x", "y"], OtherPolicy::NoneAssertedComplete),
        ])
        .unwrap();
        assert_eq!(registry.values_for("b").unwrap(), vec!["x", "y"]);
    }

    #[test]
    fn test_unknown_key() {
        let registry = ContextRegistry::default();
        assert!(matches!(
            registry.values_for("nope"),
            Err(ConfigurationError::UnknownContext(_))
        ));
    }

    #[test]
    fn test_source_mapping_dispatch() {
        let registry = ContextRegistry::from_definitions(vec![mapped_definition()]).unwrap();
        let google = registry.source_mapping("channel", "google", "ga4").unwrap();
        assert!(matches!(
            google,
            FilterExpr::Leaf(FilterMapping::Predicate { .. })
        ));
        let bing = registry.source_mapping("channel", "bing", "ga4").unwrap();
        assert!(matches!(bing, FilterExpr::Leaf(FilterMapping::Pattern { .. })));
    }

    #[test]
    fn test_computed_other_filter() {
        let registry = ContextRegistry::from_definitions(vec![mapped_definition()]).unwrap();
        let other = registry.source_mapping("channel", "other", "ga4").unwrap();
        let rendered = other.describe();
        assert!(rendered.starts_with("not(any("));
        assert!(rendered.contains("sessionSource==google"));
        assert!(rendered.contains("~/^bing/i"));
    }

    fn explicit_residual_definition() -> ContextDefinition {
        ContextDefinition {
            id: "channel".to_string(),
            values: vec![ContextValueDef::bare("google").with_source(
                "ga4",
                FilterMapping::Predicate {
                    field: "sessionSource".to_string(),
                    value: "google".to_string(),
                },
            )],
            other_policy: OtherPolicy::ExplicitResidual,
            other_sources: HashMap::from([(
                "ga4".to_string(),
                FilterMapping::Predicate {
                    field: "sessionSource".to_string(),
                    value: "(other)".to_string(),
                },
            )]),
        }
    }

    #[test]
    fn test_explicit_residual_other_filter() {
        let registry =
            ContextRegistry::from_definitions(vec![explicit_residual_definition()]).unwrap();
        let other = registry.source_mapping("channel", "other", "ga4").unwrap();
        assert_eq!(
            other,
            FilterExpr::Leaf(FilterMapping::Predicate {
                field: "sessionSource".to_string(),
                value: "(other)".to_string(),
            })
        );
    }

    #[test]
    fn test_explicit_residual_missing_source_declaration() {
        let registry =
            ContextRegistry::from_definitions(vec![explicit_residual_definition()]).unwrap();
        let err = registry.source_mapping("channel", "other", "plausible");
        assert!(matches!(
            err,
            Err(ConfigurationError::MissingMapping { source_id, .. }) if source_id == "plausible"
        ));
    }

    #[test]
    fn test_mece_values_per_policy() {
        let complete =
            ContextDefinition::enumerated("a", &["x", "y"], OtherPolicy::NoneAssertedComplete);
        assert_eq!(complete.mece_values().unwrap(), vec!["x", "y"]);

        let residual = ContextDefinition::enumerated("b", &["x"], OtherPolicy::ComputedResidual);
        assert_eq!(residual.mece_values().unwrap(), vec!["x", "other"]);

        let incomplete = ContextDefinition::enumerated("c", &["x"], OtherPolicy::NoneIncomplete);
        assert!(incomplete.mece_values().is_none());
    }

    #[test]
    fn test_duplicate_value_rejected() {
        let err = ContextRegistry::from_definitions(vec![ContextDefinition::enumerated(
            "a",
            &["x", "x"],
            OtherPolicy::NoneIncomplete,
        )]);
        assert!(matches!(err, Err(ConfigurationError::DuplicateValue { .. })));
    }

    #[test]
    fn test_reserved_other_rejected() {
        let err = ContextRegistry::from_definitions(vec![ContextDefinition::enumerated(
            "a",
            &["other"],
            OtherPolicy::ComputedResidual,
        )]);
        assert!(matches!(err, Err(ConfigurationError::InvalidMapping { .. })));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_load() {
        let definition = ContextDefinition {
            id: "a".to_string(),
            values: vec![ContextValueDef::bare("x").with_source(
                "ga4",
                FilterMapping::Pattern {
                    pattern: "([unclosed".to_string(),
                    flags: String::new(),
                },
            )],
            other_policy: OtherPolicy::NoneIncomplete,
            other_sources: HashMap::new(),
        };
        assert!(matches!(
            ContextRegistry::from_definitions(vec![definition]),
            Err(ConfigurationError::InvalidPattern { .. })
        ));
    }
}
