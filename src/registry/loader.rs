//! Declarative registry loading
//!
//! The registry loads from one index document plus one definition document
//! per context key, all JSON:
//!
//! ```text
//! registry/
//!   contexts.json        { "contexts": ["channel", "browser-type"] }
//!   channel.json         one ContextDefinition (see RawDefinition)
//!   browser-type.json
//! ```
//!
//! Validation happens here, at load time: a filter entry with both or
//! neither of predicate and pattern populated is rejected immediately
//! rather than deferred to query time.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{ConfigurationError, Error, Result};

use super::{ContextDefinition, ContextRegistry, ContextValueDef, FilterMapping, OtherPolicy};

/// The index document naming every context key
#[derive(Debug, Deserialize)]
struct RegistryIndex {
    contexts: Vec<String>,
}

/// Raw filter entry before exactly-one validation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawFilter {
    field: Option<String>,
    value: Option<String>,
    pattern: Option<String>,
    #[serde(default)]
    flags: Option<String>,
}

impl RawFilter {
    fn into_mapping(self, context: &str, value: &str) -> Result<FilterMapping> {
        let predicate = match (self.field, self.value) {
            (Some(field), Some(v)) => Some(FilterMapping::Predicate { field, value: v }),
            (None, None) => None,
            _ => {
                return Err(ConfigurationError::InvalidMapping {
                    context: context.to_string(),
                    value: value.to_string(),
                    reason: "predicate requires both field and value".to_string(),
                }
                .into())
            },
        };
        let pattern = self.pattern.map(|pattern| FilterMapping::Pattern {
            pattern,
            flags: self.flags.unwrap_or_default(),
        });
        match (predicate, pattern) {
            (Some(mapping), None) | (None, Some(mapping)) => Ok(mapping),
            (Some(_), Some(_)) => Err(ConfigurationError::InvalidMapping {
                context: context.to_string(),
                value: value.to_string(),
                reason: "both predicate and pattern populated".to_string(),
            }
            .into()),
            (None, None) => Err(ConfigurationError::InvalidMapping {
                context: context.to_string(),
                value: value.to_string(),
                reason: "neither predicate nor pattern populated".to_string(),
            }
            .into()),
        }
    }
}

/// Raw per-key definition document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDefinition {
    id: String,
    other_policy: OtherPolicy,
    values: Vec<RawValue>,
    #[serde(default)]
    other: HashMap<String, RawFilter>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    value: String,
    #[serde(default)]
    sources: HashMap<String, RawFilter>,
}

impl RawDefinition {
    fn into_definition(self) -> Result<ContextDefinition> {
        let id = self.id;
        let mut values = Vec::with_capacity(self.values.len());
        for raw_value in self.values {
            let mut sources = HashMap::with_capacity(raw_value.sources.len());
            for (source, raw_filter) in raw_value.sources {
                sources.insert(source, raw_filter.into_mapping(&id, &raw_value.value)?);
            }
            values.push(ContextValueDef {
                value: raw_value.value,
                sources,
            });
        }
        let mut other_sources = HashMap::with_capacity(self.other.len());
        for (source, raw_filter) in self.other {
            other_sources.insert(source, raw_filter.into_mapping(&id, super::OTHER_VALUE)?);
        }
        Ok(ContextDefinition {
            id,
            values,
            other_policy: self.other_policy,
            other_sources,
        })
    }
}

/// Parse one definition document from JSON text
pub fn definition_from_json(text: &str) -> Result<ContextDefinition> {
    let raw: RawDefinition =
        serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))?;
    raw.into_definition()
}

/// Load a registry from a directory: `contexts.json` plus `<key>.json`
/// per declared context
pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<ContextRegistry> {
    let dir = dir.as_ref();
    let index_text = std::fs::read_to_string(dir.join("contexts.json"))?;
    let index: RegistryIndex =
        serde_json::from_str(&index_text).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut definitions = Vec::with_capacity(index.contexts.len());
    for key in &index.contexts {
        let path = dir.join(format!("{}.json", key));
        let text = std::fs::read_to_string(&path)
            .map_err(|_| ConfigurationError::MissingDefinition(key.clone()))?;
        let definition = definition_from_json(&text)?;
        if &definition.id != key {
            return Err(ConfigurationError::MissingDefinition(format!(
                "{} (document declares id '{}')",
                key, definition.id
            ))
            .into());
        }
        definitions.push(definition);
    }
    debug!(contexts = definitions.len(), "loaded context registry");
    Ok(ContextRegistry::from_definitions(definitions)?)
}
