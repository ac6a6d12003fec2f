//! Compound explosion into atomic slice keys
//!
//! Turns one compound expression into the ordered list of canonical atomic
//! slice keys it denotes: structural explosion over alternatives and
//! distribution first, then cartesian expansion of bare context keys and
//! `contextAny` groups against the registry's enumerated values.
//!
//! Explosion is capped: exceeding the configured threshold attaches a
//! warning but never fails; the caller decides whether to proceed,
//! truncate, or abort.

use std::collections::HashSet;
use std::fmt;

use tracing::warn;

use crate::error::{ConfigurationError, Result};
use crate::registry::ContextRegistry;
use crate::types::SliceKey;

use super::ast;
use super::parser::{self, ParsedConstraintSet};

/// Default cap on the number of atomic slices one expression may produce
pub const DEFAULT_EXPLOSION_CAP: usize = 500;

/// Non-fatal explosion diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplodeWarning {
    /// The expression produced more atomic slices than the cap
    CapExceeded {
        /// How many slices were produced
        produced: usize,
        /// The configured cap
        cap: usize,
    },
}

impl fmt::Display for ExplodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExplodeWarning::CapExceeded { produced, cap } => write!(
                f,
                "expression explodes to {} atomic slices (cap {})",
                produced, cap
            ),
        }
    }
}

/// Result of exploding one compound expression
#[derive(Debug, Clone)]
pub struct Explosion {
    /// Canonical atomic slice keys, in derivation order, deduplicated
    pub keys: Vec<SliceKey>,
    /// Non-fatal diagnostics
    pub warnings: Vec<ExplodeWarning>,
}

/// Explode a compound expression into atomic slice keys
///
/// Alternatives (`;`, `or(...)`) and distributed groups expand
/// structurally; bare context keys and `contextAny` groups then expand via
/// cartesian product against the registry. Syntactically different but
/// semantically identical inputs yield the identical *set* of keys.
pub fn explode(expr: &str, registry: &ContextRegistry, cap: usize) -> Result<Explosion> {
    let tree = ast::parse_compound(expr)?;

    let mut keys: Vec<SliceKey> = Vec::new();
    let mut seen: HashSet<SliceKey> = HashSet::new();
    for term in tree.explode_terms() {
        let set = parser::parse(&term)?;
        for expanded in expand_selections(&set, registry)? {
            // Expansion leaves no bare keys or any-groups, so this is
            // always storable
            let key = expanded.slice_key()?;
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
    }

    let mut warnings = Vec::new();
    if keys.len() > cap {
        warn!(produced = keys.len(), cap, "explosion cap exceeded");
        warnings.push(ExplodeWarning::CapExceeded {
            produced: keys.len(),
            cap,
        });
    }

    Ok(Explosion { keys, warnings })
}

/// Expand bare context keys and contextAny groups against the registry
///
/// Multiple selection groups multiply combinatorially. Values expand in
/// the registry's declaration order for bare keys and in sorted order for
/// `contextAny` groups, so the output order is deterministic.
fn expand_selections(
    set: &ParsedConstraintSet,
    registry: &ContextRegistry,
) -> Result<Vec<ParsedConstraintSet>> {
    // (key, values) selection groups to expand
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for key in &set.bare_contexts {
        groups.push((key.clone(), registry.values_for(key)?));
    }
    for (key, values) in &set.any_groups {
        let definition = registry.context(key)?;
        for value in values {
            if !definition.is_legal_value(value) {
                return Err(ConfigurationError::UnknownValue {
                    context: key.clone(),
                    value: value.clone(),
                }
                .into());
            }
        }
        groups.push((key.clone(), values.iter().cloned().collect()));
    }

    let mut base = set.clone();
    base.bare_contexts.clear();
    base.any_groups.clear();

    let mut expanded = vec![base];
    for (key, values) in groups {
        let mut next = Vec::with_capacity(expanded.len() * values.len());
        for partial in &expanded {
            for value in &values {
                next.push(partial.with_context(&key, value));
            }
        }
        expanded = next;
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ContextDefinition, ContextRegistry, OtherPolicy};

    fn test_registry() -> ContextRegistry {
        ContextRegistry::from_definitions(vec![
            ContextDefinition::for_tests(
                "channel",
                &["google", "bing", "facebook", "newsletter", "direct"],
                OtherPolicy::NoneIncomplete,
            ),
            ContextDefinition::for_tests(
                "browser-type",
                &["chrome", "safari", "firefox"],
                OtherPolicy::NoneAssertedComplete,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_atomic_passthrough() {
        let registry = test_registry();
        let out = explode("context(channel:google)", &registry, 500).unwrap();
        assert_eq!(out.keys.len(), 1);
        assert_eq!(out.keys[0].as_str(), "context(channel:google)");
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_bare_key_cartesian() {
        let registry = test_registry();
        let out = explode("context(browser-type)", &registry, 500).unwrap();
        assert_eq!(out.keys.len(), 3);
        assert_eq!(out.keys[0].as_str(), "context(browser-type:chrome)");
    }

    #[test]
    fn test_two_bare_keys_multiply() {
        let registry = test_registry();
        let out = explode("context(channel).context(browser-type)", &registry, 500).unwrap();
        assert_eq!(out.keys.len(), 15);
    }

    #[test]
    fn test_spec_scenario_five_plus_three() {
        let registry = test_registry();
        let out = explode(
            "context(channel);context(browser-type).window(-90d:)",
            &registry,
            500,
        )
        .unwrap();
        assert_eq!(out.keys.len(), 8);
    }

    #[test]
    fn test_context_any_expansion() {
        let registry = test_registry();
        let out = explode("contextAny(channel:{google,bing})", &registry, 500).unwrap();
        assert_eq!(out.keys.len(), 2);
    }

    #[test]
    fn test_context_any_unknown_value() {
        let registry = test_registry();
        let err = explode("contextAny(channel:{google,yahoo})", &registry, 500);
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_bare_key() {
        let registry = test_registry();
        assert!(explode("context(device)", &registry, 500).is_err());
    }

    #[test]
    fn test_equivalence_of_forms() {
        let registry = test_registry();
        let forms = [
            "(context(channel:google);context(channel:bing)).visited(checkout)",
            "visited(checkout).(context(channel:google);context(channel:bing))",
            "or(context(channel:google),context(channel:bing)).visited(checkout)",
            "context(channel:google).visited(checkout);context(channel:bing).visited(checkout)",
            "contextAny(channel:{google,bing}).visited(checkout)",
        ];
        let mut key_sets: Vec<std::collections::BTreeSet<String>> = Vec::new();
        for form in forms {
            let out = explode(form, &registry, 500).unwrap();
            key_sets.push(out.keys.iter().map(|k| k.as_str().to_string()).collect());
        }
        for set in &key_sets[1..] {
            assert_eq!(set, &key_sets[0]);
        }
    }

    #[test]
    fn test_cap_is_warning_not_error() {
        let registry = test_registry();
        let out = explode("context(channel).context(browser-type)", &registry, 10).unwrap();
        assert_eq!(out.keys.len(), 15);
        assert!(matches!(
            out.warnings[0],
            ExplodeWarning::CapExceeded { produced: 15, cap: 10 }
        ));
    }

    #[test]
    fn test_deduplication() {
        let registry = test_registry();
        let out = explode(
            "context(channel:google);context(channel:google)",
            &registry,
            500,
        )
        .unwrap();
        assert_eq!(out.keys.len(), 1);
    }
}
