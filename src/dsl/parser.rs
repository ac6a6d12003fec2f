//! Atomic constraint-expression parser
//!
//! Parses one atomic expression (no OR-semantics) into a structured
//! [`ParsedConstraintSet`] and re-serializes it deterministically.
//!
//! # Supported Syntax
//!
//! ```text
//! visited(checkout,thankyou)          nodes that must be visited
//! exclude(refund)                     nodes that must not be visited
//! case(pricing-test:b)                experiment variant split
//! context(channel:google)             pinned context value
//! context(channel)                    bare key, expands via the registry
//! contextAny(channel:{google,bing})   any of the listed values
//! window(2026-01-01:2026-03-31)       absolute date window
//! window(-90d:)                       relative start, open end
//! ```
//!
//! Terms join with `.` and are order-irrelevant: canonicalization sorts
//! constraints into a fixed order (visited, exclude, case, context,
//! contextAny, window) and sorts every list, so `normalize` is idempotent
//! and order-insensitive.

use chrono::{Days, NaiveDate};
use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char, multispace0},
    multi::separated_list1,
    sequence::delimited,
    IResult, Parser,
};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{StoreError, SyntaxError};
use crate::types::{DateRange, SliceKey};

// ============================================================================
// Date Windows
// ============================================================================

/// One endpoint of a date window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DateBound {
    /// No bound; falls back to the requested window's endpoint
    Open,
    /// A concrete calendar date
    Absolute(NaiveDate),
    /// An offset in days from the query's anchor date ("today")
    Relative(i64),
}

impl DateBound {
    fn parse(s: &str) -> Result<Self, SyntaxError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(DateBound::Open);
        }
        if let Some(num) = s.strip_suffix('d') {
            if let Ok(offset) = num.parse::<i64>() {
                return Ok(DateBound::Relative(offset));
            }
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(DateBound::Absolute)
            .map_err(|_| SyntaxError::InvalidDate(s.to_string()))
    }

    fn resolve(&self, today: NaiveDate, fallback: NaiveDate) -> NaiveDate {
        match self {
            DateBound::Open => fallback,
            DateBound::Absolute(d) => *d,
            DateBound::Relative(offset) => {
                if *offset >= 0 {
                    today
                        .checked_add_days(Days::new(*offset as u64))
                        .unwrap_or(today)
                } else {
                    today
                        .checked_sub_days(Days::new(offset.unsigned_abs()))
                        .unwrap_or(today)
                }
            },
        }
    }
}

impl fmt::Display for DateBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateBound::Open => Ok(()),
            DateBound::Absolute(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            DateBound::Relative(offset) => write!(f, "{}d", offset),
        }
    }
}

/// A date window constraint, possibly relative or half-open
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateWindow {
    /// Start bound (inclusive once resolved)
    pub start: DateBound,
    /// End bound (inclusive once resolved)
    pub end: DateBound,
}

impl DateWindow {
    /// Resolve to a concrete range against an anchor date. An open start
    /// falls back to the given range's start. An open end falls back to the
    /// later of the given range's end and the anchor date, so a relative
    /// start that lands past the fallback range still yields a valid range.
    pub fn resolve(&self, today: NaiveDate, fallback: &DateRange) -> Result<DateRange, StoreError> {
        let start = self.start.resolve(today, fallback.start);
        let end = self.end.resolve(today, fallback.end.max(today));
        DateRange::new(start, end)
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

// ============================================================================
// Parsed Constraint Sets
// ============================================================================

/// Order-irrelevant decomposition of one atomic expression
///
/// A *canonical* (storable) set contains no bare context keys and no
/// `contextAny` groups: those must be expanded against the registry before
/// the set can serve as a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedConstraintSet {
    /// Nodes that must be visited
    pub visited: BTreeSet<String>,
    /// Nodes that must not be visited
    pub exclude: BTreeSet<String>,
    /// (experiment id, variant) splits
    pub cases: BTreeSet<(String, String)>,
    /// Pinned (context key, value) pairs
    pub contexts: BTreeSet<(String, String)>,
    /// Bare context keys awaiting cartesian expansion
    pub bare_contexts: BTreeSet<String>,
    /// contextAny groups awaiting expansion: (key, values)
    pub any_groups: BTreeSet<(String, BTreeSet<String>)>,
    /// Optional date window
    pub window: Option<DateWindow>,
}

impl ParsedConstraintSet {
    /// True when the set is free of unexpanded selections and can serve as
    /// a storage key
    pub fn is_storable(&self) -> bool {
        self.bare_contexts.is_empty() && self.any_groups.is_empty()
    }

    /// True when at least one context constraint (of any form) is present
    pub fn has_contexts(&self) -> bool {
        !self.contexts.is_empty() || !self.bare_contexts.is_empty() || !self.any_groups.is_empty()
    }

    /// Deterministic canonical serialization
    ///
    /// Constraint order: visited, exclude, case, context, contextAny,
    /// window. Every list is sorted; dates render in one canonical format.
    pub fn canonical_string(&self) -> String {
        let mut terms: Vec<String> = Vec::new();
        if !self.visited.is_empty() {
            terms.push(format!(
                "visited({})",
                self.visited.iter().cloned().collect::<Vec<_>>().join(",")
            ));
        }
        if !self.exclude.is_empty() {
            terms.push(format!(
                "exclude({})",
                self.exclude.iter().cloned().collect::<Vec<_>>().join(",")
            ));
        }
        for (id, variant) in &self.cases {
            terms.push(format!("case({}:{})", id, variant));
        }
        // Bare keys sort ahead of valued pairs for the same key
        let mut context_terms: Vec<String> = self
            .bare_contexts
            .iter()
            .map(|k| format!("context({})", k))
            .collect();
        context_terms.extend(self.contexts.iter().map(|(k, v)| format!("context({}:{})", k, v)));
        context_terms.sort();
        terms.extend(context_terms);
        for (key, values) in &self.any_groups {
            terms.push(format!(
                "contextAny({}:{{{}}})",
                key,
                values.iter().cloned().collect::<Vec<_>>().join(",")
            ));
        }
        if let Some(window) = &self.window {
            terms.push(format!("window({})", window));
        }
        terms.join(".")
    }

    /// The canonical storage key of this set
    ///
    /// Fails when unexpanded selections remain; expand against the registry
    /// first (see `dsl::explode`).
    pub fn slice_key(&self) -> Result<SliceKey, SyntaxError> {
        if !self.is_storable() {
            return Err(SyntaxError::UnexpandedSelection(self.canonical_string()));
        }
        Ok(SliceKey::from_canonical(self.canonical_string()))
    }

    /// Clone of this set with one more pinned context pair
    pub fn with_context(&self, key: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.contexts.insert((key.to_string(), value.to_string()));
        next
    }

    /// Split into a window-free set and the window constraint, if any
    ///
    /// Storage keys are window-free: the date dimension of a stored slice
    /// is carried by its data, not by its identity.
    pub fn split_window(&self) -> (Self, Option<DateWindow>) {
        let mut base = self.clone();
        let window = base.window.take();
        (base, window)
    }

    fn add(&mut self, constraint: Constraint) -> Result<(), SyntaxError> {
        match constraint {
            Constraint::Visited(nodes) => self.visited.extend(nodes),
            Constraint::Exclude(nodes) => self.exclude.extend(nodes),
            Constraint::Case { id, variant } => {
                self.cases.insert((id, variant));
            },
            Constraint::Context { key, value: Some(v) } => {
                self.contexts.insert((key, v));
            },
            Constraint::Context { key, value: None } => {
                self.bare_contexts.insert(key);
            },
            Constraint::ContextAny { key, values } => {
                self.any_groups.insert((key, values));
            },
            Constraint::Window(window) => {
                if self.window.is_some() {
                    return Err(SyntaxError::MalformedArgument {
                        function: "window".to_string(),
                        detail: "duplicate window constraint".to_string(),
                    });
                }
                self.window = Some(window);
            },
        }
        Ok(())
    }
}

/// One tagged constraint predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// Nodes that must be visited
    Visited(Vec<String>),
    /// Nodes that must not be visited
    Exclude(Vec<String>),
    /// Experiment variant split
    Case {
        /// Experiment identifier
        id: String,
        /// Variant identifier
        variant: String,
    },
    /// Context constraint; `value: None` is a bare key
    Context {
        /// Context key
        key: String,
        /// Pinned value, or `None` for a bare key
        value: Option<String>,
    },
    /// Any of the listed values for one key
    ContextAny {
        /// Context key
        key: String,
        /// Allowed values
        values: BTreeSet<String>,
    },
    /// Date window
    Window(DateWindow),
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse one atomic expression into a constraint set
///
/// Fails with a [`SyntaxError`] on unbalanced parentheses, unknown function
/// names, or malformed key:value pairs. Compound input (alternatives,
/// groups) is rejected with [`SyntaxError::NotAtomic`].
pub fn parse(expr: &str) -> Result<ParsedConstraintSet, SyntaxError> {
    let s = expr.trim();
    if s.is_empty() {
        return Err(SyntaxError::Empty);
    }
    super::ast::check_balance(s)?;
    if has_top_level(s, ';') {
        return Err(SyntaxError::NotAtomic(s.to_string()));
    }

    let (rest, raw_terms) = raw_terms(s).map_err(|_| SyntaxError::InvalidTerm(s.to_string()))?;
    if !rest.trim().is_empty() {
        return Err(SyntaxError::TrailingInput(rest.trim().to_string()));
    }

    let mut set = ParsedConstraintSet::default();
    for (name, body) in raw_terms {
        set.add(interpret_term(name, body)?)?;
    }
    Ok(set)
}

/// Parse and deterministically re-serialize an atomic expression
///
/// Idempotent: `normalize(normalize(e)) == normalize(e)`.
pub fn normalize(expr: &str) -> Result<String, SyntaxError> {
    Ok(parse(expr)?.canonical_string())
}

fn has_top_level(s: &str, sep: char) -> bool {
    let mut depth: i64 = 0;
    for c in s.chars() {
        match c {
            '(' | '{' => depth += 1,
            ')' | '}' => depth -= 1,
            c if c == sep && depth == 0 => return true,
            _ => {},
        }
    }
    false
}

/// Parse a dot-joined list of `name(body)` terms
fn raw_terms(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    separated_list1(char('.'), raw_term).parse(input)
}

fn raw_term(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, _) = multispace0(input)?;
    let (input, name) =
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_')(input)?;
    let (input, body) = delimited(
        char('('),
        take_while(|c| c != '(' && c != ')'),
        char(')'),
    )
    .parse(input)?;
    let (input, _) = multispace0(input)?;
    Ok((input, (name, body)))
}

fn interpret_term(name: &str, body: &str) -> Result<Constraint, SyntaxError> {
    match name {
        "visited" => Ok(Constraint::Visited(node_list(name, body)?)),
        "exclude" => Ok(Constraint::Exclude(node_list(name, body)?)),
        "case" => {
            let (id, variant) = key_value_pair(name, body)?;
            Ok(Constraint::Case { id, variant })
        },
        "context" => interpret_context(body),
        "contextAny" => interpret_context_any(body),
        "window" => interpret_window(body),
        other => Err(SyntaxError::UnknownFunction(other.to_string())),
    }
}

fn node_list(function: &str, body: &str) -> Result<Vec<String>, SyntaxError> {
    let nodes: Vec<String> = body
        .split(',')
        .map(|n| n.trim().to_string())
        .collect();
    if nodes.iter().any(String::is_empty) {
        return Err(SyntaxError::MalformedArgument {
            function: function.to_string(),
            detail: format!("empty node name in '{}'", body),
        });
    }
    Ok(nodes)
}

fn key_value_pair(function: &str, body: &str) -> Result<(String, String), SyntaxError> {
    let mut parts = body.splitn(2, ':');
    let key = parts.next().unwrap_or("").trim();
    let value = parts.next().map(str::trim);
    match value {
        Some(v) if !key.is_empty() && !v.is_empty() && !v.contains(':') => {
            Ok((key.to_string(), v.to_string()))
        },
        _ => Err(SyntaxError::MalformedArgument {
            function: function.to_string(),
            detail: format!("expected key:value, got '{}'", body),
        }),
    }
}

fn interpret_context(body: &str) -> Result<Constraint, SyntaxError> {
    if body.contains(':') {
        let (key, value) = key_value_pair("context", body)?;
        Ok(Constraint::Context {
            key,
            value: Some(value),
        })
    } else {
        let key = body.trim();
        if key.is_empty() || key.contains(',') {
            return Err(SyntaxError::MalformedArgument {
                function: "context".to_string(),
                detail: format!("expected a key or key:value, got '{}'", body),
            });
        }
        Ok(Constraint::Context {
            key: key.to_string(),
            value: None,
        })
    }
}

fn interpret_context_any(body: &str) -> Result<Constraint, SyntaxError> {
    let malformed = |detail: String| SyntaxError::MalformedArgument {
        function: "contextAny".to_string(),
        detail,
    };
    let mut parts = body.splitn(2, ':');
    let key = parts.next().unwrap_or("").trim();
    let group = parts
        .next()
        .ok_or_else(|| malformed(format!("expected key:{{values}}, got '{}'", body)))?
        .trim();
    let inner = group
        .strip_prefix('{')
        .and_then(|g| g.strip_suffix('}'))
        .ok_or_else(|| malformed(format!("expected braced value set, got '{}'", group)))?;
    let values: BTreeSet<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .collect();
    if key.is_empty() || values.is_empty() || values.iter().any(String::is_empty) {
        return Err(malformed(format!("empty key or value in '{}'", body)));
    }
    Ok(Constraint::ContextAny {
        key: key.to_string(),
        values,
    })
}

fn interpret_window(body: &str) -> Result<Constraint, SyntaxError> {
    let parts: Vec<&str> = body.split(':').collect();
    if parts.len() != 2 {
        return Err(SyntaxError::MalformedArgument {
            function: "window".to_string(),
            detail: format!("expected start:end, got '{}'", body),
        });
    }
    Ok(Constraint::Window(DateWindow {
        start: DateBound::parse(parts[0])?,
        end: DateBound::parse(parts[1])?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_visited() {
        let set = parse("visited(checkout,landing)").unwrap();
        assert!(set.visited.contains("checkout"));
        assert!(set.visited.contains("landing"));
    }

    #[test]
    fn test_normalize_orders_terms() {
        let a = normalize("window(-90d:).context(channel:google).visited(checkout)").unwrap();
        let b = normalize("visited(checkout).context(channel:google).window(-90d:)").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "visited(checkout).context(channel:google).window(-90d:)");
    }

    #[test]
    fn test_normalize_sorts_lists() {
        let a = normalize("visited(b,a,c)").unwrap();
        assert_eq!(a, "visited(a,b,c)");
    }

    #[test]
    fn test_normalize_idempotent() {
        let exprs = [
            "visited(b,a).exclude(z).case(exp:b)",
            "context(browser-type:chrome).context(channel:google)",
            "contextAny(channel:{google,bing}).window(2026-01-01:2026-03-31)",
            "window(-7d:0d)",
        ];
        for e in exprs {
            let once = normalize(e).unwrap();
            let twice = normalize(&once).unwrap();
            assert_eq!(once, twice, "normalize not idempotent for '{}'", e);
        }
    }

    #[test]
    fn test_context_forms() {
        let set = parse("context(channel:google).context(browser-type)").unwrap();
        assert!(set
            .contexts
            .contains(&("channel".to_string(), "google".to_string())));
        assert!(set.bare_contexts.contains("browser-type"));
        assert!(!set.is_storable());
    }

    #[test]
    fn test_context_any() {
        let set = parse("contextAny(channel:{google,bing})").unwrap();
        assert_eq!(set.any_groups.len(), 1);
        assert!(!set.is_storable());
        assert!(set.slice_key().is_err());
    }

    #[test]
    fn test_window_forms() {
        let set = parse("window(2026-01-01:2026-01-31)").unwrap();
        let window = set.window.unwrap();
        assert_eq!(
            window.start,
            DateBound::Absolute(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap())
        );
        let rel = parse("window(-90d:)").unwrap().window.unwrap();
        assert_eq!(rel.start, DateBound::Relative(-90));
        assert_eq!(rel.end, DateBound::Open);
    }

    #[test]
    fn test_window_resolution() {
        let today = NaiveDate::from_ymd_opt(2026, 4, 10).unwrap();
        let fallback = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        )
        .unwrap();
        let window = parse("window(-9d:)").unwrap().window.unwrap();
        let resolved = window.resolve(today, &fallback).unwrap();
        assert_eq!(resolved.start, NaiveDate::from_ymd_opt(2026, 4, 1).unwrap());
        // Open end extends to today when the relative start lands after the
        // fallback range's end
        assert_eq!(resolved.end, today);
    }

    #[test]
    fn test_open_end_respects_later_fallback() {
        let today = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();
        let fallback = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        )
        .unwrap();
        let window = parse("window(-9d:)").unwrap().window.unwrap();
        let resolved = window.resolve(today, &fallback).unwrap();
        assert_eq!(resolved.start, NaiveDate::from_ymd_opt(2026, 2, 6).unwrap());
        // Fallback end is past today, so it wins
        assert_eq!(resolved.end, fallback.end);
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            parse("frobnicate(x)"),
            Err(SyntaxError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_malformed_case() {
        assert!(matches!(
            parse("case(exp)"),
            Err(SyntaxError::MalformedArgument { .. })
        ));
        assert!(matches!(
            parse("case(exp:b:c)"),
            Err(SyntaxError::MalformedArgument { .. })
        ));
    }

    #[test]
    fn test_unbalanced() {
        assert!(matches!(
            parse("visited(a"),
            Err(SyntaxError::UnbalancedDelimiters(_))
        ));
    }

    #[test]
    fn test_compound_rejected() {
        assert!(matches!(
            parse("visited(a);visited(b)"),
            Err(SyntaxError::NotAtomic(_))
        ));
    }

    #[test]
    fn test_duplicate_window_rejected() {
        assert!(matches!(
            parse("window(-7d:).window(-14d:)"),
            Err(SyntaxError::MalformedArgument { .. })
        ));
    }

    #[test]
    fn test_bad_date() {
        assert!(matches!(
            parse("window(01/02/2026:)"),
            Err(SyntaxError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_split_window() {
        let set = parse("visited(a).window(-30d:)").unwrap();
        let (base, window) = set.split_window();
        assert!(window.is_some());
        assert!(base.window.is_none());
        assert_eq!(base.canonical_string(), "visited(a)");
    }
}
