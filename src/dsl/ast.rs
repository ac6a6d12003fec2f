//! Compound-expression AST
//!
//! A compound expression denotes a *set* of atomic slice expressions:
//!
//! - `;` separates alternatives at any level
//! - `or(a, b)` is the function form of alternation, nestable
//! - a parenthesized group distributes its prefix and suffix across every
//!   contained alternative: `X.(a;b)` and `(a;b).X` both denote two slices
//!
//! The grammar is a small tagged union ([`Expr`]) with a structural
//! recursive evaluator ([`Expr::explode_terms`]), no string surgery. This
//! keeps equivalence properties (`(a;b).c == a.c;b.c` as sets) easy to test.

use crate::error::SyntaxError;

/// One node of a compound expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A single constraint term, e.g. `context(channel:google)`
    Atom(String),
    /// Alternatives: any one of the branches
    Or(Vec<Expr>),
    /// Conjunction of parts, joined by `.` in the surface syntax
    Seq(Vec<Expr>),
}

impl Expr {
    /// Evaluate the tree into the ordered list of atomic expressions it
    /// denotes
    ///
    /// Alternatives expand in source order; sequences take the cartesian
    /// product of their parts. Duplicates are preserved here; the caller
    /// dedupes after canonicalization, since syntactically distinct atoms
    /// can normalize to the same key.
    pub fn explode_terms(&self) -> Vec<String> {
        match self {
            Expr::Atom(s) => vec![s.clone()],
            Expr::Or(branches) => branches.iter().flat_map(Expr::explode_terms).collect(),
            Expr::Seq(parts) => {
                let mut acc: Vec<String> = vec![String::new()];
                for part in parts {
                    let options = part.explode_terms();
                    let mut next = Vec::with_capacity(acc.len() * options.len());
                    for prefix in &acc {
                        for option in &options {
                            if prefix.is_empty() {
                                next.push(option.clone());
                            } else {
                                next.push(format!("{}.{}", prefix, option));
                            }
                        }
                    }
                    acc = next;
                }
                acc
            },
        }
    }

    /// True when the tree contains no alternatives
    pub fn is_atomic(&self) -> bool {
        match self {
            Expr::Atom(_) => true,
            Expr::Or(_) => false,
            Expr::Seq(parts) => parts.iter().all(Expr::is_atomic),
        }
    }
}

/// Parse a compound expression into its AST
pub fn parse_compound(input: &str) -> Result<Expr, SyntaxError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(SyntaxError::Empty);
    }
    check_balance(s)?;
    parse_alternatives(s)
}

/// Verify that parentheses and braces balance
pub(crate) fn check_balance(s: &str) -> Result<(), SyntaxError> {
    let mut parens: i64 = 0;
    let mut braces: i64 = 0;
    for c in s.chars() {
        match c {
            '(' => parens += 1,
            ')' => parens -= 1,
            '{' => braces += 1,
            '}' => braces -= 1,
            _ => {},
        }
        if parens < 0 || braces < 0 {
            return Err(SyntaxError::UnbalancedDelimiters(s.to_string()));
        }
    }
    if parens != 0 || braces != 0 {
        return Err(SyntaxError::UnbalancedDelimiters(s.to_string()));
    }
    Ok(())
}

/// Split on a separator at nesting depth zero
fn split_top(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth: i64 = 0;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '{' => depth += 1,
            ')' | '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            },
            _ => {},
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_alternatives(s: &str) -> Result<Expr, SyntaxError> {
    let parts = split_top(s, ';');
    if parts.len() > 1 {
        let branches = parts
            .iter()
            .map(|p| parse_sequence(p.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Expr::Or(branches))
    } else {
        parse_sequence(s.trim())
    }
}

fn parse_sequence(s: &str) -> Result<Expr, SyntaxError> {
    if s.is_empty() {
        return Err(SyntaxError::InvalidTerm(String::new()));
    }
    let parts = split_top(s, '.');
    if parts.len() > 1 {
        let exprs = parts
            .iter()
            .map(|p| parse_part(p.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Expr::Seq(exprs))
    } else {
        parse_part(s.trim())
    }
}

fn parse_part(s: &str) -> Result<Expr, SyntaxError> {
    if s.is_empty() {
        return Err(SyntaxError::InvalidTerm(String::new()));
    }

    // Function form of alternation: or(a, b)
    if let Some(inner) = call_body(s, "or") {
        let branches = split_top(inner, ',')
            .iter()
            .map(|p| parse_alternatives(p.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        if branches.is_empty() {
            return Err(SyntaxError::InvalidTerm(s.to_string()));
        }
        return Ok(Expr::Or(branches));
    }

    // Parenthesized group
    if let Some(stripped) = s.strip_prefix('(') {
        if let Some(inner) = stripped.strip_suffix(')') {
            // Only treat as a group when the outer parens actually match;
            // a false strip like "(a)(b" leaves an unbalanced inner
            if check_balance(inner).is_ok() {
                return parse_alternatives(inner.trim());
            }
        }
        return Err(SyntaxError::InvalidTerm(s.to_string()));
    }

    // Constraint call or bare token
    if looks_like_atom(s) {
        Ok(Expr::Atom(s.to_string()))
    } else {
        Err(SyntaxError::InvalidTerm(s.to_string()))
    }
}

/// Extract the body of `name(...)` when the call spans the whole part
fn call_body<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(name)?;
    let rest = rest.strip_prefix('(')?;
    let body = rest.strip_suffix(')')?;
    // The stripped parens must be a matching pair, not e.g. "or(a).(b)"
    check_balance(body).ok()?;
    Some(body)
}

/// A part is an atom when it is a single call `name(args)` with a
/// paren-free body, or a bare identifier token
fn looks_like_atom(s: &str) -> bool {
    let ident_end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(s.len());
    if ident_end == 0 {
        return false;
    }
    let rest = &s[ident_end..];
    if rest.is_empty() {
        return true; // bare token
    }
    if let Some(body) = rest.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        return !body.contains('(') && !body.contains(')');
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_atom() {
        let e = parse_compound("context(channel:google)").unwrap();
        assert_eq!(e, Expr::Atom("context(channel:google)".to_string()));
        assert!(e.is_atomic());
    }

    #[test]
    fn test_semicolon_alternatives() {
        let e = parse_compound("visited(a);visited(b)").unwrap();
        assert_eq!(
            e.explode_terms(),
            vec!["visited(a)".to_string(), "visited(b)".to_string()]
        );
        assert!(!e.is_atomic());
    }

    #[test]
    fn test_prefix_distribution() {
        let e = parse_compound("visited(x).(context(channel:a);context(channel:b))").unwrap();
        assert_eq!(
            e.explode_terms(),
            vec![
                "visited(x).context(channel:a)".to_string(),
                "visited(x).context(channel:b)".to_string(),
            ]
        );
    }

    #[test]
    fn test_suffix_distribution() {
        let e = parse_compound("(context(channel:a);context(channel:b)).visited(x)").unwrap();
        assert_eq!(
            e.explode_terms(),
            vec![
                "context(channel:a).visited(x)".to_string(),
                "context(channel:b).visited(x)".to_string(),
            ]
        );
    }

    #[test]
    fn test_or_call() {
        let e = parse_compound("or(visited(a),visited(b)).exclude(c)").unwrap();
        assert_eq!(
            e.explode_terms(),
            vec![
                "visited(a).exclude(c)".to_string(),
                "visited(b).exclude(c)".to_string(),
            ]
        );
    }

    #[test]
    fn test_nested_or() {
        let e = parse_compound("or(or(visited(a),visited(b)),visited(c))").unwrap();
        assert_eq!(e.explode_terms().len(), 3);
    }

    #[test]
    fn test_double_distribution() {
        let e = parse_compound("(visited(a);visited(b)).(exclude(x);exclude(y))").unwrap();
        assert_eq!(e.explode_terms().len(), 4);
    }

    #[test]
    fn test_unbalanced() {
        assert!(matches!(
            parse_compound("visited(a"),
            Err(SyntaxError::UnbalancedDelimiters(_))
        ));
        assert!(matches!(
            parse_compound("visited(a))"),
            Err(SyntaxError::UnbalancedDelimiters(_))
        ));
    }

    #[test]
    fn test_empty() {
        assert!(matches!(parse_compound("  "), Err(SyntaxError::Empty)));
    }

    #[test]
    fn test_comma_inside_call_is_not_split() {
        let e = parse_compound("or(visited(a,b),visited(c))").unwrap();
        assert_eq!(
            e.explode_terms(),
            vec!["visited(a,b)".to_string(), "visited(c)".to_string()]
        );
    }
}
