//! Error types for the aggregation engine
//!
//! The taxonomy follows the failure semantics of the engine:
//!
//! - [`SyntaxError`]: malformed DSL, surfaced immediately, never retried
//! - [`ConfigurationError`]: unknown context keys/values, registry-load
//!   violations, or a slice-isolation violation; raised loudly, never
//!   silently degraded
//! - [`StoreError`]: inconsistent mutations of the stored-slice collection
//!
//! Fetch failures and staleness are deliberately *not* part of this
//! hierarchy: they fold into the warnings of an aggregation result and never
//! abort a query. See `engine::adapter::FetchError`.

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// DSL syntax error
    #[error("Syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    /// Configuration or registry error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Stored-slice collection error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error (registry/config loading)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (registry/config loading)
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// DSL syntax errors
///
/// Produced by `dsl::parse` and the compound-expression splitter. These are
/// caller-visible and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    /// The expression is empty
    #[error("empty expression")]
    Empty,

    /// Parentheses or braces do not balance
    #[error("unbalanced delimiters in '{0}'")]
    UnbalancedDelimiters(String),

    /// A constraint function name is not recognized
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// A key:value pair inside a constraint is malformed
    #[error("malformed argument in {function}(): {detail}")]
    MalformedArgument {
        /// Constraint function name
        function: String,
        /// What was wrong with the argument
        detail: String,
    },

    /// A term is not a recognizable constraint call or bare token
    #[error("invalid term '{0}'")]
    InvalidTerm(String),

    /// A date literal could not be parsed
    #[error("invalid date '{0}': expected YYYY-MM-DD, a relative offset like -90d, or empty")]
    InvalidDate(String),

    /// Input remained after a complete expression was parsed
    #[error("unexpected trailing input: '{0}'")]
    TrailingInput(String),

    /// An atomic expression was expected but the input still carries
    /// alternatives (';', 'or(...)' or a distributable group)
    #[error("expression is not atomic: {0}")]
    NotAtomic(String),

    /// A storage key was requested for a constraint set that still contains
    /// unexpanded alternatives (a bare context key or a contextAny group)
    #[error("constraint set still contains unexpanded selections: {0}")]
    UnexpandedSelection(String),
}

/// Configuration and registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A context key is not declared in the registry
    #[error("unknown context key '{0}'")]
    UnknownContext(String),

    /// A value is not legal for a context key
    #[error("unknown value '{value}' for context '{context}'")]
    UnknownValue {
        /// Context key
        context: String,
        /// The illegal value
        value: String,
    },

    /// No filter mapping exists for a (context, value, source) triple
    #[error("no filter mapping for context '{context}' value '{value}' on source '{source_id}'")]
    MissingMapping {
        /// Context key
        context: String,
        /// Context value
        value: String,
        /// Source identifier
        source_id: String,
    },

    /// A registry entry declares both or neither of predicate and pattern
    #[error("invalid filter mapping for context '{context}' value '{value}': {reason}")]
    InvalidMapping {
        /// Context key
        context: String,
        /// Context value
        value: String,
        /// Why the mapping was rejected
        reason: String,
    },

    /// A context definition enumerates the same value twice
    #[error("duplicate value '{value}' in context '{context}'")]
    DuplicateValue {
        /// Context key
        context: String,
        /// The repeated value
        value: String,
    },

    /// A pattern-valued mapping does not compile as a regex
    #[error("invalid pattern for context '{context}' value '{value}': {reason}")]
    InvalidPattern {
        /// Context key
        context: String,
        /// Context value
        value: String,
        /// Regex compile error
        reason: String,
    },

    /// The registry index names a context with no definition document
    #[error("missing definition for context '{0}'")]
    MissingDefinition(String),

    /// The slice-isolation invariant was violated: the stored pool contains
    /// context-bearing slices but the caller gave no target slice and did
    /// not request partition aggregation
    #[error("stored slices carry contexts but no target slice was given: {0}")]
    MixedSlices(String),

    /// Partition aggregation was requested over a target that already pins
    /// every context key
    #[error("invalid partition target: {0}")]
    InvalidPartitionTarget(String),
}

/// Stored-slice collection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Daily data was merged into an aggregate-only slice or vice versa
    #[error("granularity mismatch for slice '{0}'")]
    GranularityMismatch(String),

    /// A date range was constructed with start after end
    #[error("invalid date range: start {start} > end {end}")]
    InvalidRange {
        /// Range start
        start: String,
        /// Range end
        end: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
