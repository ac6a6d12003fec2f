//! Query DSL: parsing, canonicalization, and compound explosion
//!
//! The DSL expresses filtered, windowed funnel measurements. This module
//! exposes the three pure entry points the UI layer consumes:
//!
//! - [`parse`]: one atomic expression into a [`ParsedConstraintSet`]
//! - [`normalize`]: parse plus deterministic re-serialization
//! - [`explode`]: a compound expression into canonical atomic slice keys

pub mod ast;
pub mod explode;
pub mod parser;

pub use ast::{parse_compound, Expr};
pub use explode::{explode, ExplodeWarning, Explosion, DEFAULT_EXPLOSION_CAP};
pub use parser::{normalize, parse, Constraint, DateBound, DateWindow, ParsedConstraintSet};
