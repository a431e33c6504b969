//! Matching Module
//!
//! The pluggable capability that decides whether one object matches a job's
//! query, plus read access to the objects themselves.
//!
//! ## Core Concepts
//! - **Matcher**: a named compiler from `pattern` + `options` to a compiled query.
//! - **Compiled query**: tells the index what to pre-filter on and evaluates
//!   object contents. Compiled once per job on each worker.
//! - **Sample store**: read-only directory holding the objects.
//!
//! ## Built-in Matchers
//! - **`literal`**: byte substring, text or hex, optional ASCII case folding.
//! - **`regex`**: byte regular expression.

pub mod literal;
pub mod matcher;
pub mod pattern;
pub mod registry;
pub mod samples;

pub use matcher::{CompiledQuery, Matcher};
pub use registry::MatcherRegistry;
pub use samples::SampleStore;
