//! Matcher Registry
//!
//! Maps matcher names (e.g. "literal") to their implementation, so the
//! scheduler and the workers stay generic over how objects are matched.

use super::literal::LiteralMatcher;
use super::matcher::{CompiledQuery, Matcher};
use super::pattern::RegexMatcher;
use crate::error::CoordinationError;
use crate::jobs::types::QuerySpec;

use dashmap::DashMap;
use std::sync::Arc;

pub struct MatcherRegistry {
    matchers: DashMap<String, Arc<dyn Matcher>>,
}

impl MatcherRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry with the built-in `literal` and `regex` matchers.
    pub fn with_builtin() -> Arc<Self> {
        let registry = Self::default();
        registry.register("literal", LiteralMatcher);
        registry.register("regex", RegexMatcher);
        Arc::new(registry)
    }

    /// Registers `matcher` under `name`, replacing any previous one.
    pub fn register<M>(&self, name: &str, matcher: M)
    where
        M: Matcher + 'static,
    {
        self.matchers.insert(name.to_string(), Arc::new(matcher));
        tracing::info!("Registered matcher: {}", name);
    }

    /// Compiles a query with the matcher it names.
    ///
    /// # Returns
    /// * `Err(InvalidQuery)` if the matcher is unknown or rejects the pattern.
    pub fn compile(&self, query: &QuerySpec) -> Result<Arc<dyn CompiledQuery>, CoordinationError> {
        let matcher = self
            .matchers
            .get(&query.matcher)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                CoordinationError::InvalidQuery(format!("unknown matcher '{}'", query.matcher))
            })?;

        tracing::debug!(
            "Compiling query with matcher '{}' (pattern length: {} bytes)",
            query.matcher,
            query.pattern.len()
        );

        matcher.compile(query)
    }

    /// Registered matcher names, sorted.
    pub fn list_matchers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .matchers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn has_matcher(&self, name: &str) -> bool {
        self.matchers.contains_key(name)
    }

    pub fn matcher_count(&self) -> usize {
        self.matchers.len()
    }
}

impl Default for MatcherRegistry {
    fn default() -> Self {
        Self {
            matchers: DashMap::new(),
        }
    }
}
