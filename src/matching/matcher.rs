use crate::error::CoordinationError;
use crate::jobs::types::{ObjectOutcome, QuerySpec};
use crate::storage::types::IndexQuery;

use serde::de::DeserializeOwned;
use std::sync::Arc;

/// A query ready to run: built once per job, evaluated once per object.
pub trait CompiledQuery: Send + Sync {
    /// What to ask the index for before any object is read.
    fn index_query(&self) -> IndexQuery;

    /// Checks one object's content. An `Err` becomes a per-object error.
    fn evaluate(&self, data: &[u8]) -> anyhow::Result<ObjectOutcome>;
}

/// A named way of matching objects, e.g. byte literals or regular expressions.
pub trait Matcher: Send + Sync {
    /// Validates `pattern` and `options` of the query and compiles them.
    fn compile(&self, query: &QuerySpec) -> Result<Arc<dyn CompiledQuery>, CoordinationError>;
}

/// Decodes the matcher options of a query; a missing object means defaults.
pub fn parse_options<T>(matcher: &str, options: &serde_json::Value) -> Result<T, CoordinationError>
where
    T: DeserializeOwned + Default,
{
    if options.is_null() {
        return Ok(T::default());
    }

    serde_json::from_value(options.clone()).map_err(|e| {
        CoordinationError::InvalidQuery(format!("invalid options for '{}': {}", matcher, e))
    })
}
