//! Byte literal matcher.
//!
//! The pattern is the literal itself, as text or (with `"hex": true`) as a
//! hex string. Case-insensitive matching folds ASCII letters only.

use super::matcher::{CompiledQuery, Matcher, parse_options};
use crate::error::CoordinationError;
use crate::jobs::types::{Metadata, ObjectOutcome, QuerySpec};
use crate::storage::types::IndexQuery;

use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LiteralOptions {
    #[serde(default)]
    hex: bool,
    #[serde(default)]
    case_insensitive: bool,
}

pub struct LiteralMatcher;

impl Matcher for LiteralMatcher {
    fn compile(&self, query: &QuerySpec) -> Result<Arc<dyn CompiledQuery>, CoordinationError> {
        let options: LiteralOptions = parse_options("literal", &query.options)?;

        let needle = if options.hex {
            let compact: String = query.pattern.split_whitespace().collect();
            hex::decode(&compact)
                .map_err(|e| CoordinationError::InvalidQuery(format!("invalid hex literal: {}", e)))?
        } else {
            query.pattern.as_bytes().to_vec()
        };

        if needle.is_empty() {
            return Err(CoordinationError::InvalidQuery(
                "literal pattern must not be empty".to_string(),
            ));
        }

        Ok(Arc::new(CompiledLiteral {
            needle,
            case_insensitive: options.case_insensitive,
        }))
    }
}

struct CompiledLiteral {
    needle: Vec<u8>,
    case_insensitive: bool,
}

impl CompiledLiteral {
    fn find(&self, data: &[u8]) -> Option<usize> {
        data.windows(self.needle.len()).position(|window| {
            if self.case_insensitive {
                window.eq_ignore_ascii_case(&self.needle)
            } else {
                window == self.needle.as_slice()
            }
        })
    }
}

impl CompiledQuery for CompiledLiteral {
    fn index_query(&self) -> IndexQuery {
        // The index is case-sensitive.
        if self.case_insensitive {
            IndexQuery::All
        } else {
            IndexQuery::Contains(self.needle.clone())
        }
    }

    fn evaluate(&self, data: &[u8]) -> anyhow::Result<ObjectOutcome> {
        Ok(match self.find(data) {
            Some(offset) => {
                let mut metadata = Metadata::new();
                metadata.insert("offset".to_string(), offset.into());
                ObjectOutcome::Matched { metadata }
            }
            None => ObjectOutcome::NotMatched,
        })
    }
}
