//! Regular expression matcher over raw bytes (`regex::bytes`).

use super::matcher::{CompiledQuery, Matcher, parse_options};
use crate::error::CoordinationError;
use crate::jobs::types::{Metadata, ObjectOutcome, QuerySpec};
use crate::storage::types::IndexQuery;

use regex::bytes::{Regex, RegexBuilder};
use serde::Deserialize;
use std::sync::Arc;

/// Compiled program size cap, in bytes.
const DEFAULT_SIZE_LIMIT: usize = 10 * (1 << 20);

/// Shortest literal worth sending to the index (its n-gram size).
const MIN_INDEX_LITERAL: usize = 3;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegexOptions {
    #[serde(default)]
    case_insensitive: bool,
    #[serde(default)]
    size_limit: Option<usize>,
}

pub struct RegexMatcher;

impl Matcher for RegexMatcher {
    fn compile(&self, query: &QuerySpec) -> Result<Arc<dyn CompiledQuery>, CoordinationError> {
        let options: RegexOptions = parse_options("regex", &query.options)?;

        let regex = RegexBuilder::new(&query.pattern)
            .case_insensitive(options.case_insensitive)
            .size_limit(options.size_limit.unwrap_or(DEFAULT_SIZE_LIMIT))
            .build()
            .map_err(|e| CoordinationError::InvalidQuery(format!("invalid regex: {}", e)))?;

        let literal = if options.case_insensitive {
            None
        } else {
            required_literal(&query.pattern)
        };

        Ok(Arc::new(CompiledRegex { regex, literal }))
    }
}

/// Longest run of plain characters that every match must contain, if it is
/// long enough to be useful to the index.
///
/// Conservative: alternations, inline flags and escapes with operands
/// (`\x41`, `\p{L}`) give up entirely, group and
/// class contents are skipped, and a character followed by `?`, `*` or `{`
/// is treated as optional.
pub(crate) fn required_literal(pattern: &str) -> Option<Vec<u8>> {
    if pattern.contains('|') || pattern.contains("(?") {
        return None;
    }

    fn flush(run: &mut String, best: &mut String) {
        if run.len() > best.len() {
            *best = std::mem::take(run);
        } else {
            run.clear();
        }
    }

    let mut best = String::new();
    let mut run = String::new();
    let mut depth = 0usize;
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '(' => {
                depth += 1;
                flush(&mut run, &mut best);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                flush(&mut run, &mut best);
            }
            '[' => {
                flush(&mut run, &mut best);
                while let Some(inner) = chars.next() {
                    match inner {
                        '\\' => {
                            chars.next();
                        }
                        ']' => break,
                        _ => {}
                    }
                }
            }
            '\\' => {
                flush(&mut run, &mut best);
                // Code point and class escapes carry operands.
                if matches!(chars.next(), Some('x' | 'u' | 'U' | 'p' | 'P')) {
                    return None;
                }
            }
            '?' | '*' | '{' => {
                run.pop();
                flush(&mut run, &mut best);
                if c == '{' {
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            break;
                        }
                    }
                }
            }
            '+' | '.' | '^' | '$' => flush(&mut run, &mut best),
            _ if depth > 0 => {}
            _ => run.push(c),
        }
    }
    flush(&mut run, &mut best);

    (best.len() >= MIN_INDEX_LITERAL).then(|| best.into_bytes())
}

struct CompiledRegex {
    regex: Regex,
    literal: Option<Vec<u8>>,
}

impl CompiledQuery for CompiledRegex {
    fn index_query(&self) -> IndexQuery {
        match &self.literal {
            Some(literal) => IndexQuery::Contains(literal.clone()),
            None => IndexQuery::All,
        }
    }

    fn evaluate(&self, data: &[u8]) -> anyhow::Result<ObjectOutcome> {
        Ok(match self.regex.find(data) {
            Some(found) => {
                let mut metadata = Metadata::new();
                metadata.insert("offset".to_string(), found.start().into());
                metadata.insert("length".to_string(), found.len().into());
                ObjectOutcome::Matched { metadata }
            }
            None => ObjectOutcome::NotMatched,
        })
    }
}
