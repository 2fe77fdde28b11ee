//! The Giles query language.
//!
//! ```text
//! select <taglist> [where <pred>]
//! select distinct <tag> [where <pred>]
//! select data <in (t1, t2) | before t | after t> [limit N] [streamlimit N] [as unit] where <pred>
//! delete <taglist> where <pred> | delete where <pred> | delete data <range> where <pred>
//! set <tag> = "v", ... where <pred>
//! apply <expr> [where <pred>]
//! ```

pub mod ast;
pub mod cache;
pub mod lexer;
pub mod parser;
pub mod time;

pub use ast::{DataQuery, DataRange, ParsedQuery, QueryKind, TimeValue, WhereNode, ALL_TAGS};
pub use cache::QueryCache;
pub use parser::parse_query;

use crate::error::Result;
use std::time::Duration;
use tracing::trace;

/// Parser front end with a cache keyed by the raw query text.
///
/// Queries that read the clock (`now`) are parsed every time.
#[derive(Default)]
pub struct QueryParser {
    cache: QueryCache,
}

impl QueryParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(capacity: usize, ttl: Duration) -> Self {
        Self { cache: QueryCache::new(capacity, ttl) }
    }

    pub fn parse(&self, input: &str) -> Result<ParsedQuery> {
        if let Some(query) = self.cache.get(input) {
            trace!(target: "giles::querylang", query = input, "Parse cache hit");
            return Ok(query);
        }
        let parsed = parser::parse(input)?;
        if !parsed.uses_now {
            self.cache.put(input, parsed.query.clone());
        }
        Ok(parsed.query)
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
