//! Lookup-before-fetch caches shared by the playlist reader and the stream handlers.

mod entity;
mod response;

pub use entity::EntityCache;
pub use response::{CachedResponse, HttpResponseCache};

use crate::util::ByteRange;

/// Cache key of a resource: its URL and the requested byte range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    pub range: Option<ByteRange>,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, range: Option<ByteRange>) -> Self {
        Self {
            url: url.into(),
            range,
        }
    }
}
