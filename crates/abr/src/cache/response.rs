use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Bytes;

use super::CacheKey;
use crate::{http::HttpResponse, params::ParamDict, util::ByteRange};

/// A cached response body with the headers that came with it.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub effective_url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

struct CacheItem {
    key: CacheKey,
    response: CachedResponse,
    expires_at: Option<Instant>,
}

struct Inner {
    /// Most recently used entry first.
    items: Vec<CacheItem>,
    total_size: usize,
}

/// Byte-budget LRU cache for small HTTP responses such as xlink fragments and segment indexes.
///
/// The summed body size never exceeds `max_element_size` and the number of entries never
/// exceeds `max_num_elements`. A budget of zero retains nothing.
pub struct HttpResponseCache {
    inner: Mutex<Inner>,
    max_element_size: usize,
    max_num_elements: usize,
}

impl HttpResponseCache {
    pub fn new(max_element_size: usize, max_num_elements: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                total_size: 0,
            }),
            max_element_size,
            max_num_elements,
        }
    }

    /// Reads `cache.response.max_bytes` (default 2 MiB) and `cache.response.max_entries`
    /// (default 32).
    pub fn from_options(options: &ParamDict) -> Self {
        let max_bytes = options.get_i64_or("cache.response.max_bytes", 2 << 20);
        let max_entries = options.get_i64_or("cache.response.max_entries", 32);
        Self::new(max_bytes.max(0) as usize, max_entries.max(0) as usize)
    }

    /// Looks up a response and marks it as most recently used.
    pub fn get(&self, url: &str, range: Option<ByteRange>) -> Option<CachedResponse> {
        let key = CacheKey::new(url, range);
        let mut inner = self.inner.lock().unwrap();
        let index = inner.items.iter().position(|item| item.key == key)?;

        if matches!(inner.items[index].expires_at, Some(expires_at) if expires_at <= Instant::now())
        {
            let item = inner.items.remove(index);
            inner.total_size -= item.response.body.len();
            return None;
        }

        let item = inner.items.remove(index);
        let response = item.response.clone();
        inner.items.insert(0, item);
        Some(response)
    }

    /// Stores a response, evicting least recently used entries until it fits.
    ///
    /// Returns `false` if the response is larger than the whole budget.
    pub fn insert(
        &self,
        url: &str,
        range: Option<ByteRange>,
        response: CachedResponse,
        max_age: Option<Duration>,
    ) -> bool {
        let size = response.body.len();
        if size > self.max_element_size || self.max_element_size == 0 || self.max_num_elements == 0 {
            log::debug!("Response for {url} ({size} bytes) does not fit into the cache");
            return false;
        }

        let key = CacheKey::new(url, range);
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.items.iter().position(|item| item.key == key) {
            let item = inner.items.remove(index);
            inner.total_size -= item.response.body.len();
        }
        while !inner.items.is_empty()
            && (inner.total_size + size > self.max_element_size
                || inner.items.len() >= self.max_num_elements)
        {
            if let Some(evicted) = inner.items.pop() {
                inner.total_size -= evicted.response.body.len();
            }
        }

        inner.total_size += size;
        inner.items.insert(
            0,
            CacheItem {
                key,
                response,
                expires_at: max_age.map(|max_age| Instant::now() + max_age),
            },
        );
        true
    }

    /// Caches a successful response unless its `Cache-Control` forbids it.
    pub fn insert_response(&self, url: &str, range: Option<ByteRange>, response: &HttpResponse) {
        if !response.is_success() {
            return;
        }
        let cache_control = response.header("cache-control").unwrap_or_default();
        if cache_control
            .split(',')
            .any(|directive| matches!(directive.trim(), "no-store" | "no-cache"))
        {
            return;
        }
        let max_age = cache_control.split(',').find_map(|directive| {
            directive
                .trim()
                .strip_prefix("max-age=")
                .and_then(|seconds| seconds.parse().ok())
                .map(Duration::from_secs)
        });
        self.insert(
            url,
            range,
            CachedResponse {
                effective_url: response.info.effective_url.clone(),
                headers: response.headers.clone(),
                body: response.body.clone(),
            },
            max_age,
        );
    }

    pub fn remove(&self, url: &str, range: Option<ByteRange>) {
        let key = CacheKey::new(url, range);
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.items.iter().position(|item| item.key == key) {
            let item = inner.items.remove(index);
            inner.total_size -= item.response.body.len();
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        inner.total_size = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().unwrap().total_size
    }
}
