use std::sync::{Arc, Mutex};

use super::CacheKey;
use crate::{
    mp4::{InitSegment, SegmentIndex},
    params::ParamDict,
    util::ByteRange,
};

#[derive(Debug, Clone)]
enum Entity {
    InitSegment(Arc<InitSegment>),
    SegmentIndex(Arc<SegmentIndex>),
}

/// Parsed documents shared across segments, keyed by URL and byte range.
///
/// Holds at most `max_entries` entities, evicting the least recently used one first.
#[derive(Debug)]
pub struct EntityCache {
    entries: Mutex<Vec<(CacheKey, Entity)>>,
    max_entries: usize,
}

impl EntityCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries,
        }
    }

    /// Reads `cache.entity.max_entries` (default 64).
    pub fn from_options(options: &ParamDict) -> Self {
        Self::new(options.get_i64_or("cache.entity.max_entries", 64).max(0) as usize)
    }

    pub fn get_init_segment(&self, url: &str, range: Option<ByteRange>) -> Option<Arc<InitSegment>> {
        match self.get(&CacheKey::new(url, range))? {
            Entity::InitSegment(init) => Some(init),
            Entity::SegmentIndex(_) => None,
        }
    }

    pub fn put_init_segment(&self, url: &str, range: Option<ByteRange>, init: Arc<InitSegment>) {
        self.put(CacheKey::new(url, range), Entity::InitSegment(init));
    }

    pub fn get_segment_index(&self, url: &str, range: Option<ByteRange>) -> Option<Arc<SegmentIndex>> {
        match self.get(&CacheKey::new(url, range))? {
            Entity::SegmentIndex(sidx) => Some(sidx),
            Entity::InitSegment(_) => None,
        }
    }

    pub fn put_segment_index(&self, url: &str, range: Option<ByteRange>, sidx: Arc<SegmentIndex>) {
        self.put(CacheKey::new(url, range), Entity::SegmentIndex(sidx));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn get(&self, key: &CacheKey) -> Option<Entity> {
        let mut entries = self.entries.lock().unwrap();
        let index = entries.iter().position(|(k, _)| k == key)?;
        let entry = entries.remove(index);
        let entity = entry.1.clone();
        entries.insert(0, entry);
        Some(entity)
    }

    fn put(&self, key: CacheKey, entity: Entity) {
        if self.max_entries == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(k, _)| k != &key);
        entries.truncate(self.max_entries - 1);
        entries.insert(0, (key, entity));
    }
}
