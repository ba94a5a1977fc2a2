use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use url::Url;

use super::xml::{Element, NodeId, XmlArena};

/// A parsed MPD with all `onLoad` xlinks resolved. Immutable once published.
#[derive(Debug)]
pub struct MpdDocument {
    generation: u64,
    arena: XmlArena,
    /// URL the document was fetched from, after redirects.
    url: Url,
    etag: Option<String>,
}

impl MpdDocument {
    pub fn new(generation: u64, arena: XmlArena, url: Url, etag: Option<String>) -> Self {
        Self {
            generation,
            arena,
            url,
            etag,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn arena(&self) -> &XmlArena {
        &self.arena
    }

    pub fn element(&self, id: NodeId) -> Element<'_> {
        self.arena.element(id)
    }

    pub fn doc_ref(&self, id: NodeId) -> DocRef {
        DocRef {
            generation: self.generation,
            node: id,
        }
    }
}

/// Handle to an element of a specific document generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocRef {
    pub generation: u64,
    pub node: NodeId,
}

/// Holds the current document generation.
///
/// Manifest nodes resolve their [`DocRef`] through the store. Once a newer document has been
/// published the old handles no longer resolve.
#[derive(Debug, Default)]
pub struct DocumentStore {
    current: Mutex<Option<Arc<MpdDocument>>>,
    next_generation: AtomicU64,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn publish(&self, document: Arc<MpdDocument>) {
        *self.current.lock().unwrap() = Some(document);
    }

    pub fn current(&self) -> Option<Arc<MpdDocument>> {
        self.current.lock().unwrap().clone()
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|document| document.generation)
    }

    /// Returns the document `doc_ref` points into, or `None` if it has been superseded.
    pub fn resolve(&self, doc_ref: DocRef) -> Option<Arc<MpdDocument>> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .filter(|document| document.generation == doc_ref.generation)
            .cloned()
    }

    pub fn clear(&self) {
        self.current.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(store: &DocumentStore) -> Arc<MpdDocument> {
        let arena = XmlArena::parse("<MPD/>").unwrap();
        Arc::new(MpdDocument::new(
            store.next_generation(),
            arena,
            Url::parse("http://localhost/a.mpd").unwrap(),
            None,
        ))
    }

    #[test]
    fn test_superseded_handles_are_gone() {
        let store = DocumentStore::new();
        let first = document(&store);
        store.publish(first.clone());
        let root = first.doc_ref(NodeId(0));
        assert!(store.resolve(root).is_some());

        store.publish(document(&store));
        assert!(store.resolve(root).is_none());
        assert_eq!(store.current_generation(), Some(first.generation() + 1));
    }
}
