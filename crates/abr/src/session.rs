//! Per-session context shared by the reader, the period, the selector and the stream handlers.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{self, Receiver, Sender},
    Arc, Mutex,
};

use serde::{Deserialize, Serialize};

use crate::{
    cache::{EntityCache, HttpResponseCache},
    clock::SynchronizedUtcClock,
    drm::Decrypter,
    error::PlayerError,
    http::HttpTransport,
    mpd::{DocumentStore, Manifest},
    params::ParamDict,
};

/// Notifications published by the session components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerEvent {
    ManifestLoaded { generation: u64 },
    ManifestUpdated { generation: u64 },
    ManifestNotModified,
    InitialXlinkElementsResolved,
    SegmentIndexLoaded { representation_id: String, success: bool },
}

/// Receiving ends of the session channels.
pub struct SessionChannels {
    pub events: Receiver<PlayerEvent>,
    /// Receives at most one error: the first fatal one.
    pub errors: Receiver<PlayerError>,
}

pub struct PlayerSession {
    options: ParamDict,
    clock: SynchronizedUtcClock,
    transport: Arc<dyn HttpTransport>,
    decrypter: Option<Arc<dyn Decrypter>>,
    response_cache: HttpResponseCache,
    entity_cache: EntityCache,
    documents: DocumentStore,
    manifest: Mutex<Option<Arc<Manifest>>>,
    next_download_id: AtomicU64,
    error_reported: AtomicBool,
    errors: Mutex<Sender<PlayerError>>,
    events: Mutex<Sender<PlayerEvent>>,
}

impl PlayerSession {
    pub fn new(
        options: ParamDict,
        transport: Arc<dyn HttpTransport>,
        decrypter: Option<Arc<dyn Decrypter>>,
    ) -> (Arc<Self>, SessionChannels) {
        let (error_sender, errors) = mpsc::channel();
        let (event_sender, events) = mpsc::channel();
        let session = Arc::new(Self {
            response_cache: HttpResponseCache::from_options(&options),
            entity_cache: EntityCache::from_options(&options),
            options,
            clock: SynchronizedUtcClock::new(),
            transport,
            decrypter,
            documents: DocumentStore::new(),
            manifest: Mutex::new(None),
            next_download_id: AtomicU64::new(1),
            error_reported: AtomicBool::new(false),
            errors: Mutex::new(error_sender),
            events: Mutex::new(event_sender),
        });
        (session, SessionChannels { events, errors })
    }

    pub fn options(&self) -> &ParamDict {
        &self.options
    }

    pub fn clock(&self) -> &SynchronizedUtcClock {
        &self.clock
    }

    pub fn transport(&self) -> &dyn HttpTransport {
        self.transport.as_ref()
    }

    pub fn decrypter(&self) -> Option<&Arc<dyn Decrypter>> {
        self.decrypter.as_ref()
    }

    pub fn response_cache(&self) -> &HttpResponseCache {
        &self.response_cache
    }

    pub fn entity_cache(&self) -> &EntityCache {
        &self.entity_cache
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    /// The current manifest snapshot.
    pub fn manifest(&self) -> Option<Arc<Manifest>> {
        self.manifest.lock().unwrap().clone()
    }

    pub(crate) fn set_manifest(&self, manifest: Arc<Manifest>) {
        *self.manifest.lock().unwrap() = Some(manifest);
    }

    pub fn next_download_id(&self) -> u64 {
        self.next_download_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `dash.service_location`: the preferred `BaseURL@serviceLocation`.
    pub fn service_location(&self) -> Option<String> {
        self.options
            .get("dash.service_location")
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }

    /// Reports a fatal error. Only the first one reaches the error channel.
    pub fn post_error(&self, error: PlayerError) {
        if self.error_reported.swap(true, Ordering::SeqCst) {
            tracing::debug!(error = %error, "Suppressing error after the first fatal one");
            return;
        }
        tracing::error!(error = %error, "Playback failed");
        _ = self.errors.lock().unwrap().send(error);
    }

    pub fn has_failed(&self) -> bool {
        self.error_reported.load(Ordering::SeqCst)
    }

    pub fn post_event(&self, event: PlayerEvent) {
        tracing::debug!(?event, "Session event");
        _ = self.events.lock().unwrap().send(event);
    }
}
