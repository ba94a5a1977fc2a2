//! Loads the MPD, keeps it up to date and fetches document fragments referenced from it.
//!
//! All loads run on one worker thread. Requests are queued under the state lock and the worker
//! is woken through a [`WorkSignal`].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::Utc;
use url::Url;

use crate::{
    cache::CachedResponse,
    error::{PlayerError, PlayerResult},
    http::{check_for_retry, fetch_cancellable, HttpRequest, HttpResponse, LoadType},
    mp4::{DefaultBoxCallback, Mp4Parser, SliceReader},
    mpd::{
        apply_xlink, build_manifest, collect_onload_xlinks, BuildOptions, MpdDocument, RemoteLoad,
        Representation, XlinkElement, XlinkResolution, XmlArena, MPD_EVENT_SCHEME,
    },
    session::{PlayerEvent, PlayerSession},
    stream::{EventHandler, InbandEvent},
    time::TimeValue,
    util::{ByteRange, WorkSignal},
};

/// Forced updates are not issued more often than this after the last fetch.
const FORCED_UPDATE_INTERVAL: TimeValue = TimeValue::from_milliseconds(1000);
/// Lower bound for the regular refresh interval.
const MIN_UPDATE_INTERVAL: TimeValue = TimeValue::from_milliseconds(1000);
const IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Due to `MPD@minimumUpdatePeriod`.
    Regular,
    /// The document is known to be outdated, e.g. a segment past its end was requested.
    Forced,
}

#[derive(Debug)]
enum LoadKind {
    Mpd { initial: bool, etag: Option<String> },
    Xlink(XlinkElement),
    SegmentIndex(Weak<Representation>),
}

#[derive(Debug)]
struct LoadRequest {
    url: String,
    range: Option<ByteRange>,
    load_type: LoadType,
    kind: LoadKind,
    attempt: u32,
    execute_at: Instant,
}

impl LoadRequest {
    fn new(url: impl Into<String>, range: Option<ByteRange>, load_type: LoadType, kind: LoadKind) -> Self {
        Self {
            url: url.into(),
            range,
            load_type,
            kind,
            attempt: 0,
            execute_at: Instant::now(),
        }
    }
}

/// A downloaded MPD whose `onLoad` xlinks are still being resolved.
struct PendingDocument {
    arena: XmlArena,
    url: Url,
    etag: Option<String>,
    initial: bool,
    fetch_time: TimeValue,
    unresolved: usize,
    had_xlinks: bool,
}

#[derive(Default)]
struct ReaderState {
    queue: Vec<LoadRequest>,
    manifest_url: Option<Url>,
    update_in_progress: bool,
    /// An update requested while another one was in flight.
    queued_update: Option<UpdateKind>,
    pending_document: Option<PendingDocument>,
    initial_xlinks_resolved: bool,
    worker: Option<JoinHandle<()>>,
}

pub struct PlaylistReader {
    session: Arc<PlayerSession>,
    state: Mutex<ReaderState>,
    signal: WorkSignal,
    terminate: AtomicBool,
}

impl PlaylistReader {
    pub fn new(session: Arc<PlayerSession>) -> Arc<Self> {
        Arc::new(Self {
            session,
            state: Mutex::new(ReaderState::default()),
            signal: WorkSignal::new(),
            terminate: AtomicBool::new(false),
        })
    }

    /// Starts the worker and the initial load of `url`.
    ///
    /// Completion is announced with [`PlayerEvent::ManifestLoaded`], failure through the
    /// session error channel.
    pub fn load_and_parse(self: &Arc<Self>, url: &str) -> PlayerResult<()> {
        let url = Url::parse(url)?;
        let mut state = self.state.lock().unwrap();
        if state.worker.is_none() {
            let reader = self.clone();
            let worker = std::thread::Builder::new()
                .name("playlist-reader".to_string())
                .spawn(move || reader.run())?;
            state.worker = Some(worker);
        }
        tracing::info!(url = %url, "Loading manifest");
        state.manifest_url = Some(url.clone());
        state.update_in_progress = true;
        state.queue.push(LoadRequest::new(
            url,
            None,
            LoadType::Mpd,
            LoadKind::Mpd {
                initial: true,
                etag: None,
            },
        ));
        drop(state);
        self.signal.signal();
        Ok(())
    }

    /// Asks for a refresh of the manifest.
    ///
    /// Only one refresh is in flight at a time. A forced request made meanwhile is carried out
    /// afterwards, a regular one is dropped.
    pub fn request_mpd_update(&self, kind: UpdateKind) {
        let Some(manifest) = self.session.manifest() else {
            return;
        };
        if manifest.is_static() {
            return;
        }
        if kind == UpdateKind::Forced {
            let fetch_time = manifest.fetch_time();
            if fetch_time.is_valid()
                && self.session.clock().now_time() < fetch_time + FORCED_UPDATE_INTERVAL
            {
                return;
            }
        }

        let mut state = self.state.lock().unwrap();
        let Some(url) = state.manifest_url.clone() else {
            return;
        };
        if state.update_in_progress {
            if kind == UpdateKind::Forced {
                state.queued_update = Some(UpdateKind::Forced);
            }
            return;
        }
        tracing::debug!(?kind, url = %url, "Requesting manifest update");
        state.update_in_progress = true;
        state.queue.push(LoadRequest::new(
            url,
            None,
            LoadType::MpdUpdate,
            LoadKind::Mpd {
                initial: false,
                etag: manifest.etag().map(str::to_string),
            },
        ));
        drop(state);
        self.signal.signal();
    }

    /// Queues the segment index loads returned by a segment search.
    pub fn add_segment_index_loads(&self, loads: Vec<RemoteLoad>) {
        if loads.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for load in loads {
            tracing::debug!(url = %load.url, range = ?load.range, "Queueing segment index load");
            state.queue.push(LoadRequest::new(
                load.url,
                load.range,
                LoadType::SegmentIndex,
                LoadKind::SegmentIndex(load.representation),
            ));
        }
        drop(state);
        self.signal.signal();
    }

    /// Stops the worker. Loads in flight are aborted.
    pub fn close(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.signal.signal();
        let worker = self.state.lock().unwrap().worker.take();
        if let Some(worker) = worker {
            if worker.thread().id() != std::thread::current().id() {
                _ = worker.join();
            }
        }
    }

    fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    fn run(self: Arc<Self>) {
        tracing::debug!("Playlist reader started");
        while !self.is_terminating() {
            self.schedule_regular_update();

            let now = Instant::now();
            let due: Vec<LoadRequest> = {
                let mut state = self.state.lock().unwrap();
                let (due, waiting) = std::mem::take(&mut state.queue)
                    .into_iter()
                    .partition(|request| request.execute_at <= now);
                state.queue = waiting;
                due
            };
            for request in due {
                if self.is_terminating() {
                    break;
                }
                self.execute(request);
            }

            let wait = {
                let state = self.state.lock().unwrap();
                state
                    .queue
                    .iter()
                    .map(|request| request.execute_at.saturating_duration_since(Instant::now()))
                    .min()
                    .unwrap_or(IDLE_WAIT)
                    .min(IDLE_WAIT)
            };
            self.signal.wait_timeout(wait);
        }
        tracing::debug!("Playlist reader stopped");
    }

    fn schedule_regular_update(&self) {
        if self.session.has_failed() {
            return;
        }
        let Some(manifest) = self.session.manifest() else {
            return;
        };
        if !manifest.are_updates_expected() {
            return;
        }
        // A zero update period with an inband MPD event stream means the events drive the
        // updates.
        if manifest.minimum_update_period.is_zero() && manifest.has_mpd_event_stream() {
            return;
        }
        let interval = manifest.minimum_update_period.max(MIN_UPDATE_INTERVAL);
        let fetch_time = manifest.fetch_time();
        if fetch_time.is_valid() && self.session.clock().now_time() >= fetch_time + interval {
            self.request_mpd_update(UpdateKind::Regular);
        }
    }

    fn execute(&self, mut request: LoadRequest) {
        let cacheable = matches!(request.kind, LoadKind::Xlink(_) | LoadKind::SegmentIndex(_));
        if cacheable {
            if let Some(cached) = self.session.response_cache().get(&request.url, request.range) {
                tracing::debug!(url = %request.url, "Using cached response");
                self.on_success(request, cached);
                return;
            }
        }

        let mut http = HttpRequest::get(&request.url)
            .with_range(request.range)
            .with_timeouts(request.load_type, self.session.options());
        if let LoadKind::Mpd { etag: Some(etag), .. } = &request.kind {
            http = http.with_header("If-None-Match", etag);
        }

        let before = Utc::now();
        let response = fetch_cancellable(self.session.transport(), http, || self.is_terminating());
        let after = Utc::now();
        if self.is_terminating() {
            return;
        }

        if matches!(request.kind, LoadKind::Mpd { .. }) {
            if let Some(date) = response.header("Date") {
                if let Err(e) = self.session.clock().sync_from_date_header(date, before, after) {
                    tracing::debug!(error = %e, "Ignoring unparsable Date header");
                }
            }
            if response.status() == 304 {
                self.on_not_modified();
                return;
            }
        }

        if !response.is_success() {
            let backoff = check_for_retry(request.load_type, request.attempt, &response.info);
            if backoff >= 0 {
                tracing::warn!(
                    url = %request.url,
                    status = response.status(),
                    error = ?response.info.error,
                    attempt = request.attempt + 1,
                    backoff_ms = backoff,
                    "Load failed, retrying"
                );
                request.attempt += 1;
                request.execute_at = Instant::now() + Duration::from_millis(backoff as u64);
                self.state.lock().unwrap().queue.push(request);
                return;
            }
            self.on_failure(request, &response);
            return;
        }

        if cacheable {
            self.session
                .response_cache()
                .insert_response(&request.url, request.range, &response);
        }
        self.on_success(
            request,
            CachedResponse {
                effective_url: response.info.effective_url,
                headers: response.headers,
                body: response.body,
            },
        );
    }

    fn on_success(&self, request: LoadRequest, response: CachedResponse) {
        match request.kind {
            LoadKind::Mpd { initial, .. } => {
                let etag = response
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("etag"))
                    .map(|(_, value)| value.clone());
                let url = Url::parse(&response.effective_url)
                    .or_else(|_| Url::parse(&request.url));
                let result = url.map_err(PlayerError::from).and_then(|url| {
                    self.on_mpd_loaded(&response.body, url, etag, initial)
                });
                if let Err(e) = result {
                    self.fail_mpd(initial, e);
                }
            }
            LoadKind::Xlink(xlink) => {
                let body = String::from_utf8_lossy(&response.body);
                self.on_xlink_loaded(&xlink, Some(&body));
            }
            LoadKind::SegmentIndex(representation) => {
                let result = parse_segment_index(&response.body);
                self.on_segment_index_loaded(&request.url, request.range, &representation, result);
            }
        }
    }

    fn on_failure(&self, request: LoadRequest, response: &HttpResponse) {
        let error = response.to_error();
        match request.kind {
            LoadKind::Mpd { initial, .. } => {
                self.fail_mpd(
                    initial,
                    PlayerError::ManifestLoadFailed(format!("{}: {error}", request.url)),
                );
            }
            LoadKind::Xlink(xlink) => {
                tracing::warn!(url = %request.url, error = %error, "Xlink load failed");
                self.on_xlink_loaded(&xlink, None);
            }
            LoadKind::SegmentIndex(representation) => {
                self.on_segment_index_loaded(&request.url, request.range, &representation, Err(error));
            }
        }
    }

    fn fail_mpd(&self, initial: bool, error: PlayerError) {
        {
            let mut state = self.state.lock().unwrap();
            state.update_in_progress = false;
            state.queued_update = None;
            state.pending_document = None;
        }
        if !initial {
            tracing::error!(error = %error, "Manifest update failed");
        }
        self.session.post_error(error);
    }

    fn on_not_modified(&self) {
        if let Some(manifest) = self.session.manifest() {
            manifest.set_fetch_time(self.session.clock().now_time());
        }
        tracing::debug!("Manifest not modified");
        self.session.post_event(PlayerEvent::ManifestNotModified);
        self.update_finished();
    }

    fn on_mpd_loaded(&self, body: &[u8], url: Url, etag: Option<String>, initial: bool) -> PlayerResult<()> {
        let text = String::from_utf8_lossy(body);
        let mut arena = XmlArena::parse(&text)?;
        let service_location = self.session.service_location();
        let xlinks = collect_onload_xlinks(&arena, &url, service_location.as_deref())?;

        let mut remote = Vec::new();
        for xlink in xlinks {
            match &xlink.url {
                Some(xlink_url) => remote.push(LoadRequest::new(
                    xlink_url.as_str(),
                    None,
                    LoadType::Xlink,
                    LoadKind::Xlink(xlink.clone()),
                )),
                None => {
                    apply_xlink(&mut arena, &xlink, None);
                }
            }
        }

        let document = PendingDocument {
            arena,
            url,
            etag,
            initial,
            fetch_time: self.session.clock().now_time(),
            unresolved: remote.len(),
            had_xlinks: !remote.is_empty(),
        };
        if remote.is_empty() {
            self.finish_document(document);
        } else {
            tracing::debug!(count = remote.len(), "Resolving xlink elements");
            let mut state = self.state.lock().unwrap();
            state.pending_document = Some(document);
            state.queue.extend(remote);
            drop(state);
            self.signal.signal();
        }
        Ok(())
    }

    fn on_xlink_loaded(&self, xlink: &XlinkElement, body: Option<&str>) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            let Some(document) = state.pending_document.as_mut() else {
                return;
            };
            let resolution = apply_xlink(&mut document.arena, xlink, body);
            if resolution != XlinkResolution::KeptOriginal {
                tracing::debug!(href = %xlink.href, ?resolution, "Xlink element resolved");
            }
            document.unresolved = document.unresolved.saturating_sub(1);
            if document.unresolved == 0 {
                state.pending_document.take()
            } else {
                None
            }
        };
        if let Some(document) = finished {
            self.finish_document(document);
        }
    }

    fn finish_document(&self, pending: PendingDocument) {
        let documents = self.session.documents();
        let document = Arc::new(MpdDocument::new(
            documents.next_generation(),
            pending.arena,
            pending.url,
            pending.etag,
        ));
        let options = BuildOptions {
            allow_content_protection: self.session.decrypter().is_some(),
        };
        let manifest = match build_manifest(document.clone(), &options) {
            Ok(manifest) => Arc::new(manifest),
            Err(e) => {
                self.fail_mpd(pending.initial, e);
                return;
            }
        };
        manifest.set_fetch_time(pending.fetch_time);
        let generation = manifest.generation();
        documents.publish(document);
        self.session.set_manifest(manifest.clone());

        let first_xlink_completion = {
            let mut state = self.state.lock().unwrap();
            if let Some(location) = &manifest.location {
                state.manifest_url = Some(location.clone());
            }
            !std::mem::replace(&mut state.initial_xlinks_resolved, true)
        };

        if pending.initial {
            if !manifest.utc_timings.is_empty() {
                if let Err(e) = self
                    .session
                    .clock()
                    .sync_from_utc_timing(&manifest.utc_timings, self.session.transport())
                {
                    tracing::warn!(error = %e, "Could not synchronize with any UTCTiming source");
                }
            }
            tracing::info!(
                generation,
                periods = manifest.periods.len(),
                presentation_type = ?manifest.presentation_type,
                "Manifest loaded"
            );
        } else {
            tracing::debug!(generation, "Manifest updated");
        }
        if first_xlink_completion {
            if pending.had_xlinks {
                tracing::debug!("Initial xlink elements resolved");
            }
            self.session.post_event(PlayerEvent::InitialXlinkElementsResolved);
        }
        self.session.post_event(if pending.initial {
            PlayerEvent::ManifestLoaded { generation }
        } else {
            PlayerEvent::ManifestUpdated { generation }
        });
        self.update_finished();
    }

    fn update_finished(&self) {
        let queued = {
            let mut state = self.state.lock().unwrap();
            state.update_in_progress = false;
            state.queued_update.take()
        };
        if let Some(kind) = queued {
            self.request_mpd_update(kind);
        }
    }

    fn on_segment_index_loaded(
        &self,
        url: &str,
        range: Option<ByteRange>,
        representation: &Weak<Representation>,
        result: PlayerResult<crate::mp4::SegmentIndex>,
    ) {
        let success = match result {
            Ok(sidx) => {
                tracing::debug!(url, references = sidx.references.len(), "Segment index loaded");
                self.session
                    .entity_cache()
                    .put_segment_index(url, range, Arc::new(sidx));
                true
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "Segment index load failed");
                false
            }
        };
        // The representation is gone if the manifest has been replaced meanwhile.
        if let Some(representation) = representation.upgrade() {
            representation.segment_index_loaded(success);
            self.session.post_event(PlayerEvent::SegmentIndexLoaded {
                representation_id: representation.id.clone(),
                success,
            });
        }
    }
}

fn parse_segment_index(body: &[u8]) -> PlayerResult<crate::mp4::SegmentIndex> {
    let mut parser = Mp4Parser::new();
    let mut reader = SliceReader::new(body.to_vec());
    parser.parse_header(&mut reader, &mut DefaultBoxCallback)?;
    parser
        .segment_index()
        .cloned()
        .ok_or_else(|| PlayerError::Mp4Parsing("No sidx box in the segment index".into()))
}

impl EventHandler for PlaylistReader {
    fn on_inband_event(&self, period_id: &str, event: &InbandEvent) {
        if event.scheme_id_uri == MPD_EVENT_SCHEME {
            tracing::debug!(period = %period_id, value = %event.value, "MPD validity event");
            self.request_mpd_update(UpdateKind::Forced);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Receiver;

    use bytes::Bytes;

    use super::*;
    use crate::{
        http::{StaticResponse, StaticTransport},
        params::ParamDict,
    };

    const STATIC_MPD: &str = r#"<MPD type="static" minBufferTime="PT2S" mediaPresentationDuration="PT10S" xmlns:xlink="http://www.w3.org/1999/xlink">
      <Period id="p0" duration="PT10S" xlink:href="period.xml" xlink:actuate="onLoad"/>
    </MPD>"#;

    const REMOTE_PERIOD: &str = r#"<Period id="remote" duration="PT10S">
      <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
        <SegmentBase indexRange="0-55"><Initialization range="0-0"/></SegmentBase>
        <BaseURL>video.mp4</BaseURL>
        <Representation id="v1" bandwidth="500000" codecs="avc1.64001f"/>
      </AdaptationSet>
    </Period>"#;

    fn wait_for(events: &Receiver<PlayerEvent>, wanted: impl Fn(&PlayerEvent) -> bool) -> PlayerEvent {
        loop {
            let event = events
                .recv_timeout(Duration::from_secs(5))
                .expect("event not received in time");
            if wanted(&event) {
                return event;
            }
        }
    }

    /// A `sidx` with two one second references of 1000 and 2000 bytes.
    fn sidx_box() -> Bytes {
        let mut payload = vec![0u8, 0, 0, 0];
        payload.extend_from_slice(&1u32.to_be_bytes()); // reference_ID
        payload.extend_from_slice(&1000u32.to_be_bytes()); // timescale
        payload.extend_from_slice(&0u32.to_be_bytes()); // earliest_presentation_time
        payload.extend_from_slice(&0u32.to_be_bytes()); // first_offset
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&2u16.to_be_bytes());
        for size in [1000u32, 2000] {
            payload.extend_from_slice(&size.to_be_bytes());
            payload.extend_from_slice(&1000u32.to_be_bytes());
            payload.extend_from_slice(&0x9000_0000u32.to_be_bytes());
        }
        let mut data = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(b"sidx");
        data.extend_from_slice(&payload);
        Bytes::from(data)
    }

    #[test]
    fn test_xlink_and_segment_index_loads() {
        let transport = Arc::new(StaticTransport::new());
        transport.route("http://localhost/a/manifest.mpd", StaticResponse::ok(STATIC_MPD));
        transport.route("http://localhost/a/period.xml", StaticResponse::ok(REMOTE_PERIOD));
        transport.route("http://localhost/a/video.mp4", StaticResponse::ok(sidx_box()));
        let (session, channels) = PlayerSession::new(ParamDict::new(), transport.clone(), None);

        let reader = PlaylistReader::new(session.clone());
        reader.load_and_parse("http://localhost/a/manifest.mpd").unwrap();
        wait_for(&channels.events, |e| matches!(e, PlayerEvent::ManifestLoaded { .. }));

        let manifest = session.manifest().unwrap();
        assert_eq!(manifest.periods.len(), 1);
        assert_eq!(manifest.periods[0].id, "remote");

        let representation = manifest.periods[0].adaptation_sets[0].representations[0].clone();
        let options = crate::mpd::SearchOptions {
            period_local_time: TimeValue::zero(),
            period_duration: TimeValue::from_seconds(10.0),
            has_following_period: false,
            search_type: crate::mpd::SearchType::Closest,
        };
        let crate::mpd::SearchResult::NeedElement(loads) = representation.find_segment(&session, &options) else {
            panic!("segment index should be required first");
        };
        reader.add_segment_index_loads(loads);
        let event = wait_for(&channels.events, |e| matches!(e, PlayerEvent::SegmentIndexLoaded { .. }));
        assert_eq!(
            event,
            PlayerEvent::SegmentIndexLoaded {
                representation_id: "v1".to_string(),
                success: true
            }
        );

        let crate::mpd::SearchResult::Found(segment) = representation.find_segment(&session, &options) else {
            panic!("segment expected after the index load");
        };
        assert_eq!(segment.media_range, Some(ByteRange::new(56, Some(1000))));
        reader.close();
        assert!(channels.errors.try_recv().is_err());
    }

    #[test]
    fn test_initial_load_failure_is_reported_once() {
        let transport = Arc::new(StaticTransport::new());
        transport.route("http://localhost/missing.mpd", StaticResponse::status(404));
        let (session, channels) = PlayerSession::new(ParamDict::new(), transport.clone(), None);

        let reader = PlaylistReader::new(session);
        reader.load_and_parse("http://localhost/missing.mpd").unwrap();
        let error = channels.errors.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(error, PlayerError::ManifestLoadFailed(_)));
        // 404 is not retried for the initial load.
        assert_eq!(transport.request_count("http://localhost/missing.mpd"), 1);
        reader.close();
    }
}
