//! Per-stream segment download and demuxing.
//!
//! A [`StreamHandler`] owns one worker thread that executes one [`StreamSegmentRequest`] at a
//! time: it loads the initialization segment, waits for the segment to become available, streams
//! the media segment through the MP4 parser and hands the resulting access units to the sink.
//! Download progress is reported to the [`StreamSelector`], which may abort the transfer.

mod events;
mod filler;

use std::{
    cell::RefCell,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes};

pub use events::{EventHandler, InbandEvent, MISSED_EVENT_VALUE};
use events::{missed_mpd_event, EventTracker};
use filler::{filler_access_units, filler_duration};

use crate::{
    abr::{ProgressDecision, StreamSelector},
    drm::{DecrypterState, SampleEncryptionInfo},
    error::{PlayerError, PlayerResult},
    http::{check_for_retry, fetch_cancellable, HttpEvent, HttpHandle, HttpRequest, HttpResponse, LoadType},
    mp4::{
        BoxReader, DefaultBoxCallback, EventMessage, FourCC, InitSegment, Mp4Parser, ParseStatus, Pssh, Sample,
        TrackInfo,
    },
    mpd::MPD_EVENT_SCHEME,
    request::{CancelFlag, CancelReason, DownloadStats, FailureKind, StreamSegmentRequest},
    session::PlayerSession,
    sink::{AccessUnit, AccessUnitSink, DropFlags},
    time::{TimeFraction, TimeValue},
    util::WorkSignal,
    StreamType,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Notifications of a [`StreamHandler`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The first access unit of the current request reached the sink.
    DataReceived {
        stream_type: StreamType,
        representation_id: String,
    },
    /// The request finished. Its `stats` tell how.
    SegmentCompleted(Box<StreamSegmentRequest>),
}

pub struct StreamHandler {
    shared: Arc<HandlerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct HandlerShared {
    session: Arc<PlayerSession>,
    stream_type: StreamType,
    sink: Arc<dyn AccessUnitSink>,
    selector: Arc<StreamSelector>,
    event_handler: Option<Arc<dyn EventHandler>>,
    cancel: CancelFlag,
    signal: WorkSignal,
    pending: Mutex<Option<StreamSegmentRequest>>,
    busy: AtomicBool,
    events: Mutex<Sender<StreamEvent>>,
    tracker: Mutex<EventTracker>,
}

impl StreamHandler {
    /// Starts the worker thread of a handler for `stream_type`.
    pub fn new(
        session: Arc<PlayerSession>,
        stream_type: StreamType,
        sink: Arc<dyn AccessUnitSink>,
        selector: Arc<StreamSelector>,
        event_handler: Option<Arc<dyn EventHandler>>,
    ) -> PlayerResult<(Self, Receiver<StreamEvent>)> {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(HandlerShared {
            session,
            stream_type,
            sink,
            selector,
            event_handler,
            cancel: CancelFlag::new(),
            signal: WorkSignal::new(),
            pending: Mutex::new(None),
            busy: AtomicBool::new(false),
            events: Mutex::new(sender),
            tracker: Mutex::new(EventTracker::default()),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("stream-{stream_type}"))
                .spawn(move || shared.run())?
        };
        Ok((
            Self {
                shared,
                worker: Mutex::new(Some(worker)),
            },
            receiver,
        ))
    }

    pub fn stream_type(&self) -> StreamType {
        self.shared.stream_type
    }

    /// Queues `request`. Only one request is processed at a time.
    pub fn add_request(&self, request: StreamSegmentRequest) -> PlayerResult<()> {
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PlayerError::HandlerBusy);
        }
        self.shared.cancel.reset();
        *self.shared.pending.lock().unwrap() = Some(request);
        self.shared.signal.signal();
        Ok(())
    }

    /// Stops the current request. A silent cancellation suppresses the completion event.
    pub fn cancel(&self, silent: bool) {
        if self.is_idle() {
            return;
        }
        self.shared.cancel.set(if silent {
            CancelReason::Silent
        } else {
            CancelReason::Canceled
        });
        self.shared.signal.signal();
    }

    pub fn is_idle(&self) -> bool {
        !self.shared.busy.load(Ordering::Acquire)
    }

    /// Cancels any work and joins the worker thread.
    pub fn close(&self) {
        self.shared.cancel.set(CancelReason::Terminate);
        self.shared.signal.signal();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                tracing::error!(stream = %self.shared.stream_type, "Stream handler thread panicked");
            }
        }
    }
}

impl Drop for StreamHandler {
    fn drop(&mut self) {
        self.close();
    }
}

impl HandlerShared {
    fn run(&self) {
        loop {
            self.signal.wait_timeout(POLL_INTERVAL);
            if self.cancel.get() == CancelReason::Terminate {
                break;
            }
            let Some(request) = self.pending.lock().unwrap().take() else {
                continue;
            };

            let request = self.process(request);
            let reason = self.cancel.get();
            self.busy.store(false, Ordering::Release);
            match reason {
                CancelReason::Terminate => break,
                CancelReason::Silent => {
                    tracing::debug!(stream = %self.stream_type, "Request canceled silently");
                }
                _ => {
                    _ = self
                        .events
                        .lock()
                        .unwrap()
                        .send(StreamEvent::SegmentCompleted(Box::new(request)));
                }
            }
        }
        tracing::debug!(stream = %self.stream_type, "Stream handler stopped");
    }

    fn process(&self, mut request: StreamSegmentRequest) -> StreamSegmentRequest {
        let mut stats = DownloadStats::for_request(&request, self.session.next_download_id());
        stats.request_start = self.session.clock().now_time();
        if request.is_eos_segment {
            stats.was_successful = true;
            request.stats = stats;
            return request;
        }

        let stats = RefCell::new(stats);
        SegmentDownload::new(self, &mut request, &stats).run();
        let stats = stats.into_inner();
        self.selector.report_download_end(&stats);
        request.stats = stats;
        request
    }

    /// Whether the handler was told to stop, as opposed to an abort by the stream selector.
    fn is_stopped(&self) -> bool {
        matches!(
            self.cancel.get(),
            CancelReason::Terminate | CancelReason::Canceled | CancelReason::Silent
        )
    }

    /// Sleeps up to `duration`, returning `false` early on cancellation.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_set() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }

    fn update_decrypter(&self, pssh: &[Pssh]) {
        let Some(decrypter) = self.session.decrypter() else {
            return;
        };
        if pssh.is_empty() {
            return;
        }
        let boxes: Vec<Bytes> = pssh.iter().map(|p| p.raw.clone()).collect();
        if let Err(e) = decrypter.update_init_data_from_multiple_pssh(&boxes) {
            tracing::warn!(error = %e, "Decrypter rejected the protection data");
        }
    }
}

#[derive(Debug)]
struct Failure {
    kind: FailureKind,
    reason: String,
}

impl Failure {
    fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// State of one request on the worker thread.
struct SegmentDownload<'a> {
    shared: &'a HandlerShared,
    request: &'a mut StreamSegmentRequest,
    stats: &'a RefCell<DownloadStats>,
    /// Access units held back until the segment is complete or partial data may be emitted.
    pending: Vec<AccessUnit>,
    /// Track description of the segment, once known.
    init: Option<Arc<InitSegment>>,
    last_end: TimeValue,
    last_duration: TimeValue,
    seen_too_late: bool,
    saw_mpd_event: bool,
    reported_data: bool,
}

impl<'a> SegmentDownload<'a> {
    fn new(
        shared: &'a HandlerShared,
        request: &'a mut StreamSegmentRequest,
        stats: &'a RefCell<DownloadStats>,
    ) -> Self {
        Self {
            shared,
            request,
            stats,
            pending: Vec::new(),
            init: None,
            last_end: TimeValue::invalid(),
            last_duration: TimeValue::invalid(),
            seen_too_late: false,
            saw_mpd_event: false,
            reported_data: false,
        }
    }

    fn run(mut self) {
        if self.request.insert_filler || self.request.segment.is_missing {
            self.init = self.cached_init_segment();
        }
        if self.request.insert_filler {
            tracing::debug!(url = %self.request.segment.media_url, "Filling segment");
            self.fill_remaining();
            let mut stats = self.stats.borrow_mut();
            stats.was_successful = !self.shared.is_stopped();
            stats.inserted_filler = true;
            return;
        }
        if self.request.segment.is_missing {
            tracing::debug!(url = %self.request.segment.media_url, "Segment is known to be missing");
            self.insert_missing_segment();
            self.stats.borrow_mut().was_successful = !self.shared.is_stopped();
            return;
        }
        let result = self.download();
        self.conclude(result);
    }

    fn download(&mut self) -> Result<(), Failure> {
        let init = self.load_init_segment()?;
        self.init = init.clone();
        if !self.wait_for_availability() {
            return Ok(());
        }
        self.download_media(init)
    }

    fn cached_init_segment(&self) -> Option<Arc<InitSegment>> {
        let segment = &self.request.segment;
        let url = segment.init_url.as_ref()?;
        self.shared
            .session
            .entity_cache()
            .get_init_segment(url, segment.init_range)
    }

    fn load_init_segment(&mut self) -> Result<Option<Arc<InitSegment>>, Failure> {
        let segment = &self.request.segment;
        let Some(url) = segment.init_url.clone().filter(|_| segment.is_init_segment_required) else {
            return Ok(None);
        };
        let range = segment.init_range;
        let session = &self.shared.session;
        if let Some(init) = session.entity_cache().get_init_segment(&url, range) {
            return Ok(Some(init));
        }

        let mut attempt = 0;
        let response = loop {
            let mut request = HttpRequest::get(url.clone())
                .with_range(range)
                .with_timeouts(LoadType::Segment, session.options());
            for (name, value) in &segment.custom_headers {
                request = request.with_header(name.clone(), value.clone());
            }
            let response = fetch_cancellable(session.transport(), request, || self.shared.cancel.is_set());
            if response.is_success() {
                break response;
            }
            let delay = check_for_retry(LoadType::Segment, attempt, &response.info);
            if delay < 0 || self.shared.cancel.is_set() {
                return Err(Failure::new(
                    FailureKind::InitSegmentDownload,
                    response.to_error().to_string(),
                ));
            }
            tracing::debug!(%url, attempt, delay, "Retrying init segment");
            attempt += 1;
            if !self.shared.sleep(Duration::from_millis(delay as u64)) {
                return Err(Failure::new(FailureKind::InitSegmentDownload, "Canceled"));
            }
        };

        let init = InitSegment::parse(response.body)
            .map_err(|e| Failure::new(FailureKind::InitSegmentParse, e.to_string()))?;
        if init.tracks.len() != 1 {
            return Err(Failure::new(
                FailureKind::InitSegmentParse,
                format!("Expected exactly one track, found {}", init.tracks.len()),
            ));
        }
        let init = Arc::new(init);
        session.entity_cache().put_init_segment(&url, range, init.clone());
        self.shared.update_decrypter(&init.pssh);
        Ok(Some(init))
    }

    /// Blocks until the segment availability start time. Returns `false` on cancellation.
    fn wait_for_availability(&self) -> bool {
        let asast = self.request.asast;
        if !asast.is_valid() {
            return true;
        }
        let clock = self.shared.session.clock();
        loop {
            if self.shared.cancel.is_set() {
                return false;
            }
            let now = clock.now_time();
            if now >= asast {
                return true;
            }
            thread::sleep((asast - now).min(TimeValue::from(POLL_INTERVAL)).std_duration());
        }
    }

    fn download_media(&mut self, init: Option<Arc<InitSegment>>) -> Result<(), Failure> {
        let session = &self.shared.session;
        let segment = &self.request.segment;
        let mut request = HttpRequest::get(segment.media_url.clone())
            .with_range(segment.media_range)
            .with_streaming(true)
            .with_timeouts(LoadType::Segment, session.options());
        for (name, value) in &segment.custom_headers {
            request = request.with_header(name.clone(), value.clone());
        }
        let handle = session.transport().start(request);
        let mut stream = SegmentStream::new(self.shared, self.stats, handle, &segment.media_url);

        let mut parser = Mp4Parser::new();
        let demuxed = self.demux(&mut stream, &mut parser, init);
        if demuxed.is_err() {
            stream.abort();
        }
        let response = stream.finish();
        if parser.brands().contains(&FourCC::BRAND_LMSG) {
            self.request.segment.saw_lmsg = true;
        }
        if self.shared.cancel.is_set() {
            return Ok(());
        }

        if !response.is_success() {
            let status = response.status();
            if self.request.segment.may_be_missing && matches!(status, 404 | 416) {
                self.insert_missing_segment();
                return Ok(());
            }
            if status == 404 && self.request.asast.is_valid() {
                self.stats.borrow_mut().availability_delay =
                    self.shared.session.clock().now_time() - self.request.asast;
            }
            return Err(Failure::new(FailureKind::MediaDownload, response.to_error().to_string()));
        }
        if let Some(error) = &response.info.error {
            return Err(Failure::new(FailureKind::MediaDownload, error.clone()));
        }
        demuxed
    }

    fn demux(
        &mut self,
        stream: &mut SegmentStream<'_>,
        parser: &mut Mp4Parser,
        mut init: Option<Arc<InitSegment>>,
    ) -> Result<(), Failure> {
        let media_parse = |e: PlayerError| Failure::new(FailureKind::MediaParse, e.to_string());
        loop {
            let remaining = match parser.parse_header(stream, &mut DefaultBoxCallback).map_err(media_parse)? {
                ParseStatus::EndOfStream => return Ok(()),
                ParseStatus::Stopped { box_type, remaining } if box_type == FourCC::MDAT => remaining,
                ParseStatus::Stopped { .. } => continue,
            };

            if init.is_none() {
                init = parser.take_init_segment().map(Arc::new);
                self.init = init.clone();
            }
            let pssh = parser.take_pssh();
            self.shared.update_decrypter(&pssh);
            self.handle_events(parser.events());

            let Some(init) = init.clone() else {
                return Err(Failure::new(
                    FailureKind::InitSegmentParse,
                    "No track information for the media segment",
                ));
            };
            let Some(track) = init.tracks.first() else {
                return Err(Failure::new(FailureKind::InitSegmentParse, "Init segment has no track"));
            };
            let trex = init.track_extends(track.track_id);

            let mdat_start = stream.current_offset();
            for fragment in parser.fragments() {
                for sample in fragment.samples(track, trex).map_err(media_parse)? {
                    if self.shared.cancel.is_set() {
                        return Ok(());
                    }
                    let mut data = read_sample(stream, &sample)?;
                    self.decrypt(track, &sample, &mut data)?;
                    if let Some(au) = self.access_unit(track, &sample, Bytes::from(data)) {
                        self.stats.borrow_mut().duration_downloaded += au.duration;
                        if !self.emit(au) {
                            return Ok(());
                        }
                    }
                }
            }

            let consumed = stream.current_offset() - mdat_start;
            match remaining {
                Some(size) if size > consumed => {
                    stream.skip(size - consumed).map_err(media_parse)?;
                }
                Some(_) => {}
                None => while stream.skip(u32::MAX as u64).map_err(media_parse)? > 0 {},
            }
        }
    }

    fn decrypt(&self, track: &TrackInfo, sample: &Sample, data: &mut [u8]) -> Result<(), Failure> {
        let (Some(entry), Some(encryption)) = (&sample.encryption, &track.encryption) else {
            return Ok(());
        };
        if !encryption.is_protected {
            return Ok(());
        }
        let Some(decrypter) = self.shared.session.decrypter() else {
            return Err(Failure::new(FailureKind::Decryption, "Encrypted sample but no decrypter"));
        };
        loop {
            match decrypter.state() {
                DecrypterState::Ready => break,
                DecrypterState::Error => {
                    return Err(Failure::new(
                        FailureKind::Decryption,
                        decrypter
                            .last_error_message()
                            .unwrap_or_else(|| "Decrypter failed".to_string()),
                    ))
                }
                DecrypterState::Idle | DecrypterState::WaitingForKey => {
                    if !self.shared.sleep(POLL_INTERVAL) {
                        return Err(Failure::new(FailureKind::Decryption, "Canceled while waiting for a key"));
                    }
                }
            }
        }
        let info = SampleEncryptionInfo {
            scheme: encryption.scheme.unwrap_or(FourCC::SCHEME_CENC),
            key_id: encryption.default_kid,
            iv: entry.iv.clone(),
            subsamples: entry.subsamples.clone(),
            crypt_byte_block: encryption.crypt_byte_block,
            skip_byte_block: encryption.skip_byte_block,
        };
        decrypter
            .decrypt_in_place(data, &info)
            .map_err(|e| Failure::new(FailureKind::Decryption, e.to_string()))
    }

    /// Converts a sample to an access unit on the presentation timeline. Returns `None` for
    /// samples past the first one that is too late.
    fn access_unit(&mut self, track: &TrackInfo, sample: &Sample, data: Bytes) -> Option<AccessUnit> {
        let timescale = self.request.segment.timescale;
        if track.timescale != timescale && !self.request.warned_about_timescale {
            tracing::warn!(
                track = track.track_id,
                track_timescale = track.timescale,
                mpd_timescale = timescale,
                "Track timescale differs from the MPD, rescaling"
            );
            self.request.warned_about_timescale = true;
        }
        let segment = &self.request.segment;
        let rescale = |value: i64| TimeFraction::new(value, track.timescale).get_as_timebase(timescale as u64);
        let pts = rescale(sample.pts);
        let dts = rescale(sample.dts);
        let duration = rescale(sample.duration as i64);

        let mut drop_flags = DropFlags::default();
        if pts + duration - segment.first_au_time <= 0 {
            drop_flags.insert(DropFlags::PTS_TOO_EARLY);
        }
        if dts + duration - segment.first_au_time <= 0 {
            drop_flags.insert(DropFlags::DTS_TOO_EARLY);
        }
        let mut is_last_in_period = false;
        if segment.is_last_in_period {
            if pts >= segment.last_au_time {
                drop_flags.insert(DropFlags::PTS_TOO_LATE);
            }
            if dts >= segment.last_au_time {
                drop_flags.insert(DropFlags::DTS_TOO_LATE);
            }
            if drop_flags.is_too_late() {
                if self.seen_too_late {
                    return None;
                }
                self.seen_too_late = true;
                is_last_in_period = true;
            }
        }

        let base = self.request.period_start + self.request.timestamp_offset;
        let to_time = |value: i64| base + TimeFraction::new(value - segment.pto, timescale).as_time_value();
        Some(AccessUnit {
            stream_type: self.request.stream_type,
            dts: to_time(dts),
            pts: to_time(pts),
            duration: TimeFraction::new(duration, timescale).as_time_value(),
            data,
            is_sync_sample: sample.is_sync,
            is_dummy_data: false,
            is_last_in_period,
            drop_flags,
            period_id: self.request.period_id.clone(),
            representation_id: self.request.representation_id.clone(),
            bitrate: self.request.bitrate,
            playback_sequence_id: self.request.playback_sequence_id,
        })
    }

    fn handle_events(&mut self, messages: &[EventMessage]) {
        if messages.is_empty() {
            return;
        }
        if messages.iter().any(|m| m.scheme_id_uri == MPD_EVENT_SCHEME) {
            self.saw_mpd_event = true;
        }
        let events = self.shared.tracker.lock().unwrap().collect(self.request, messages);
        if let Some(handler) = &self.shared.event_handler {
            for event in &events {
                handler.on_inband_event(&self.request.period_id, event);
            }
        }
    }

    /// Queues or delivers `au`, depending on whether partial data may be emitted.
    fn emit(&mut self, au: AccessUnit) -> bool {
        let end = au.pts + au.duration;
        self.last_end = if self.last_end.is_valid() { self.last_end.max(end) } else { end };
        self.last_duration = au.duration;
        if !self.stats.borrow().emit_partial_data {
            self.pending.push(au);
            return true;
        }
        self.flush_pending() && self.deliver(au)
    }

    fn flush_pending(&mut self) -> bool {
        for au in mem::take(&mut self.pending) {
            if !self.deliver(au) {
                return false;
            }
        }
        true
    }

    /// Pushes `au` into the sink, waiting while the sink is full.
    fn deliver(&mut self, mut au: AccessUnit) -> bool {
        let duration = au.duration;
        let end = au.pts + au.duration;
        loop {
            match self.shared.sink.push(au) {
                Ok(()) => break,
                Err(rejected) => {
                    if self.shared.is_stopped() {
                        return false;
                    }
                    thread::sleep(POLL_INTERVAL);
                    au = rejected;
                }
            }
        }
        {
            let mut stats = self.stats.borrow_mut();
            stats.duration_delivered += duration;
            if !stats.delivered_until.is_valid() || end > stats.delivered_until {
                stats.delivered_until = end;
            }
        }
        if !self.reported_data {
            self.reported_data = true;
            _ = self.shared.events.lock().unwrap().send(StreamEvent::DataReceived {
                stream_type: self.request.stream_type,
                representation_id: self.request.representation_id.clone(),
            });
        }
        true
    }

    /// Media time `value` of the segment on the presentation timeline.
    fn presentation_time(&self, value: i64) -> TimeValue {
        let segment = &self.request.segment;
        self.request.period_start
            + self.request.timestamp_offset
            + TimeFraction::new(value - segment.pto, segment.timescale).as_time_value()
    }

    /// Fills the segment with dummy access units from the end of the last access unit, or
    /// the first wanted time, to the end of the segment.
    fn fill_remaining(&mut self) -> bool {
        let segment = &self.request.segment;
        let from = if self.last_end.is_valid() {
            self.last_end
        } else {
            self.request
                .start_time()
                .max(self.presentation_time(segment.first_au_time))
        };
        let mut to = self.request.end_time();
        if segment.is_last_in_period {
            to = to.min(self.presentation_time(segment.last_au_time));
        }
        let track = self.init.as_ref().and_then(|init| init.tracks.first());
        let duration = filler_duration(self.request, track, self.last_duration);
        let units = filler_access_units(self.request, from, to, duration);
        tracing::debug!(count = units.len(), %from, %to, "Inserting filler");
        self.stats.borrow_mut().inserted_filler = true;
        for au in units {
            self.last_end = au.pts + au.duration;
            if !self.deliver(au) {
                return false;
            }
        }
        true
    }

    fn insert_missing_segment(&mut self) {
        tracing::info!(url = %self.request.segment.media_url, "Segment is missing, inserting filler");
        self.request.segment.is_missing = true;
        {
            let mut stats = self.stats.borrow_mut();
            stats.is_missing_segment = true;
            stats.http_status = 200;
            if self.request.asast.is_valid() {
                stats.availability_delay = self.shared.session.clock().now_time() - self.request.asast;
            }
        }
        self.pending.clear();
        self.fill_remaining();
    }

    fn conclude(&mut self, result: Result<(), Failure>) {
        match self.shared.cancel.get() {
            CancelReason::None => match result {
                Ok(()) => {
                    if self.flush_pending() {
                        self.stats.borrow_mut().was_successful = true;
                    }
                }
                Err(failure) => {
                    tracing::warn!(
                        url = %self.request.segment.media_url,
                        kind = ?failure.kind,
                        reason = %failure.reason,
                        "Segment download failed"
                    );
                    self.pending.clear();
                    self.stats.borrow_mut().fail(failure.kind, failure.reason);
                    self.report_missed_event();
                }
            },
            CancelReason::AbortedByAbr => {
                self.pending.clear();
                {
                    let mut stats = self.stats.borrow_mut();
                    stats.was_aborted = true;
                    stats.fail(FailureKind::AbortedByAbr, "Aborted by ABR");
                }
                self.report_missed_event();
            }
            CancelReason::Terminate | CancelReason::Canceled | CancelReason::Silent => {
                self.pending.clear();
                let mut stats = self.stats.borrow_mut();
                stats.was_aborted = true;
                stats.failure_reason = Some("Canceled".to_string());
            }
        }
    }

    fn report_missed_event(&self) {
        if self.saw_mpd_event {
            return;
        }
        let (Some(handler), Some(event)) = (&self.shared.event_handler, missed_mpd_event(self.request)) else {
            return;
        };
        tracing::debug!(period = %self.request.period_id, "MPD validity event may have been missed");
        handler.on_inband_event(&self.request.period_id, &event);
    }
}

fn read_sample(stream: &mut SegmentStream<'_>, sample: &Sample) -> Result<Vec<u8>, Failure> {
    let media_parse = |e: PlayerError| Failure::new(FailureKind::MediaParse, e.to_string());
    let offset = stream.current_offset();
    if sample.file_offset < offset {
        return Err(Failure::new(
            FailureKind::MediaParse,
            format!("Sample at offset {} lies before offset {offset}", sample.file_offset),
        ));
    }
    let gap = sample.file_offset - offset;
    if gap > 0 && stream.skip(gap).map_err(media_parse)? != gap {
        return Err(Failure::new(FailureKind::MediaParse, "Truncated mdat"));
    }
    let mut data = vec![0u8; sample.size as usize];
    if stream.read_data(&mut data).map_err(media_parse)? != data.len() {
        return Err(Failure::new(FailureKind::MediaParse, "Truncated sample"));
    }
    Ok(data)
}

/// [`BoxReader`] over a streamed HTTP response. Waiting for data reports the download progress
/// to the stream selector.
struct SegmentStream<'a> {
    shared: &'a HandlerShared,
    stats: &'a RefCell<DownloadStats>,
    handle: HttpHandle,
    url: String,
    chunk: Bytes,
    offset: u64,
    response: Option<HttpResponse>,
    started: Instant,
    bytes: u64,
    first_byte: Option<Duration>,
}

impl<'a> SegmentStream<'a> {
    fn new(shared: &'a HandlerShared, stats: &'a RefCell<DownloadStats>, handle: HttpHandle, url: &str) -> Self {
        Self {
            shared,
            stats,
            handle,
            url: url.to_string(),
            chunk: Bytes::new(),
            offset: 0,
            response: None,
            started: Instant::now(),
            bytes: 0,
            first_byte: None,
        }
    }

    /// Makes data available in `chunk`. Returns `false` at the end of the data.
    fn fill(&mut self) -> bool {
        while self.chunk.is_empty() {
            if self.response.is_some() {
                return false;
            }
            self.wait_for_event();
        }
        true
    }

    fn wait_for_event(&mut self) {
        if self.shared.cancel.is_set() {
            self.abort();
            return;
        }
        match self.handle.recv_timeout(POLL_INTERVAL) {
            Ok(HttpEvent::Data(data)) => {
                self.bytes += data.len() as u64;
                let elapsed = self.started.elapsed();
                self.first_byte.get_or_insert(elapsed);
                self.chunk = data;
                self.report_progress();
            }
            Ok(HttpEvent::Completed(response)) => self.response = Some(response),
            Err(RecvTimeoutError::Timeout) => self.report_progress(),
            Err(RecvTimeoutError::Disconnected) => {
                self.response = Some(HttpResponse::failed(&self.url, "transport dropped the request"));
            }
        }
    }

    fn report_progress(&mut self) {
        if self.shared.cancel.is_set() {
            return;
        }
        let decision = {
            let mut stats = self.stats.borrow_mut();
            stats.bytes_downloaded = self.bytes;
            stats.time_to_first_byte = self.first_byte.unwrap_or_default();
            stats.time_to_download = self.started.elapsed();
            self.shared
                .selector
                .set_buffer_level(self.shared.stream_type, self.shared.sink.buffered_duration());
            let decision = self.shared.selector.report_download_progress(&stats);
            match decision {
                ProgressDecision::Continue => {}
                ProgressDecision::EmitPartialData => stats.emit_partial_data = true,
                ProgressDecision::Abort { insert_filler } => stats.abort_with_filler = insert_filler,
            }
            decision
        };
        if let ProgressDecision::Abort { .. } = decision {
            self.shared.cancel.set(CancelReason::AbortedByAbr);
            self.abort();
        }
    }

    /// Stops the transfer. The stream ends right away.
    fn abort(&mut self) {
        if self.response.is_some() {
            return;
        }
        self.handle.abort();
        let mut response = HttpResponse::failed(&self.url, "aborted");
        response.info.was_aborted = true;
        response.info.bytes_read = self.bytes;
        self.chunk.clear();
        self.response = Some(response);
    }

    /// Waits for the end of the transfer and records it in the statistics.
    fn finish(mut self) -> HttpResponse {
        while self.response.is_none() {
            self.chunk.clear();
            self.wait_for_event();
        }
        let response = self.response.take().unwrap_or_default();
        let mut stats = self.stats.borrow_mut();
        stats.http_status = response.status();
        stats.content_length = response.info.content_length;
        stats.bytes_downloaded = self.bytes.max(response.info.bytes_read);
        stats.time_to_first_byte = self
            .first_byte
            .unwrap_or(response.info.time_until_first_byte);
        stats.time_to_download = self.started.elapsed();
        let seconds = stats.time_to_download.as_secs_f64();
        let bytes = stats.bytes_downloaded;
        stats.throughput_bps = response.info.throughput_bps.unwrap_or_else(|| {
            if seconds > 0.0 {
                (bytes as f64 * 8.0 / seconds) as u64
            } else {
                0
            }
        });
        response
    }
}

impl BoxReader for SegmentStream<'_> {
    fn read_data(&mut self, buf: &mut [u8]) -> PlayerResult<usize> {
        let mut filled = 0;
        while filled < buf.len() && self.fill() {
            let count = (buf.len() - filled).min(self.chunk.len());
            buf[filled..filled + count].copy_from_slice(&self.chunk[..count]);
            self.chunk.advance(count);
            filled += count;
            self.offset += count as u64;
        }
        Ok(filled)
    }

    fn skip(&mut self, count: u64) -> PlayerResult<u64> {
        let mut skipped = 0;
        while skipped < count && self.fill() {
            let step = (count - skipped).min(self.chunk.len() as u64) as usize;
            self.chunk.advance(step);
            skipped += step as u64;
            self.offset += step as u64;
        }
        Ok(skipped)
    }

    fn has_reached_eof(&mut self) -> bool {
        !self.fill()
    }

    fn current_offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::{StaticResponse, StaticTransport},
        mpd::SegmentInformation,
        sink::AccessUnitBuffer,
        testing::{emsg_v0, init_segment, media_segment, session_with_transport},
    };

    const MPD: &str = r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" minBufferTime="PT2S" mediaPresentationDuration="PT8S">
  <Period id="p0"><AdaptationSet mimeType="video/mp4">
    <Representation id="v1" bandwidth="100000" codecs="avc1.4d401f" width="640" height="360"/>
  </AdaptationSet></Period>
</MPD>"#;

    #[derive(Default)]
    struct RecordingEvents(Mutex<Vec<(String, InbandEvent)>>);

    impl EventHandler for RecordingEvents {
        fn on_inband_event(&self, period_id: &str, event: &InbandEvent) {
            self.0.lock().unwrap().push((period_id.to_string(), event.clone()));
        }
    }

    struct Fixture {
        handler: StreamHandler,
        events: Receiver<StreamEvent>,
        sink: Arc<AccessUnitBuffer>,
        transport: Arc<StaticTransport>,
        inband: Arc<RecordingEvents>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(StaticTransport::new());
        let (session, _) = session_with_transport(MPD, transport.clone());
        let selector = Arc::new(StreamSelector::new(session.clone()));
        let sink = Arc::new(AccessUnitBuffer::new(TimeValue::from_seconds(60.0)));
        let inband = Arc::new(RecordingEvents::default());
        let (handler, events) = StreamHandler::new(
            session,
            StreamType::Video,
            sink.clone(),
            selector,
            Some(inband.clone()),
        )
        .unwrap();
        Fixture {
            handler,
            events,
            sink,
            transport,
            inband,
        }
    }

    /// Second segment of a 2s template with timescale 1000 and a PTO of 500.
    fn request(init_url: Option<&str>) -> StreamSegmentRequest {
        let segment = SegmentInformation {
            media_url: "http://localhost/v/2.m4s".to_string(),
            init_url: init_url.map(str::to_string),
            is_init_segment_required: init_url.is_some(),
            pto: 500,
            time: 500 + 2000,
            duration: 2000,
            timescale: 1000,
            number: 2,
            first_au_time: 500 + 2000,
            last_au_time: 500 + 8000,
            ..Default::default()
        };
        let mut request = StreamSegmentRequest::new(StreamType::Video, segment);
        request.period_id = "p0".to_string();
        request.representation_id = "v1".to_string();
        request
    }

    fn total_duration(units: &[AccessUnit]) -> TimeValue {
        units
            .iter()
            .fold(TimeValue::zero(), |total, au| total + au.duration)
    }

    fn completed(events: &Receiver<StreamEvent>) -> StreamSegmentRequest {
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                StreamEvent::SegmentCompleted(request) => return *request,
                StreamEvent::DataReceived { .. } => {}
            }
        }
    }

    #[test]
    fn test_delivers_access_units() {
        let f = fixture();
        f.transport
            .route("http://localhost/v/init.mp4", StaticResponse::ok(init_segment(b"vide", 1000)));
        // Four samples of 500ms starting at media time 2500.
        f.transport.route(
            "http://localhost/v/2.m4s",
            StaticResponse::ok(media_segment(2500, 4, 500, 16))
                .with_chunks(10, Duration::from_millis(10)),
        );

        f.handler
            .add_request(request(Some("http://localhost/v/init.mp4")))
            .unwrap();
        assert!(matches!(
            f.handler.add_request(request(None)),
            Err(PlayerError::HandlerBusy)
        ));
        let done = completed(&f.events);
        assert!(done.stats.was_successful, "{:?}", done.stats.failure_reason);
        assert_eq!(done.stats.duration_delivered, TimeValue::from_seconds(2.0));
        assert_eq!(done.stats.http_status, 200);
        assert!(f.handler.is_idle());

        let units = f.sink.drain();
        assert_eq!(units.len(), 4);
        assert_eq!(units[0].pts, TimeValue::from_seconds(2.0));
        assert_eq!(units[3].pts, TimeValue::from_seconds(3.5));
        assert_eq!(units[1].data.as_ref(), &[1u8; 16]);
        assert!(units.iter().all(|au| au.drop_flags.is_empty() && !au.is_dummy_data));
    }

    #[test]
    fn test_marks_early_access_units_and_caches_init() {
        let f = fixture();
        f.transport
            .route("http://localhost/v/init.mp4", StaticResponse::ok(init_segment(b"vide", 1000)));
        f.transport
            .route("http://localhost/v/2.m4s", StaticResponse::ok(media_segment(2500, 4, 500, 4)));

        for first_au in [2500 + 1000, 2500] {
            let mut request = request(Some("http://localhost/v/init.mp4"));
            request.segment.first_au_time = first_au;
            f.handler.add_request(request).unwrap();
            assert!(completed(&f.events).stats.was_successful);
        }

        let units = f.sink.drain();
        assert_eq!(units.len(), 8);
        assert!(units[0].drop_flags.contains(DropFlags::PTS_TOO_EARLY));
        assert!(units[1].drop_flags.contains(DropFlags::DTS_TOO_EARLY));
        assert!(units[2].drop_flags.is_empty());
        assert!(units[4..].iter().all(|au| au.drop_flags.is_empty()));
        assert_eq!(f.transport.request_count("http://localhost/v/init.mp4"), 1);
    }

    #[test]
    fn test_last_segment_in_period_is_cut() {
        let f = fixture();
        f.transport
            .route("http://localhost/v/init.mp4", StaticResponse::ok(init_segment(b"vide", 1000)));
        f.transport
            .route("http://localhost/v/2.m4s", StaticResponse::ok(media_segment(2500, 4, 500, 4)));

        let mut request = request(Some("http://localhost/v/init.mp4"));
        request.segment.is_last_in_period = true;
        request.segment.last_au_time = 2500 + 1000;
        f.handler.add_request(request).unwrap();
        assert!(completed(&f.events).stats.was_successful);

        let units = f.sink.drain();
        assert_eq!(units.len(), 3);
        assert!(units[2].is_last_in_period);
        assert!(units[2].drop_flags.contains(DropFlags::PTS_TOO_LATE));
    }

    #[test]
    fn test_missing_segment_is_filled() {
        let f = fixture();
        f.transport
            .route("http://localhost/v/init.mp4", StaticResponse::ok(init_segment(b"vide", 1000)));
        let mut request = request(Some("http://localhost/v/init.mp4"));
        request.segment.may_be_missing = true;
        f.handler.add_request(request).unwrap();

        let done = completed(&f.events);
        assert!(done.stats.was_successful);
        assert!(done.stats.is_missing_segment);
        assert!(done.stats.inserted_filler);
        assert_eq!(done.stats.http_status, 200);
        assert!(done.segment.is_missing);

        let units = f.sink.drain();
        assert!(units.iter().all(|au| au.is_dummy_data));
        assert_eq!(units[0].pts, TimeValue::from_seconds(2.0));
        assert_eq!(total_duration(&units), TimeValue::from_seconds(2.0));
    }

    #[test]
    fn test_failures_are_classified() {
        let f = fixture();
        f.handler
            .add_request(request(Some("http://localhost/v/init.mp4")))
            .unwrap();
        let done = completed(&f.events);
        assert!(done.failed());
        assert_eq!(done.stats.failure_kind, Some(FailureKind::InitSegmentDownload));

        f.transport
            .route("http://localhost/v/init.mp4", StaticResponse::ok(b"garbage".to_vec()));
        f.transport.route(
            "http://localhost/v/other-init.mp4",
            StaticResponse::ok(init_segment(b"vide", 1000)),
        );
        f.handler
            .add_request(request(Some("http://localhost/v/init.mp4")))
            .unwrap();
        assert_eq!(
            completed(&f.events).stats.failure_kind,
            Some(FailureKind::InitSegmentParse)
        );

        f.handler
            .add_request(request(Some("http://localhost/v/other-init.mp4")))
            .unwrap();
        let done = completed(&f.events);
        assert_eq!(done.stats.failure_kind, Some(FailureKind::MediaDownload));
        assert_eq!(done.stats.http_status, 404);
        assert!(f.sink.is_empty());
    }

    #[test]
    fn test_filler_request_skips_download() {
        let f = fixture();
        let mut request = request(None);
        request.insert_filler = true;
        request.segment.first_au_time = 500 + 3000;
        f.handler.add_request(request).unwrap();

        let done = completed(&f.events);
        assert!(done.stats.was_successful);
        assert!(done.stats.inserted_filler);
        assert!(f.transport.requests().is_empty());
        let units = f.sink.drain();
        assert_eq!(units[0].pts, TimeValue::from_seconds(3.0));
        assert_eq!(total_duration(&units), TimeValue::from_seconds(1.0));
    }

    #[test]
    fn test_inband_events_are_forwarded() {
        let f = fixture();
        f.transport
            .route("http://localhost/v/init.mp4", StaticResponse::ok(init_segment(b"vide", 1000)));
        let body = [
            emsg_v0(MPD_EVENT_SCHEME, "1", 1000, 250, 7),
            media_segment(2500, 2, 1000, 4),
        ]
        .concat();
        f.transport
            .route("http://localhost/v/2.m4s", StaticResponse::ok(body));

        let mut request = request(Some("http://localhost/v/init.mp4"));
        request.segment.inband_event_streams = vec![crate::mpd::InbandEventStream {
            scheme_id_uri: MPD_EVENT_SCHEME.to_string(),
            value: None,
            presentation_time_offset: 0,
            timescale: 1000,
        }];
        f.handler.add_request(request.clone()).unwrap();
        assert!(completed(&f.events).stats.was_successful);
        f.handler.add_request(request).unwrap();
        assert!(completed(&f.events).stats.was_successful);

        let seen = f.inband.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "p0");
        assert_eq!(seen[0].1.id, 7);
        assert_eq!(seen[0].1.presentation_time, TimeValue::from_seconds(2.25));
    }

    #[test]
    fn test_end_of_stream_completes_immediately() {
        let f = fixture();
        f.handler
            .add_request(StreamSegmentRequest::end_of_stream(StreamType::Video, "p0"))
            .unwrap();
        let done = completed(&f.events);
        assert!(done.is_eos_segment);
        assert!(!done.failed());
        assert!(f.transport.requests().is_empty());
    }
}
