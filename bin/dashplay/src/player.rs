use std::{
    collections::BTreeMap,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use iori_abr::{
    abr::{BufferingReason, SelectionDecision, StreamSelector},
    mpd::{Manifest, SearchType},
    period::{PlayPeriod, SegmentResult},
    reader::PlaylistReader,
    request::StreamSegmentRequest,
    session::{PlayerEvent, PlayerSession, SessionChannels},
    sink::{AccessUnitBuffer, AccessUnitSink},
    stream::{EventHandler, InbandEvent, StreamEvent, StreamHandler},
    time::TimeValue,
    StreamType,
};

use crate::summary::{AbrSummary, StreamSummary, Summary};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);
const SINK_CAPACITY_SECONDS: f64 = 30.0;
const DEFAULT_MIN_BUFFER_SECONDS: f64 = 2.0;
const MAX_MIN_BUFFER_SECONDS: f64 = 10.0;
const LIVE_EDGE_DELAY_SECONDS: f64 = 10.0;

pub struct PlayerConfig {
    pub url: String,
    /// Ignored for live presentations.
    pub start: Option<TimeValue>,
    pub run_for: Duration,
    pub max_bandwidth: Option<u64>,
    pub max_resolution: Option<(u32, u32)>,
}

/// Hands inband events to the reader and keeps them for the summary.
struct EventLog {
    reader: Arc<PlaylistReader>,
    events: Mutex<Vec<InbandEvent>>,
}

impl EventHandler for EventLog {
    fn on_inband_event(&self, period_id: &str, event: &InbandEvent) {
        tracing::info!(
            period = %period_id,
            scheme = %event.scheme_id_uri,
            value = %event.value,
            id = event.id,
            time = %event.presentation_time,
            "Inband event"
        );
        self.events.lock().unwrap().push(event.clone());
        self.reader.on_inband_event(period_id, event);
    }
}

enum Next {
    Following(Box<StreamSegmentRequest>),
    Retry { request: Box<StreamSegmentRequest>, fill: bool },
}

struct Stream {
    handler: StreamHandler,
    sink: Arc<AccessUnitBuffer>,
    summary: StreamSummary,
    scheduled: Option<(Instant, Next)>,
    ended: bool,
}

/// Presentation time consumed from the sinks, advancing with the wallclock while playing.
struct Playhead {
    position: TimeValue,
    resumed: Option<(Instant, TimeValue)>,
}

pub struct Player {
    session: Arc<PlayerSession>,
    channels: SessionChannels,
    config: PlayerConfig,
    reader: Arc<PlaylistReader>,
    selector: Arc<StreamSelector>,
    event_log: Arc<EventLog>,
    streams: BTreeMap<StreamType, Stream>,
    completed_sender: Sender<(StreamType, StreamEvent)>,
    completed: Receiver<(StreamType, StreamEvent)>,
    period: Option<Arc<PlayPeriod>>,
    periods: Vec<String>,
    playhead: Playhead,
    min_buffer: TimeValue,
    rebuffers: u32,
}

impl Player {
    pub fn new(session: Arc<PlayerSession>, channels: SessionChannels, config: PlayerConfig) -> Self {
        let reader = PlaylistReader::new(session.clone());
        let selector = Arc::new(StreamSelector::new(session.clone()));
        if let Some(bandwidth) = config.max_bandwidth {
            selector.set_bandwidth_ceiling(bandwidth);
        }
        if let Some((width, height)) = config.max_resolution {
            selector.set_max_video_resolution(width, height);
        }
        let event_log = Arc::new(EventLog {
            reader: reader.clone(),
            events: Mutex::new(Vec::new()),
        });
        let (completed_sender, completed) = mpsc::channel();
        Self {
            session,
            channels,
            config,
            reader,
            selector,
            event_log,
            streams: BTreeMap::new(),
            completed_sender,
            completed,
            period: None,
            periods: Vec::new(),
            playhead: Playhead {
                position: TimeValue::invalid(),
                resumed: None,
            },
            min_buffer: TimeValue::from_seconds(DEFAULT_MIN_BUFFER_SECONDS),
            rebuffers: 0,
        }
    }

    pub fn run(mut self) -> anyhow::Result<Summary> {
        let started = Instant::now();
        self.reader.load_and_parse(&self.config.url)?;
        let manifest = self.wait_for_manifest()?;
        self.min_buffer = manifest
            .min_buffer_time
            .or(TimeValue::from_seconds(DEFAULT_MIN_BUFFER_SECONDS))
            .min(TimeValue::from_seconds(MAX_MIN_BUFFER_SECONDS));

        let start = self.start_time(&manifest);
        let period = manifest
            .find_period(manifest.anchor_time() + start)
            .context("The presentation has no period")?;
        tracing::info!(period = %period.id, start = %start, "Starting playback");

        let result = self
            .enter_period(&period.id, start)
            .and_then(|_| self.play_until(started + self.config.run_for));
        let summary = self.summary(started, &manifest);
        self.shutdown();
        result.map(|_| summary)
    }

    fn wait_for_manifest(&self) -> anyhow::Result<Arc<Manifest>> {
        let deadline = Instant::now() + MANIFEST_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(error) = self.channels.errors.try_recv() {
                return Err(error.into());
            }
            match self.channels.events.recv_timeout(POLL_INTERVAL) {
                Ok(PlayerEvent::ManifestLoaded { .. }) => {
                    return self.session.manifest().context("No manifest after loading");
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        bail!("Timed out waiting for the manifest")
    }

    /// Start position relative to the availability start time.
    fn start_time(&self, manifest: &Manifest) -> TimeValue {
        let first_period = manifest
            .periods
            .first()
            .map(|period| period.start)
            .unwrap_or_else(TimeValue::zero);
        if manifest.is_static() {
            return self.config.start.unwrap_or(first_period).max(first_period);
        }
        let delay = manifest
            .suggested_presentation_delay
            .or(TimeValue::from_seconds(LIVE_EDGE_DELAY_SECONDS));
        let live_edge = self.session.clock().now_time() - manifest.anchor_time() - delay;
        live_edge.max(first_period)
    }

    fn enter_period(&mut self, period_id: &str, start: TimeValue) -> anyhow::Result<()> {
        let period = Arc::new(PlayPeriod::new(
            self.session.clone(),
            Some(self.reader.clone()),
            period_id,
        ));
        period.prepare_for_play()?;
        self.selector.set_current_playback_period(period.clone());

        let stream_types = period.stream_types();
        for &stream_type in &stream_types {
            self.ensure_stream(stream_type)?;
        }
        for (stream_type, stream) in self.streams.iter_mut() {
            stream.ended = !stream_types.contains(stream_type);
            stream.scheduled = None;
        }
        self.periods.push(period_id.to_string());
        self.period = Some(period.clone());

        let deadline = Instant::now() + MANIFEST_TIMEOUT;
        loop {
            match period.get_starting_segment(start, SearchType::Closest) {
                SegmentResult::Found(mut request) => {
                    if !self.playhead.position.is_valid() {
                        self.playhead.position = request.start_time();
                    }
                    let dependents = std::mem::take(&mut request.dependent_streams);
                    self.dispatch(*request)?;
                    for dependent in dependents {
                        self.dispatch(dependent)?;
                    }
                    return Ok(());
                }
                SegmentResult::TryAgainLater(delay) if Instant::now() < deadline => {
                    std::thread::sleep(delay);
                }
                SegmentResult::PastEos => {
                    for stream in self.streams.values_mut() {
                        stream.ended = true;
                    }
                    return Ok(());
                }
                other => bail!("No starting segment in period {period_id}: {other:?}"),
            }
        }
    }

    fn ensure_stream(&mut self, stream_type: StreamType) -> anyhow::Result<()> {
        if self.streams.contains_key(&stream_type) {
            return Ok(());
        }
        let sink = Arc::new(AccessUnitBuffer::new(TimeValue::from_seconds(SINK_CAPACITY_SECONDS)));
        let (handler, events) = StreamHandler::new(
            self.session.clone(),
            stream_type,
            sink.clone(),
            self.selector.clone(),
            Some(self.event_log.clone()),
        )?;
        let sender = self.completed_sender.clone();
        std::thread::Builder::new()
            .name(format!("events-{stream_type}"))
            .spawn(move || {
                for event in events {
                    if sender.send((stream_type, event)).is_err() {
                        break;
                    }
                }
            })?;
        self.streams.insert(
            stream_type,
            Stream {
                handler,
                sink,
                summary: StreamSummary::default(),
                scheduled: None,
                ended: false,
            },
        );
        Ok(())
    }

    fn dispatch(&mut self, request: StreamSegmentRequest) -> anyhow::Result<()> {
        let stream = self
            .streams
            .get(&request.stream_type)
            .with_context(|| format!("No handler for {} requests", request.stream_type))?;
        stream.handler.add_request(request)?;
        Ok(())
    }

    fn play_until(&mut self, deadline: Instant) -> anyhow::Result<()> {
        while Instant::now() < deadline {
            if let Ok(error) = self.channels.errors.try_recv() {
                return Err(error.into());
            }
            while let Ok(event) = self.channels.events.try_recv() {
                tracing::debug!(?event, "Session event");
            }
            if let Ok((stream_type, event)) = self.completed.recv_timeout(POLL_INTERVAL) {
                if let StreamEvent::SegmentCompleted(request) = event {
                    self.on_segment_completed(stream_type, *request)?;
                }
            }
            self.run_scheduled()?;
            self.advance_playhead();

            let finished = self
                .streams
                .values()
                .all(|stream| stream.ended && stream.handler.is_idle());
            if finished && !self.enter_next_period()? {
                if self.streams.values().all(|stream| stream.sink.is_empty()) {
                    tracing::info!("Presentation ended");
                    return Ok(());
                }
            }
        }
        tracing::info!("Play duration reached");
        Ok(())
    }

    fn on_segment_completed(&mut self, stream_type: StreamType, request: StreamSegmentRequest) -> anyhow::Result<()> {
        let Some(period) = self.period.clone() else {
            return Ok(());
        };
        let Some(stream) = self.streams.get_mut(&stream_type) else {
            return Ok(());
        };
        stream.summary.record_segment(&request);
        if request.period_id != period.period_id() {
            return Ok(());
        }

        let decision = if request.is_eos_segment {
            SelectionDecision::FetchNext
        } else {
            self.selector.select_suitable_streams(stream_type, Some(&request))
        };
        let now = Instant::now();
        let next = match decision {
            SelectionDecision::FetchNext => (now, Next::Following(Box::new(request))),
            SelectionDecision::Retry(delay) => {
                tracing::info!(%stream_type, url = %request.stats.url, ?delay, "Retrying segment");
                (
                    now + delay,
                    Next::Retry {
                        request: Box::new(request),
                        fill: false,
                    },
                )
            }
            SelectionDecision::Fill => {
                tracing::info!(%stream_type, url = %request.stats.url, "Filling the rest of the segment");
                (
                    now,
                    Next::Retry {
                        request: Box::new(request),
                        fill: true,
                    },
                )
            }
            SelectionDecision::Fail => bail!(
                "Giving up on {stream_type} segment {}: {}",
                request.stats.url,
                request.stats.failure_reason.as_deref().unwrap_or("unknown error")
            ),
        };
        stream.scheduled = Some(next);
        Ok(())
    }

    fn run_scheduled(&mut self) -> anyhow::Result<()> {
        let Some(period) = self.period.clone() else {
            return Ok(());
        };
        let now = Instant::now();
        for (stream_type, stream) in self.streams.iter_mut() {
            if !stream.scheduled.as_ref().is_some_and(|(at, _)| *at <= now) {
                continue;
            }
            let Some((_, next)) = stream.scheduled.take() else {
                continue;
            };
            let result = match &next {
                Next::Following(current) => period.get_next_segment(current),
                Next::Retry { request, fill } => period.get_retry_segment(request, *fill),
            };
            match result {
                SegmentResult::Found(request) => stream.handler.add_request(*request)?,
                SegmentResult::PastEos => {
                    tracing::info!(%stream_type, period = %period.period_id(), "End of period reached");
                    stream.ended = true;
                }
                SegmentResult::TryAgainLater(delay) => stream.scheduled = Some((now + delay, next)),
                other => bail!("Cannot continue the {stream_type} stream: {other:?}"),
            }
        }
        Ok(())
    }

    fn advance_playhead(&mut self) {
        let now = Instant::now();
        let Some((resumed_at, base)) = self.playhead.resumed else {
            let ready = self
                .streams
                .values()
                .all(|stream| stream.ended || stream.sink.buffered_duration() >= self.min_buffer);
            if ready && self.playhead.position.is_valid() {
                tracing::info!(position = %self.playhead.position, "Playing");
                self.playhead.resumed = Some((now, self.playhead.position));
            }
            return;
        };

        let position = base + TimeValue::from(now - resumed_at);
        self.playhead.position = position;
        for (stream_type, stream) in self.streams.iter_mut() {
            let played = stream.sink.consume_until(position);
            stream.summary.record_played(&played);
            self.selector
                .set_buffer_level(*stream_type, stream.sink.buffered_duration());
        }

        let starving = self
            .streams
            .values()
            .any(|stream| !stream.ended && stream.sink.is_empty());
        if starving {
            tracing::warn!(position = %position, "Buffer ran dry");
            self.rebuffers += 1;
            self.playhead.resumed = None;
            self.selector.report_buffering_start(BufferingReason::Rebuffering);
        }
    }

    /// Moves on to the period following the current one. Returns false at the last period.
    fn enter_next_period(&mut self) -> anyhow::Result<bool> {
        let (Some(manifest), Some(current)) = (self.session.manifest(), self.period.clone()) else {
            return Ok(false);
        };
        let next = manifest
            .periods
            .iter()
            .skip_while(|period| period.id != current.period_id())
            .skip(1)
            .find(|period| !period.is_early)
            .cloned();
        let Some(next) = next else {
            return Ok(false);
        };
        tracing::info!(from = %current.period_id(), to = %next.id, "Entering next period");
        self.enter_period(&next.id, next.start)?;
        Ok(true)
    }

    fn summary(&mut self, started: Instant, manifest: &Manifest) -> Summary {
        let streams = self
            .streams
            .iter_mut()
            .map(|(stream_type, stream)| (stream_type.to_string(), std::mem::take(&mut stream.summary)))
            .collect();
        Summary {
            url: self.config.url.clone(),
            presentation_type: format!("{:?}", manifest.presentation_type),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            periods: self.periods.clone(),
            rebuffers: self.rebuffers,
            streams,
            abr: AbrSummary {
                last_bandwidth: self.selector.get_last_bandwidth(),
                average_bandwidth: self.selector.get_average_bandwidth(),
                average_throughput: self.selector.get_average_throughput(),
                average_latency_ms: self.selector.get_average_latency().as_milliseconds(),
            },
            inband_events: self.event_log.events.lock().unwrap().clone(),
        }
    }

    fn shutdown(&self) {
        for stream in self.streams.values() {
            stream.handler.cancel(true);
            stream.handler.close();
        }
        self.reader.close();
    }
}
