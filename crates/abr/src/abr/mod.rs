//! Adaptive stream selection.
//!
//! The selector keeps moving averages of the observed bandwidth, latency and throughput and
//! picks, before every segment, the highest representation whose simulated download keeps the
//! buffer healthy. It is also consulted while a segment downloads and may abort it.

mod average;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};

pub use average::MovingAverage;

use crate::{
    mpd::{AdaptationSet, Representation, SegmentSize},
    params::ParamDict,
    period::PlayPeriod,
    request::{DownloadStats, FailureKind, StreamSegmentRequest},
    session::PlayerSession,
    time::TimeValue,
    StreamType,
};

/// Tunables of the selector, read from the `abr.*` options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbrConfig {
    /// Number of samples in the moving averages.
    pub sample_window: usize,
    /// How far ahead the download of video segments is simulated.
    pub simulation_window: TimeValue,
    pub low_watermark: TimeValue,
    pub high_watermark: TimeValue,
    /// Safety factor applied to the bandwidth estimate in the simulation.
    pub bandwidth_factor: f64,
    /// Applied to the bandwidth and throughput history on rebuffering.
    pub rebuffer_scale: f64,
    /// Applied to the bandwidth history when a download had to be aborted.
    pub abort_scale: f64,
    pub blacklist_duration: TimeValue,
    pub max_retries: u32,
    /// A 404 this close to the availability start is treated as the segment not being there
    /// yet.
    pub availability_miss_tolerance: TimeValue,
    pub availability_retry_delay: Duration,
    /// Below this buffer level access units are emitted before the segment is complete.
    pub emit_partial_threshold: TimeValue,
    /// Download time allowance, in segment durations, for the first segment after a forced
    /// bandwidth.
    pub forced_segment_allowance: f64,
    /// Bandwidth assumed before any download finished.
    pub initial_bandwidth: u64,
}

impl AbrConfig {
    pub fn from_options(options: &ParamDict) -> Self {
        Self {
            sample_window: options.get_i64_or("abr.sample_window", 3).max(1) as usize,
            simulation_window: options
                .get_time_value_or("abr.simulation_window", TimeValue::from_seconds(20.0)),
            low_watermark: options.get_time_value_or("abr.low_watermark", TimeValue::from_seconds(3.0)),
            high_watermark: options
                .get_time_value_or("abr.high_watermark", TimeValue::from_seconds(8.0)),
            bandwidth_factor: options.get_f64_or("abr.bandwidth_factor", 0.9),
            rebuffer_scale: options.get_f64_or("abr.rebuffer_scale", 0.6),
            abort_scale: options.get_f64_or("abr.abort_scale", 0.5),
            blacklist_duration: options
                .get_time_value_or("abr.blacklist_duration", TimeValue::from_seconds(1.0)),
            max_retries: options.get_i64_or("abr.max_retries", 3).max(0) as u32,
            availability_miss_tolerance: options.get_time_value_or(
                "abr.availability_miss_tolerance",
                TimeValue::from_milliseconds(500),
            ),
            availability_retry_delay: Duration::from_millis(
                options.get_i64_or("abr.availability_retry_delay_ms", 500).max(0) as u64,
            ),
            emit_partial_threshold: options
                .get_time_value_or("abr.emit_partial_threshold", TimeValue::from_seconds(1.0)),
            forced_segment_allowance: options.get_f64_or("abr.forced_segment_allowance", 2.0),
            initial_bandwidth: options.get_i64_or("abr.initial_bandwidth", 1_000_000).max(1) as u64,
        }
    }
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self::from_options(&ParamDict::new())
    }
}

/// What to do before the next segment of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionDecision {
    FetchNext,
    /// Retry the failed segment after the delay, possibly with another representation.
    Retry(Duration),
    /// Replace the failed segment with filler data.
    Fill,
    Fail,
}

/// Verdict on an in-flight download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressDecision {
    Continue,
    Abort { insert_filler: bool },
    EmitPartialData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferingReason {
    Initial,
    Seeking,
    Rebuffering,
}

/// Excludes representations whose segment URLs contain `url_fragment` (typically a CDN host)
/// until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub url_fragment: String,
    pub expires_at: TimeValue,
}

#[derive(Debug, Clone, Default)]
struct RepresentationHealth {
    becomes_available_again_at: TimeValue,
    permanently_unavailable: bool,
    last_url: Option<String>,
    last_stats: Option<DownloadStats>,
}

impl RepresentationHealth {
    fn is_available(&self, now: TimeValue) -> bool {
        !self.permanently_unavailable
            && !(self.becomes_available_again_at.is_valid() && now < self.becomes_available_again_at)
    }
}

struct SelectorState {
    bandwidth: MovingAverage,
    latency: MovingAverage,
    throughput: MovingAverage,
    health: HashMap<String, RepresentationHealth>,
    external_blacklist: Vec<BlacklistEntry>,
    forced_next_bandwidth: Option<u64>,
    bandwidth_ceiling: u64,
    max_video_resolution: Option<(u32, u32)>,
    buffer_levels: HashMap<StreamType, TimeValue>,
    period: Option<Arc<PlayPeriod>>,
    alternate_switching: bool,
}

impl SelectorState {
    fn expire_blacklists(&mut self, now: TimeValue) {
        for (id, health) in self.health.iter_mut() {
            if health.becomes_available_again_at.is_valid() && now >= health.becomes_available_again_at {
                tracing::debug!(representation = %id, "Representation is available again");
                health.becomes_available_again_at = TimeValue::invalid();
            }
        }
        self.external_blacklist
            .retain(|entry| !(entry.expires_at.is_valid() && now >= entry.expires_at));
    }

    fn is_externally_blacklisted(&self, representation: &Representation) -> bool {
        let last_url = self
            .health
            .get(&representation.id)
            .and_then(|health| health.last_url.as_deref());
        self.external_blacklist.iter().any(|entry| {
            representation.id == entry.url_fragment
                || last_url.is_some_and(|url| url.contains(&entry.url_fragment))
        })
    }

    /// Usable representations passing the health and configuration filters, lowest bitrate
    /// first.
    fn candidates(
        &self,
        adaptation_set: &AdaptationSet,
        stream_type: StreamType,
        now: TimeValue,
    ) -> Vec<Arc<Representation>> {
        let mut healthy: Vec<_> = adaptation_set
            .representations
            .iter()
            .filter(|r| r.is_usable())
            .filter(|r| self.health.get(&r.id).map_or(true, |h| h.is_available(now)))
            .filter(|r| !self.is_externally_blacklisted(r))
            .cloned()
            .collect();
        healthy.sort_by_key(|r| r.bandwidth);

        let constrained: Vec<_> = healthy
            .iter()
            .filter(|r| r.bandwidth <= self.bandwidth_ceiling)
            .filter(|r| {
                stream_type != StreamType::Video
                    || self.max_video_resolution.map_or(true, |(width, height)| {
                        r.codec.width <= width && r.codec.height <= height
                    })
            })
            .cloned()
            .collect();
        if constrained.is_empty() {
            // The lowest representation keeps playback going even when the constraints rule out
            // everything.
            healthy.truncate(1);
            healthy
        } else {
            constrained
        }
    }

    /// Bits per second assumed by the download simulation.
    fn simulation_bandwidth(&self, config: &AbrConfig) -> f64 {
        let estimate = match (self.bandwidth.last(), self.bandwidth.average()) {
            (Some(last), Some(average)) => last.min(average),
            _ => self
                .forced_next_bandwidth
                .unwrap_or(config.initial_bandwidth) as f64,
        };
        let estimate = match self.forced_next_bandwidth {
            Some(forced) => forced as f64,
            None => estimate,
        };
        (estimate * config.bandwidth_factor).max(1.0)
    }
}

pub struct StreamSelector {
    session: Arc<PlayerSession>,
    config: AbrConfig,
    state: Mutex<SelectorState>,
}

impl StreamSelector {
    pub fn new(session: Arc<PlayerSession>) -> Self {
        let config = AbrConfig::from_options(session.options());
        Self::with_config(session, config)
    }

    pub fn with_config(session: Arc<PlayerSession>, config: AbrConfig) -> Self {
        Self {
            session,
            state: Mutex::new(SelectorState {
                bandwidth: MovingAverage::new(config.sample_window),
                latency: MovingAverage::new(config.sample_window),
                throughput: MovingAverage::new(config.sample_window),
                health: HashMap::new(),
                external_blacklist: Vec::new(),
                forced_next_bandwidth: None,
                bandwidth_ceiling: u64::MAX,
                max_video_resolution: None,
                buffer_levels: HashMap::new(),
                period: None,
                alternate_switching: true,
            }),
            config,
        }
    }

    pub fn config(&self) -> &AbrConfig {
        &self.config
    }

    /// Chooses the representation of `stream_type` for the segment following `current` and
    /// selects it on the current period.
    ///
    /// `current` is the request that just completed. If it failed the failure is classified
    /// first.
    pub fn select_suitable_streams(
        &self,
        stream_type: StreamType,
        current: Option<&StreamSegmentRequest>,
    ) -> SelectionDecision {
        let now = self.session.clock().now_time();
        let mut state = self.state.lock().unwrap();
        state.expire_blacklists(now);

        let Some(period) = state.period.clone() else {
            tracing::warn!("No playback period set for stream selection");
            return SelectionDecision::Fail;
        };

        let failed = current.filter(|request| request.failed());
        let mut fill_when_exhausted = false;
        if let Some(request) = failed {
            let stats = &request.stats;
            let tolerance = self.config.availability_miss_tolerance;
            if stats.http_status == 404
                && request.asast.is_valid()
                && stats.availability_delay > -tolerance
                && stats.availability_delay < tolerance
            {
                tracing::debug!(
                    url = %stats.url,
                    delay = %stats.availability_delay,
                    "Segment requested right at its availability time, retrying"
                );
                return SelectionDecision::Retry(self.config.availability_retry_delay);
            }
            if request.retry_count >= self.config.max_retries {
                tracing::warn!(
                    url = %stats.url,
                    retries = request.retry_count,
                    reason = ?stats.failure_reason,
                    "Segment failed too often"
                );
                return SelectionDecision::Fail;
            }
            if !state.alternate_switching {
                return SelectionDecision::Retry(Duration::ZERO);
            }

            let blacklist_until = now + self.config.blacklist_duration;
            match stats.failure_kind {
                Some(FailureKind::InitSegmentParse) => {
                    tracing::warn!(representation = %request.representation_id, "Init segment is broken, no longer using the representation");
                    state
                        .health
                        .entry(request.representation_id.clone())
                        .or_default()
                        .permanently_unavailable = true;
                }
                Some(FailureKind::AbortedByAbr) => {
                    state.bandwidth.scale(self.config.abort_scale);
                }
                _ => {
                    state
                        .health
                        .entry(request.representation_id.clone())
                        .or_default()
                        .becomes_available_again_at = blacklist_until;
                }
            }

            let media_failure = !stats.failure_kind.is_some_and(|kind| kind.is_init_segment());
            if media_failure && stats.has_delivered_data() {
                // Emitted access units cannot be taken back, the rest of the segment has to be
                // filled.
                return SelectionDecision::Fill;
            }
            fill_when_exhausted = media_failure;
        }

        let Some(adaptation_set) = period.adaptation_set(stream_type) else {
            return SelectionDecision::Fail;
        };
        let candidates = state.candidates(&adaptation_set, stream_type, now);
        let Some(lowest) = candidates.first() else {
            return if fill_when_exhausted {
                SelectionDecision::Fill
            } else {
                SelectionDecision::Fail
            };
        };

        let chosen = if stream_type == StreamType::Video {
            let buffer = state
                .buffer_levels
                .get(&stream_type)
                .copied()
                .unwrap_or_else(TimeValue::zero);
            let bandwidth = state.simulation_bandwidth(&self.config);
            let latency = state.latency.average().unwrap_or(0.0);
            let segment = current.map(|request| &request.segment);

            let mut best = lowest.clone();
            for candidate in candidates.iter().skip(1) {
                let (segments, _) = period.get_segment_information(
                    stream_type,
                    candidate,
                    segment,
                    self.config.simulation_window,
                );
                if self.is_feasible(&segments, buffer, bandwidth, latency) {
                    best = candidate.clone();
                }
            }
            best
        } else {
            candidates[candidates.len() - 1].clone()
        };
        drop(state);

        period.select_stream(&adaptation_set.id, &chosen.id);
        if failed.is_some() {
            SelectionDecision::Retry(Duration::ZERO)
        } else {
            SelectionDecision::FetchNext
        }
    }

    /// Simulates downloading `segments` at `bandwidth` bits per second. The buffer plus the media
    /// that has arrived by the end of the simulation window must exceed the high watermark.
    fn is_feasible(&self, segments: &[SegmentSize], buffer: TimeValue, bandwidth: f64, latency: f64) -> bool {
        let Some(first) = segments.first() else {
            return true;
        };
        let window = self.config.simulation_window.as_seconds();
        let download_time = |segment: &SegmentSize| latency + segment.byte_size as f64 * 8.0 / bandwidth;

        let first_gain = first.duration.as_seconds() - download_time(first);
        let mut min_gain = f64::INFINITY;
        let mut elapsed = 0.0;
        let mut obtained = 0.0;
        for segment in segments {
            let time = download_time(segment);
            min_gain = min_gain.min(segment.duration.as_seconds() - time);
            elapsed += time;
            if elapsed <= window {
                obtained += segment.duration.as_seconds();
            }
        }

        let buffer = buffer.as_seconds_or(0.0);
        let low = self.config.low_watermark.as_seconds();
        let high = self.config.high_watermark.as_seconds();
        ((buffer < low && min_gain > 0.0) || buffer + first_gain > low) && buffer + obtained > high
    }

    /// Called periodically while a segment downloads.
    pub fn report_download_progress(&self, stats: &DownloadStats) -> ProgressDecision {
        let state = self.state.lock().unwrap();
        let buffered = stats
            .stream_type
            .and_then(|stream_type| state.buffer_levels.get(&stream_type).copied())
            .unwrap_or_else(TimeValue::zero);

        let elapsed = stats.time_to_download.as_secs_f64();
        let segment_duration = stats.segment_duration.as_seconds_or(0.0);
        let allowance = if state.forced_next_bandwidth.is_some() {
            self.config.forced_segment_allowance
        } else {
            1.0
        };
        if segment_duration > 0.0 && elapsed > segment_duration * allowance {
            let downloaded = stats.duration_downloaded.as_seconds_or(0.0);
            let estimated_total = match stats.content_length {
                Some(length) if length > 0 && stats.bytes_downloaded > 0 => {
                    elapsed * length as f64 / stats.bytes_downloaded as f64
                }
                _ if downloaded > 0.0 => elapsed * segment_duration / downloaded,
                _ => f64::INFINITY,
            };
            if estimated_total > buffered.as_seconds_or(0.0) {
                tracing::info!(
                    url = %stats.url,
                    elapsed,
                    estimated_total,
                    buffered = %buffered,
                    "Aborting segment download"
                );
                return ProgressDecision::Abort {
                    insert_filler: stats.has_delivered_data(),
                };
            }
        }

        if !stats.emit_partial_data
            && !stats.has_delivered_data()
            && buffered < self.config.emit_partial_threshold
        {
            return ProgressDecision::EmitPartialData;
        }
        ProgressDecision::Continue
    }

    /// Called once a segment download has finished, successfully or not.
    pub fn report_download_end(&self, stats: &DownloadStats) {
        let mut state = self.state.lock().unwrap();
        let seconds = stats.time_to_download.as_secs_f64();
        if stats.was_successful && !stats.is_missing_segment && stats.bytes_downloaded > 0 && seconds > 0.0 {
            let bandwidth = stats.bytes_downloaded as f64 * 8.0 / seconds;
            let throughput = match stats.throughput_bps {
                0 => bandwidth,
                reported => reported as f64,
            };
            state.bandwidth.add(bandwidth);
            state.latency.add(stats.time_to_first_byte.as_secs_f64());
            state.throughput.add(throughput);
            state.forced_next_bandwidth = None;
        }
        if !stats.representation_id.is_empty() {
            let health = state.health.entry(stats.representation_id.clone()).or_default();
            health.last_url = Some(stats.url.clone());
            health.last_stats = Some(stats.clone());
        }
    }

    pub fn report_buffering_start(&self, reason: BufferingReason) {
        if reason != BufferingReason::Rebuffering {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.bandwidth.scale(self.config.rebuffer_scale);
        state.throughput.scale(self.config.rebuffer_scale);
        tracing::info!(
            bandwidth = ?state.bandwidth.last(),
            "Rebuffering, lowering the bandwidth estimate"
        );
    }

    /// Uses `bandwidth` for the next selection, until a download completes.
    pub fn set_forced_next_bandwidth(&self, bandwidth: u64) {
        self.state.lock().unwrap().forced_next_bandwidth = Some(bandwidth);
    }

    pub fn set_bandwidth_ceiling(&self, bandwidth: u64) {
        self.state.lock().unwrap().bandwidth_ceiling = bandwidth;
    }

    pub fn set_max_video_resolution(&self, width: u32, height: u32) {
        self.state.lock().unwrap().max_video_resolution = Some((width, height));
    }

    pub fn set_current_playback_period(&self, period: Arc<PlayPeriod>) {
        self.state.lock().unwrap().period = Some(period);
    }

    pub fn set_buffer_level(&self, stream_type: StreamType, level: TimeValue) {
        self.state.lock().unwrap().buffer_levels.insert(stream_type, level);
    }

    pub fn add_external_blacklist(&self, entry: BlacklistEntry) {
        self.state.lock().unwrap().external_blacklist.push(entry);
    }

    pub fn set_alternate_stream_switching(&self, enabled: bool) {
        self.state.lock().unwrap().alternate_switching = enabled;
    }

    /// Most recent bandwidth sample in bits per second.
    pub fn get_last_bandwidth(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .bandwidth
            .last()
            .map(|bps| bps.round() as u64)
            .or(state.forced_next_bandwidth)
            .unwrap_or(self.config.initial_bandwidth)
    }

    pub fn get_average_bandwidth(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .bandwidth
            .average()
            .map(|bps| bps.round() as u64)
            .or(state.forced_next_bandwidth)
            .unwrap_or(self.config.initial_bandwidth)
    }

    pub fn get_average_throughput(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .throughput
            .average()
            .map(|bps| bps.round() as u64)
            .unwrap_or(0)
    }

    pub fn get_average_latency(&self) -> TimeValue {
        let state = self.state.lock().unwrap();
        state
            .latency
            .average()
            .map(TimeValue::from_seconds)
            .unwrap_or_else(TimeValue::zero)
    }
}
