use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    document::{DocRef, MpdDocument},
    search::InbandEventStream,
};
use crate::{clock::UtcTiming, time::TimeValue, StreamType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresentationType {
    Static,
    Dynamic,
}

/// Codec and format properties of a representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecInfo {
    /// The first entry of `@codecs`, as given.
    pub codec: String,
    pub stream_type: StreamType,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub sample_rate: u32,
    pub channels: u32,
    pub language: Option<String>,
}

impl CodecInfo {
    /// Classifies an RFC 6381 codec string.
    pub fn stream_type_of(codec: &str) -> Option<StreamType> {
        let fourcc = codec.split('.').next().unwrap_or_default();
        match fourcc {
            "avc1" | "avc3" | "hvc1" | "hev1" | "dvh1" | "dvhe" | "vp08" | "vp09" | "av01" => {
                Some(StreamType::Video)
            }
            "mp4a" | "ac-3" | "ec-3" | "ac-4" | "opus" | "Opus" | "flac" | "fLaC" | "dtsc" => {
                Some(StreamType::Audio)
            }
            "stpp" | "wvtt" | "tx3g" => Some(StreamType::Subtitle),
            _ => None,
        }
    }
}

/// Immutable snapshot of a parsed MPD.
///
/// A new snapshot is built for every successful (re)load. Only [`Manifest::fetch_time`] changes
/// afterwards, when a conditional refresh reports the document as unmodified.
#[derive(Debug)]
pub struct Manifest {
    pub(crate) document: Arc<MpdDocument>,
    pub presentation_type: PresentationType,
    pub availability_start_time: TimeValue,
    pub availability_end_time: TimeValue,
    pub publish_time: TimeValue,
    pub minimum_update_period: TimeValue,
    pub min_buffer_time: TimeValue,
    pub time_shift_buffer_depth: TimeValue,
    pub suggested_presentation_delay: TimeValue,
    pub media_presentation_duration: TimeValue,
    /// The first `<Location>`, used for subsequent refreshes.
    pub location: Option<Url>,
    pub utc_timings: Vec<UtcTiming>,
    pub periods: Vec<Arc<Period>>,
    pub(crate) fetch_time: Mutex<TimeValue>,
}

impl Manifest {
    pub fn document(&self) -> &Arc<MpdDocument> {
        &self.document
    }

    pub fn generation(&self) -> u64 {
        self.document.generation()
    }

    pub fn url(&self) -> &Url {
        self.document.url()
    }

    pub fn etag(&self) -> Option<&str> {
        self.document.etag()
    }

    pub fn is_static(&self) -> bool {
        self.presentation_type == PresentationType::Static
    }

    pub fn uses_ast(&self) -> bool {
        self.availability_start_time.is_valid()
    }

    /// `MPD@availabilityStartTime`, or zero when the presentation has none.
    pub fn anchor_time(&self) -> TimeValue {
        if self.uses_ast() {
            self.availability_start_time
        } else {
            TimeValue::zero()
        }
    }

    pub fn are_updates_expected(&self) -> bool {
        self.presentation_type == PresentationType::Dynamic && self.minimum_update_period.is_valid()
    }

    pub fn fetch_time(&self) -> TimeValue {
        *self.fetch_time.lock().unwrap()
    }

    pub fn set_fetch_time(&self, time: TimeValue) {
        *self.fetch_time.lock().unwrap() = time;
    }

    /// Wallclock time at which the next regular refresh is due, invalid if none is expected.
    pub fn next_update_time(&self) -> TimeValue {
        if !self.are_updates_expected() {
            return TimeValue::invalid();
        }
        self.fetch_time() + self.minimum_update_period
    }

    pub fn period_by_id(&self, id: &str) -> Option<Arc<Period>> {
        self.periods.iter().find(|period| period.id == id).cloned()
    }

    /// Whether a period that is not early available follows `period`.
    pub fn has_following_regular_period(&self, period: &Period) -> bool {
        self.periods
            .iter()
            .skip_while(|p| p.id != period.id)
            .skip(1)
            .any(|p| !p.is_early)
    }

    /// Absolute end time of the last regular period, positive infinity if it is open ended.
    pub fn last_period_end_time(&self) -> TimeValue {
        match self.periods.iter().rev().find(|p| !p.is_early) {
            Some(period) if period.end.is_valid() => self.anchor_time() + period.end,
            _ => TimeValue::positive_infinity(),
        }
    }

    /// Absolute start time of the first period.
    pub fn first_period_start_time(&self) -> TimeValue {
        self.periods
            .first()
            .map(|period| self.anchor_time() + period.start)
            .unwrap_or_default()
    }

    /// Finds the regular period covering the absolute time `time`. Times before the first
    /// period map to the first one.
    pub fn find_period(&self, time: TimeValue) -> Option<Arc<Period>> {
        let local = time - self.anchor_time();
        let mut candidate = None;
        for period in self.periods.iter().filter(|p| !p.is_early) {
            if candidate.is_some() && local < period.start {
                break;
            }
            candidate = Some(period);
        }
        candidate.cloned()
    }

    /// Whether an inband `urn:mpeg:dash:event:2012` stream signals MPD validity expiration.
    pub fn has_mpd_event_stream(&self) -> bool {
        self.periods.iter().any(|period| {
            period.adaptation_sets.iter().any(|adaptation_set| {
                adaptation_set
                    .inband_event_streams
                    .iter()
                    .any(|stream| stream.scheme_id_uri == super::MPD_EVENT_SCHEME)
            })
        })
    }
}

#[derive(Debug)]
pub struct Period {
    /// `Period@id`, or `$unnamed.N$` when absent.
    pub id: String,
    /// Start relative to the availability start time.
    pub start: TimeValue,
    pub end: TimeValue,
    pub duration: TimeValue,
    /// Early available period (no derivable start). Not playable.
    pub is_early: bool,
    pub has_following_period: bool,
    pub doc_ref: DocRef,
    pub adaptation_sets: Vec<Arc<AdaptationSet>>,
}

impl Period {
    pub fn adaptation_set_by_id(&self, id: &str) -> Option<Arc<AdaptationSet>> {
        self.adaptation_sets.iter().find(|a| a.id == id).cloned()
    }

    pub fn adaptation_sets_of_type(
        &self,
        stream_type: StreamType,
    ) -> impl Iterator<Item = &Arc<AdaptationSet>> {
        self.adaptation_sets
            .iter()
            .filter(move |a| a.stream_type == stream_type)
    }

    /// Period duration, falling back to `end - start`.
    pub fn get_duration(&self) -> TimeValue {
        if self.duration.is_valid() {
            self.duration
        } else if self.end.is_valid() {
            self.end - self.start
        } else {
            TimeValue::positive_infinity()
        }
    }
}

#[derive(Debug)]
pub struct AdaptationSet {
    /// `AdaptationSet@id`, or the index within the period.
    pub id: String,
    pub index: usize,
    pub stream_type: StreamType,
    pub language: Option<String>,
    pub roles: Vec<String>,
    pub accessibilities: Vec<String>,
    /// Codec of the representation with the highest bandwidth.
    pub codec: Option<CodecInfo>,
    pub max_bandwidth: u64,
    pub inband_event_streams: Vec<InbandEventStream>,
    pub doc_ref: DocRef,
    pub representations: Vec<Arc<Representation>>,
}

impl AdaptationSet {
    pub fn representation_by_id(&self, id: &str) -> Option<Arc<Representation>> {
        self.representations.iter().find(|r| r.id == id).cloned()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Representation with the highest bitrate not above `max_bandwidth`, else the lowest one.
    /// Unusable representations are skipped.
    pub fn representation_by_max_bandwidth(&self, max_bandwidth: u64) -> Option<Arc<Representation>> {
        let usable = self.representations.iter().filter(|r| r.is_usable());
        let best = usable
            .clone()
            .filter(|r| r.bandwidth <= max_bandwidth)
            .max_by_key(|r| r.bandwidth);
        best.or_else(|| usable.min_by_key(|r| r.bandwidth)).cloned()
    }
}

/// Flags for warnings that are logged only once per representation.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WarnedOnce {
    pub timescale_mismatch: bool,
    pub timescale_one: bool,
    pub timeline_start_gap: bool,
    pub timeline_overlap: bool,
    pub timeline_gap: bool,
    pub timeline_k: bool,
    pub number_overflow: bool,
    pub inconsistent_numbering: bool,
    pub no_t_after_negative_r: bool,
    pub index_source_url: bool,
}

#[derive(Debug)]
pub(crate) struct RepresentationState {
    pub usable: bool,
    pub unusable_reason: Option<String>,
    pub warned: WarnedOnce,
    /// A remote segment index load has been handed out and not completed yet.
    pub index_pending: bool,
}

#[derive(Debug)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub codec: CodecInfo,
    /// Dense rank of the bandwidth within the adaptation set, lowest is 0.
    pub quality_index: usize,
    pub doc_ref: DocRef,
    pub(crate) state: Mutex<RepresentationState>,
}

impl Representation {
    pub(crate) fn new(id: String, bandwidth: u64, codec: CodecInfo, doc_ref: DocRef) -> Self {
        Self {
            id,
            bandwidth,
            codec,
            quality_index: 0,
            doc_ref,
            state: Mutex::new(RepresentationState {
                usable: true,
                unusable_reason: None,
                warned: WarnedOnce::default(),
                index_pending: false,
            }),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.state.lock().unwrap().usable
    }

    pub fn unusable_reason(&self) -> Option<String> {
        self.state.lock().unwrap().unusable_reason.clone()
    }

    pub fn mark_unusable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock().unwrap();
        if state.usable {
            tracing::warn!(representation = %self.id, reason = %reason, "Representation is no longer usable");
        }
        state.usable = false;
        state.unusable_reason = Some(reason);
    }

    /// Called when a remote segment index load handed out by the segment search has completed.
    pub fn segment_index_loaded(&self, success: bool) {
        let mut state = self.state.lock().unwrap();
        state.index_pending = false;
        if !success {
            state.usable = false;
            state.unusable_reason = Some("Segment index could not be loaded".to_string());
        }
    }

    /// Runs `f` on the warned-once flags and returns whether the warning should be logged now.
    pub(crate) fn warn_once(&self, flag: impl FnOnce(&mut WarnedOnce) -> &mut bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let warned = flag(&mut state.warned);
        !std::mem::replace(warned, true)
    }
}
