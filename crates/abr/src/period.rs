//! The period being played: which representation is selected per stream type and how the next
//! segment request is derived from the previous one.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    error::{PlayerError, PlayerResult},
    mpd::{
        AdaptationSet, Manifest, Period, Representation, SearchOptions, SearchResult, SearchType,
        SegmentInformation, SegmentSize,
    },
    reader::{PlaylistReader, UpdateKind},
    request::{DownloadStats, StreamSegmentRequest},
    session::PlayerSession,
    time::TimeValue,
    StreamType,
};

const RETRY_AFTER_INDEX_LOAD: Duration = Duration::from_millis(100);
const RETRY_AFTER_FORCED_UPDATE: Duration = Duration::from_millis(250);

/// Outcome of deriving a segment request.
#[derive(Debug)]
pub enum SegmentResult {
    Found(Box<StreamSegmentRequest>),
    PastEos,
    TryAgainLater(Duration),
    NotFound,
    BadType,
}

#[derive(Debug, Clone)]
struct Selection {
    adaptation_set_id: String,
    representation_id: String,
}

#[derive(Debug, Default)]
struct PeriodState {
    selections: HashMap<StreamType, Selection>,
    segment_fetch_delay: TimeValue,
    playback_sequence_id: u32,
}

pub struct PlayPeriod {
    session: Arc<PlayerSession>,
    reader: Option<Arc<PlaylistReader>>,
    period_id: String,
    state: Mutex<PeriodState>,
}

impl PlayPeriod {
    pub fn new(
        session: Arc<PlayerSession>,
        reader: Option<Arc<PlaylistReader>>,
        period_id: impl Into<String>,
    ) -> Self {
        Self {
            session,
            reader,
            period_id: period_id.into(),
            state: Mutex::new(PeriodState {
                segment_fetch_delay: TimeValue::zero(),
                ..Default::default()
            }),
        }
    }

    pub fn period_id(&self) -> &str {
        &self.period_id
    }

    /// The period in the current manifest. Selections are kept by ID so they survive manifest
    /// updates.
    pub fn period(&self) -> Option<(Arc<Manifest>, Arc<Period>)> {
        let manifest = self.session.manifest()?;
        let period = manifest.period_by_id(&self.period_id)?;
        Some((manifest, period))
    }

    /// Chooses the initial adaptation set and representation of every stream type.
    pub fn prepare_for_play(&self) -> PlayerResult<()> {
        let (_, period) = self
            .period()
            .ok_or_else(|| PlayerError::PeriodNotFound(self.period_id.clone()))?;
        let initial_bandwidth = self.session.options().get_i64_or("abr.initial_bandwidth", 1_000_000);
        let language = self.session.options().get("dash.preferred_language").and_then(|v| v.as_str());

        let mut state = self.state.lock().unwrap();
        state.selections.clear();
        for stream_type in [StreamType::Video, StreamType::Audio, StreamType::Subtitle] {
            let mut sets: Vec<_> = period
                .adaptation_sets_of_type(stream_type)
                .filter(|a| a.representations.iter().any(|r| r.is_usable()))
                .collect();
            sets.sort_by_key(|a| {
                (
                    language.is_some_and(|l| a.language.as_deref() != Some(l)),
                    !a.has_role("main"),
                    a.index,
                )
            });
            let Some(adaptation_set) = sets.first() else {
                continue;
            };
            let Some(representation) =
                adaptation_set.representation_by_max_bandwidth(initial_bandwidth.max(0) as u64)
            else {
                continue;
            };
            tracing::info!(
                period = %self.period_id,
                %stream_type,
                adaptation_set = %adaptation_set.id,
                representation = %representation.id,
                bandwidth = representation.bandwidth,
                "Selected initial stream"
            );
            state.selections.insert(
                stream_type,
                Selection {
                    adaptation_set_id: adaptation_set.id.clone(),
                    representation_id: representation.id.clone(),
                },
            );
        }
        Ok(())
    }

    /// Stream types with a selected adaptation set, video first.
    pub fn stream_types(&self) -> Vec<StreamType> {
        let state = self.state.lock().unwrap();
        let mut types: Vec<_> = state.selections.keys().copied().collect();
        types.sort();
        types
    }

    pub fn select_stream(&self, adaptation_set_id: &str, representation_id: &str) {
        let Some((_, period)) = self.period() else {
            return;
        };
        let Some(adaptation_set) = period.adaptation_set_by_id(adaptation_set_id) else {
            tracing::warn!(adaptation_set = %adaptation_set_id, "Cannot select stream of unknown adaptation set");
            return;
        };
        let mut state = self.state.lock().unwrap();
        let selection = Selection {
            adaptation_set_id: adaptation_set_id.to_string(),
            representation_id: representation_id.to_string(),
        };
        if let Some(previous) = state.selections.insert(adaptation_set.stream_type, selection) {
            if previous.representation_id != representation_id {
                tracing::info!(
                    stream_type = %adaptation_set.stream_type,
                    from = %previous.representation_id,
                    to = %representation_id,
                    "Switching representation"
                );
            }
        }
    }

    pub fn adaptation_set(&self, stream_type: StreamType) -> Option<Arc<AdaptationSet>> {
        let selection = self.state.lock().unwrap().selections.get(&stream_type)?.clone();
        let (_, period) = self.period()?;
        period.adaptation_set_by_id(&selection.adaptation_set_id)
    }

    pub fn selected_representation(&self, stream_type: StreamType) -> Option<Arc<Representation>> {
        let selection = self.state.lock().unwrap().selections.get(&stream_type)?.clone();
        self.adaptation_set(stream_type)?
            .representation_by_id(&selection.representation_id)
    }

    /// Delays the availability of all following segments, for players that cannot keep up with
    /// the live edge.
    pub fn increase_segment_fetch_delay(&self, delta: TimeValue) {
        let mut state = self.state.lock().unwrap();
        state.segment_fetch_delay += delta;
    }

    pub fn set_playback_sequence_id(&self, id: u32) {
        self.state.lock().unwrap().playback_sequence_id = id;
    }

    /// Builds the first request at `start` (relative to the availability start time).
    ///
    /// The video segment determines the start. Other streams start with the segment at or
    /// before it and are returned as dependent streams of the first request.
    pub fn get_starting_segment(&self, start: TimeValue, search_type: SearchType) -> SegmentResult {
        let Some((manifest, period)) = self.period() else {
            return SegmentResult::NotFound;
        };
        let stream_types = self.stream_types();
        let Some(&primary) = stream_types.first() else {
            return SegmentResult::NotFound;
        };

        let local = (start - period.start).max(TimeValue::zero());
        let mut request = match self.search(primary, &manifest, &period, local, search_type) {
            Ok(request) => request,
            Err(result) => return result,
        };
        request.is_initial_start_request = true;

        let aligned = request.segment.period_local_start().max(TimeValue::zero());
        for &stream_type in stream_types.iter().skip(1) {
            match self.search(stream_type, &manifest, &period, aligned, SearchType::Before) {
                Ok(mut dependent) => {
                    dependent.is_initial_start_request = true;
                    request.dependent_streams.push(dependent);
                }
                Err(SegmentResult::PastEos) => request
                    .dependent_streams
                    .push(StreamSegmentRequest::end_of_stream(stream_type, &self.period_id)),
                Err(result) => return result,
            }
        }
        SegmentResult::Found(Box::new(request))
    }

    /// The segment following `current` in the currently selected representation.
    pub fn get_next_segment(&self, current: &StreamSegmentRequest) -> SegmentResult {
        if current.is_eos_segment {
            return SegmentResult::PastEos;
        }
        let Some((manifest, period)) = self.period() else {
            return SegmentResult::NotFound;
        };
        let time = current.segment.period_local_start() + current.duration() * 3 / 4;
        self.search(current.stream_type, &manifest, &period, time, SearchType::After)
            .map_or_else(|result| result, |request| SegmentResult::Found(Box::new(request)))
    }

    /// The request repeating `current`, in the currently selected representation. With
    /// `replace_with_filler` the segment is not fetched again but filled.
    pub fn get_retry_segment(&self, current: &StreamSegmentRequest, replace_with_filler: bool) -> SegmentResult {
        let retry_count = current.retry_count + 1;
        if replace_with_filler {
            let mut request = current.clone();
            request.insert_filler = true;
            request.retry_count = retry_count;
            if current.stats.has_delivered_data() {
                let segment = &mut request.segment;
                let timescale = segment.timescale as u64;
                let resume = if current.stats.delivered_until.is_valid() {
                    (current.stats.delivered_until - current.period_start - current.timestamp_offset)
                        .as_timebase(timescale)
                        + segment.pto
                } else {
                    segment.first_au_time.max(segment.time)
                        + current.stats.duration_delivered.as_timebase(timescale)
                };
                segment.first_au_time = segment.first_au_time.max(resume);
            }
            request.stats = DownloadStats::default();
            request.dependent_streams.clear();
            return SegmentResult::Found(Box::new(request));
        }
        let Some((manifest, period)) = self.period() else {
            return SegmentResult::NotFound;
        };
        let time = current.segment.period_local_start();
        match self.search(current.stream_type, &manifest, &period, time, SearchType::Closest) {
            Ok(mut request) => {
                request.retry_count = retry_count;
                SegmentResult::Found(Box::new(request))
            }
            Err(result) => result,
        }
    }

    pub fn get_segment_information(
        &self,
        _stream_type: StreamType,
        representation: &Representation,
        current: Option<&SegmentInformation>,
        look_ahead: TimeValue,
    ) -> (Vec<SegmentSize>, TimeValue) {
        representation.segment_information(&self.session, current, look_ahead)
    }

    fn search(
        &self,
        stream_type: StreamType,
        manifest: &Manifest,
        period: &Period,
        period_local_time: TimeValue,
        search_type: SearchType,
    ) -> Result<StreamSegmentRequest, SegmentResult> {
        let (Some(adaptation_set), Some(representation)) = (
            self.adaptation_set(stream_type),
            self.selected_representation(stream_type),
        ) else {
            return Err(SegmentResult::NotFound);
        };
        let options = SearchOptions {
            period_local_time,
            period_duration: period.get_duration(),
            has_following_period: manifest.has_following_regular_period(period),
            search_type,
        };

        match representation.find_segment(&self.session, &options) {
            SearchResult::Found(segment) => Ok(self.make_request(
                stream_type,
                manifest,
                period,
                &adaptation_set,
                &representation,
                *segment,
            )),
            SearchResult::PastEndOfStream => {
                if !manifest.is_static() && !options.has_following_period {
                    // The segment may just not be in the document yet.
                    if let Some(reader) = &self.reader {
                        reader.request_mpd_update(UpdateKind::Forced);
                    }
                    Err(SegmentResult::TryAgainLater(RETRY_AFTER_FORCED_UPDATE))
                } else {
                    Err(SegmentResult::PastEos)
                }
            }
            SearchResult::NeedElement(loads) => {
                if !loads.is_empty() {
                    if let Some(reader) = &self.reader {
                        reader.add_segment_index_loads(loads);
                    }
                }
                Err(SegmentResult::TryAgainLater(RETRY_AFTER_INDEX_LOAD))
            }
            SearchResult::Gone => Err(SegmentResult::TryAgainLater(RETRY_AFTER_INDEX_LOAD)),
            SearchResult::BadType => {
                // Fall back to another representation of the same adaptation set.
                match adaptation_set.representation_by_max_bandwidth(representation.bandwidth) {
                    Some(other) if other.id != representation.id => {
                        self.select_stream(&adaptation_set.id, &other.id);
                        Err(SegmentResult::TryAgainLater(Duration::ZERO))
                    }
                    _ => Err(SegmentResult::BadType),
                }
            }
        }
    }

    fn make_request(
        &self,
        stream_type: StreamType,
        manifest: &Manifest,
        period: &Period,
        adaptation_set: &AdaptationSet,
        representation: &Representation,
        segment: SegmentInformation,
    ) -> StreamSegmentRequest {
        let state = self.state.lock().unwrap();
        let ast = manifest.anchor_time();
        let is_static = manifest.is_static();

        let mut request = StreamSegmentRequest::new(stream_type, segment);
        request.period_id = period.id.clone();
        request.adaptation_set_id = adaptation_set.id.clone();
        request.representation_id = representation.id.clone();
        request.bitrate = representation.bandwidth;
        request.quality_index = representation.quality_index;
        request.codec = Some(representation.codec.clone());
        request.playback_sequence_id = state.playback_sequence_id;
        request.period_start = period.start;
        request.ast = ast;
        if !is_static {
            request.asast =
                request.segment.calculate_asast(ast, period.start, false) + state.segment_fetch_delay;
            request.saet = request.segment.calculate_saet(
                ast,
                period.start,
                manifest.availability_end_time,
                manifest.time_shift_buffer_depth,
                false,
            );
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::session_with_manifest;

    const AUDIO_VIDEO: &str = r#"<MPD type="static" minBufferTime="PT2S" mediaPresentationDuration="PT20S">
      <Period id="p0">
        <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
          <SegmentTemplate timescale="90000" duration="180000" media="v/$RepresentationID$/$Number%05d$.m4s" initialization="v/$RepresentationID$/init.mp4"/>
          <Representation id="v1" bandwidth="800000" codecs="avc1.64001f" width="960" height="540"/>
          <Representation id="v2" bandwidth="3000000" codecs="avc1.640028" width="1920" height="1080"/>
        </AdaptationSet>
        <AdaptationSet id="a" contentType="audio" mimeType="audio/mp4" lang="en">
          <SegmentTemplate timescale="48000" duration="192000" media="a/$Number$.m4s" initialization="a/init.mp4"/>
          <Representation id="a1" bandwidth="128000" codecs="mp4a.40.2" audioSamplingRate="48000"/>
        </AdaptationSet>
      </Period>
    </MPD>"#;

    fn prepared() -> PlayPeriod {
        let (session, _manifest) = session_with_manifest(AUDIO_VIDEO);
        let period = PlayPeriod::new(session, None, "p0");
        period.prepare_for_play().unwrap();
        period
    }

    fn found(result: SegmentResult) -> StreamSegmentRequest {
        match result {
            SegmentResult::Found(request) => *request,
            other => panic!("expected a segment, got {other:?}"),
        }
    }

    #[test]
    fn test_initial_selection_respects_initial_bandwidth() {
        let period = prepared();
        assert_eq!(period.stream_types(), vec![StreamType::Video, StreamType::Audio]);
        assert_eq!(period.selected_representation(StreamType::Video).unwrap().id, "v1");
        assert_eq!(period.selected_representation(StreamType::Audio).unwrap().id, "a1");
    }

    #[test]
    fn test_starting_segment_aligns_audio_to_video() {
        let period = prepared();
        let request = found(period.get_starting_segment(TimeValue::from_seconds(5.0), SearchType::Before));
        assert_eq!(request.stream_type, StreamType::Video);
        assert_eq!(request.segment.number, 3);
        assert_eq!(request.start_time(), TimeValue::from_seconds(4.0));
        assert!(request.segment.media_url.ends_with("v/v1/00003.m4s"));

        assert_eq!(request.dependent_streams.len(), 1);
        let audio = &request.dependent_streams[0];
        assert_eq!(audio.stream_type, StreamType::Audio);
        assert_eq!(audio.start_time(), TimeValue::from_seconds(4.0));
        assert_eq!(audio.segment.number, 2);
    }

    #[test]
    fn test_next_segment_follows_switch() {
        let period = prepared();
        let first = found(period.get_starting_segment(TimeValue::zero(), SearchType::Closest));
        assert_eq!(first.segment.number, 1);

        period.select_stream("v", "v2");
        let next = found(period.get_next_segment(&first));
        assert_eq!(next.representation_id, "v2");
        assert_eq!(next.segment.number, 2);
        assert_eq!(next.start_time(), TimeValue::from_seconds(2.0));
    }

    #[test]
    fn test_past_end_of_static_presentation() {
        let period = prepared();
        let mut last = found(period.get_starting_segment(TimeValue::from_seconds(19.0), SearchType::Before));
        assert_eq!(last.segment.number, 10);
        assert!(matches!(period.get_next_segment(&last), SegmentResult::PastEos));

        last.is_eos_segment = true;
        assert!(matches!(period.get_next_segment(&last), SegmentResult::PastEos));
    }

    #[test]
    fn test_retry_segment() {
        let period = prepared();
        let first = found(period.get_starting_segment(TimeValue::from_seconds(6.0), SearchType::Closest));

        let retry = found(period.get_retry_segment(&first, false));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.segment.number, first.segment.number);
        assert!(!retry.insert_filler);

        let filler = found(period.get_retry_segment(&retry, true));
        assert_eq!(filler.retry_count, 2);
        assert!(filler.insert_filler);
        assert!(filler.dependent_streams.is_empty());
    }

    #[test]
    fn test_filler_resumes_after_delivered_data() {
        let period = prepared();
        let mut first = found(period.get_starting_segment(TimeValue::from_seconds(6.5), SearchType::Closest));
        assert_eq!(first.segment.time, 540000);
        assert_eq!(first.segment.first_au_time, 585000);

        // Half a second from the start position reached the sink before the abort.
        first.stats.duration_delivered = TimeValue::from_seconds(0.5);
        first.stats.delivered_until = TimeValue::from_seconds(7.0);
        let filler = found(period.get_retry_segment(&first, true));
        assert_eq!(filler.segment.first_au_time, 630000);
        assert!(!filler.stats.has_delivered_data());

        first.stats.delivered_until = TimeValue::invalid();
        let filler = found(period.get_retry_segment(&first, true));
        assert_eq!(filler.segment.first_au_time, 630000);
    }
}
