//! Segment lookup over the three supported addressing schemes.
//!
//! * `SegmentBase`: subsegments of a (remote) `sidx`.
//! * `SegmentTemplate` with `@duration`: number based addressing.
//! * `SegmentTemplate` with `SegmentTimeline`: explicit `<S t d r n>` entries.
//!
//! `SegmentList` addressing is not supported.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    document::MpdDocument,
    manifest::Representation,
    template::Template,
    url::{apply_url_queries, collect_url_queries, parse_range_attr, resolve_base_url, resolve_segment_url},
    xml::Element,
};
use crate::{
    mp4::SegmentIndex,
    session::PlayerSession,
    time::{TimeFraction, TimeValue},
    util::ByteRange,
};

/// How the segment is chosen relative to the search time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchType {
    /// The segment whose start is nearest.
    Closest,
    /// The first segment starting at or after the time.
    After,
    /// The first segment starting after the time.
    StrictlyAfter,
    /// The segment containing the time.
    Same,
    /// The segment starting at or before the time.
    Before,
    /// The segment before the one containing the time.
    StrictlyBefore,
}

impl SearchType {
    fn prefers_earlier(&self) -> bool {
        matches!(
            self,
            SearchType::Closest | SearchType::Same | SearchType::Before | SearchType::StrictlyBefore
        )
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub period_local_time: TimeValue,
    pub period_duration: TimeValue,
    pub has_following_period: bool,
    pub search_type: SearchType,
}

/// An `InbandEventStream` declared for a representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InbandEventStream {
    pub scheme_id_uri: String,
    pub value: Option<String>,
    pub presentation_time_offset: i64,
    pub timescale: u32,
}

pub(crate) fn collect_inband_event_streams(levels: &[Element<'_>]) -> Vec<InbandEventStream> {
    levels
        .iter()
        .flat_map(|level| level.children_named("InbandEventStream"))
        .filter_map(|stream| {
            Some(InbandEventStream {
                scheme_id_uri: stream.attr("schemeIdUri")?.to_string(),
                value: stream.attr("value").map(str::to_string),
                presentation_time_offset: stream.attr_i64("presentationTimeOffset").unwrap_or(0),
                timescale: stream.attr_u64("timescale").unwrap_or(1) as u32,
            })
        })
        .collect()
}

/// One concrete segment. Built fresh for every request and owned by it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentInformation {
    pub media_url: String,
    pub media_range: Option<ByteRange>,
    pub init_url: Option<String>,
    pub init_range: Option<ByteRange>,
    /// Presentation time offset in `timescale` units.
    pub pto: i64,
    pub ept_delta: i64,
    /// Segment start in `timescale` units, including the PTO.
    pub time: i64,
    pub duration: i64,
    pub timescale: u32,
    /// [`GAP_NUMBER`] for timeline gaps.
    pub number: i64,
    pub sub_index: i64,
    /// First and last wanted access unit time, media local in `timescale` units.
    pub first_au_time: i64,
    pub last_au_time: i64,
    pub availability_time_offset: TimeValue,
    pub inband_event_streams: Vec<InbandEventStream>,
    pub may_be_missing: bool,
    pub is_missing: bool,
    pub is_last_in_period: bool,
    pub is_eos: bool,
    pub is_init_segment_required: bool,
    pub sap_type: u8,
    pub number_of_bytes: u64,
    pub bitrate: u64,
    pub custom_headers: Vec<(String, String)>,
    /// Set by the stream handler when the segment carried the `lmsg` brand.
    pub saw_lmsg: bool,
}

impl SegmentInformation {
    /// Period local start time of the segment.
    pub fn period_local_start(&self) -> TimeValue {
        TimeFraction::new(self.time - self.pto, self.timescale).as_time_value()
    }

    pub fn duration_time(&self) -> TimeValue {
        TimeFraction::new(self.duration, self.timescale).as_time_value()
    }

    /// Segment availability start time: the wallclock time at which the whole segment can be
    /// fetched.
    pub fn calculate_asast(&self, ast: TimeValue, period_start: TimeValue, is_static: bool) -> TimeValue {
        if is_static {
            return ast + period_start;
        }
        let end = TimeFraction::new(self.time - self.pto + self.duration, self.timescale).as_time_value();
        ast + period_start + end - self.availability_time_offset.or(TimeValue::zero())
    }

    /// Segment availability end time.
    pub fn calculate_saet(
        &self,
        ast: TimeValue,
        period_start: TimeValue,
        availability_end_time: TimeValue,
        time_shift_buffer_depth: TimeValue,
        is_static: bool,
    ) -> TimeValue {
        if is_static || !time_shift_buffer_depth.is_valid() {
            return availability_end_time.or(TimeValue::positive_infinity());
        }
        let end = TimeFraction::new(self.time - self.pto + self.duration, self.timescale).as_time_value();
        let saet = ast + period_start + end + time_shift_buffer_depth;
        saet.min(availability_end_time.or(TimeValue::positive_infinity()))
    }
}

/// A document fragment that has to be fetched before the search can be repeated.
#[derive(Debug, Clone)]
pub struct RemoteLoad {
    pub url: String,
    pub range: Option<ByteRange>,
    pub representation: Weak<Representation>,
}

#[derive(Debug, Clone)]
pub enum SearchResult {
    Found(Box<SegmentInformation>),
    PastEndOfStream,
    /// Execute the loads and search again. An empty list means a load is already underway.
    NeedElement(Vec<RemoteLoad>),
    /// The representation cannot be used; it has been marked unusable.
    BadType,
    /// The manifest the representation belongs to has been replaced.
    Gone,
}

/// Duration and size of an upcoming segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentSize {
    pub duration: TimeValue,
    pub bitrate: u64,
    pub byte_size: u64,
}

const FIXED_LOOKAHEAD_DURATION_SECONDS: f64 = 2.0;

/// The representation element and its ancestors.
struct Scope<'a> {
    document: &'a MpdDocument,
    mpd: Element<'a>,
    period: Element<'a>,
    adaptation_set: Element<'a>,
    representation: Element<'a>,
}

impl<'a> Scope<'a> {
    fn new(document: &'a MpdDocument, representation: Element<'a>) -> Option<Self> {
        let adaptation_set = representation.parent()?;
        let period = adaptation_set.parent()?;
        let mpd = period.parent()?;
        Some(Self {
            document,
            mpd,
            period,
            adaptation_set,
            representation,
        })
    }

    /// Levels that can carry segment addressing, innermost first.
    fn addressing_levels(&self) -> [Element<'a>; 3] {
        [self.representation, self.adaptation_set, self.period]
    }

    fn hierarchy(&self) -> [Element<'a>; 4] {
        [self.mpd, self.period, self.adaptation_set, self.representation]
    }

    fn children(&self, name: &'static str) -> Vec<Element<'a>> {
        self.addressing_levels()
            .into_iter()
            .filter_map(|level| level.child(name))
            .collect()
    }

    fn base_url(&self, session: &PlayerSession) -> Option<Url> {
        let location = session.service_location();
        match resolve_base_url(self.document.url(), &self.hierarchy(), location.as_deref()) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(error = %e, "Could not resolve the BaseURL hierarchy");
                None
            }
        }
    }

    fn finish_url(&self, url: Url) -> String {
        let queries = collect_url_queries(&self.hierarchy());
        apply_url_queries(url, self.document.url(), &queries).to_string()
    }
}

/// First value of `name` along `elements`, innermost first.
fn inherited<'a>(elements: &[Element<'a>], name: &str) -> Option<&'a str> {
    elements.iter().find_map(|e| e.attr(name))
}

fn inherited_i64(elements: &[Element<'_>], name: &str) -> Option<i64> {
    elements.iter().find_map(|e| e.attr_i64(name))
}

fn availability_time_offset(elements: &[Element<'_>]) -> TimeValue {
    let seconds: f64 = elements
        .iter()
        .filter_map(|e| match e.attr("availabilityTimeOffset")? {
            "INF" => Some(f64::INFINITY),
            value => value.parse().ok(),
        })
        .sum();
    TimeValue::from_seconds(seconds)
}

/// `$Number$` of a timeline gap. Gaps are not part of the numbering.
pub const GAP_NUMBER: i64 = -1;

#[derive(Debug, Clone, Copy)]
struct TimelineEntry {
    t: Option<i64>,
    d: Option<i64>,
    r: i64,
    n: Option<i64>,
    k: Option<i64>,
}

/// A run of equally long timeline segments after `r` has been resolved.
#[derive(Debug, Clone, Copy)]
struct TimelineRun {
    t: i64,
    d: i64,
    repeat: i64,
    n: i64,
    is_gap: bool,
}

#[derive(Debug, Clone, Copy)]
struct TimelineSegment {
    t: i64,
    d: i64,
    n: i64,
    is_gap: bool,
}

impl Representation {
    /// Locates the segment for `options` in this representation.
    pub fn find_segment(self: &Arc<Self>, session: &PlayerSession, options: &SearchOptions) -> SearchResult {
        if !self.is_usable() {
            return SearchResult::BadType;
        }
        let Some(document) = session.documents().resolve(self.doc_ref) else {
            return SearchResult::Gone;
        };
        let Some(scope) = Scope::new(&document, document.element(self.doc_ref.node)) else {
            self.mark_unusable("Representation is not part of a period");
            return SearchResult::BadType;
        };

        if scope
            .addressing_levels()
            .iter()
            .any(|level| level.child("SegmentList").is_some())
        {
            self.mark_unusable("SegmentList addressing is not supported");
            return SearchResult::BadType;
        }
        // SegmentBase and SegmentTemplate must not be mixed on the same level.
        for level in scope.addressing_levels() {
            let has_base = level.child("SegmentBase").is_some();
            let has_template = level.child("SegmentTemplate").is_some();
            if has_base && has_template {
                self.mark_unusable("SegmentBase and SegmentTemplate on the same level");
                return SearchResult::BadType;
            }
            if has_base || has_template {
                break;
            }
        }

        let bases = scope.children("SegmentBase");
        let templates = scope.children("SegmentTemplate");
        if !bases.is_empty() {
            self.find_in_segment_base(session, &scope, &bases, options)
        } else if templates.is_empty() {
            self.mark_unusable("No supported segment addressing found");
            SearchResult::BadType
        } else if templates.iter().any(|t| t.child("SegmentTimeline").is_some()) {
            self.find_in_timeline(session, &scope, &templates, options)
        } else {
            self.find_in_template(session, &scope, &templates, options)
        }
    }

    /// Returns the segment index for `SegmentBase` addressing, or the result to hand out while
    /// it is not available.
    fn prepare_segment_index(
        self: &Arc<Self>,
        session: &PlayerSession,
        scope: &Scope<'_>,
        bases: &[Element<'_>],
    ) -> Result<(Arc<SegmentIndex>, ByteRange), SearchResult> {
        if self.state.lock().unwrap().index_pending {
            return Err(SearchResult::NeedElement(Vec::new()));
        }
        let (url, range) = self.segment_index_location(session, scope, bases).ok_or_else(|| {
            self.mark_unusable("Segment index location cannot be determined");
            SearchResult::BadType
        })?;

        if let Some(sidx) = session.entity_cache().get_segment_index(&url, Some(range)) {
            return Ok((sidx, range));
        }
        self.state.lock().unwrap().index_pending = true;
        Err(SearchResult::NeedElement(vec![RemoteLoad {
            url,
            range: Some(range),
            representation: Arc::downgrade(self),
        }]))
    }

    fn segment_index_location(
        &self,
        session: &PlayerSession,
        scope: &Scope<'_>,
        bases: &[Element<'_>],
    ) -> Option<(String, ByteRange)> {
        let range = bases
            .iter()
            .find_map(|base| parse_range_attr(base, "indexRange"))
            .or_else(|| {
                let index = bases.iter().find_map(|base| base.child("RepresentationIndex"))?;
                if index.has_attr("sourceURL") && self.warn_once(|w| &mut w.index_source_url) {
                    tracing::warn!(representation = %self.id, "RepresentationIndex@sourceURL is not supported, using the media URL");
                }
                parse_range_attr(&index, "range")
            })?;
        let url = scope.base_url(session)?;
        Some((scope.finish_url(url), range))
    }

    fn find_in_segment_base(
        self: &Arc<Self>,
        session: &PlayerSession,
        scope: &Scope<'_>,
        bases: &[Element<'_>],
        options: &SearchOptions,
    ) -> SearchResult {
        let (sidx, index_range) = match self.prepare_segment_index(session, scope, bases) {
            Ok(index) => index,
            Err(result) => return result,
        };
        let timescale = sidx.timescale as i64;
        if timescale == 0 {
            self.mark_unusable("Segment index has a timescale of 0");
            return SearchResult::BadType;
        }
        let mpd_timescale = inherited_i64(bases, "timescale").unwrap_or(1).max(1);
        let mut pto = inherited_i64(bases, "presentationTimeOffset").unwrap_or(0);
        if mpd_timescale != timescale {
            if bases.iter().any(|b| b.has_attr("timescale"))
                && self.warn_once(|w| &mut w.timescale_mismatch)
            {
                tracing::warn!(
                    representation = %self.id,
                    mpd = mpd_timescale,
                    sidx = timescale,
                    "SegmentBase@timescale does not match the segment index timescale"
                );
            }
            pto = TimeFraction::new(pto, mpd_timescale as u32).get_as_timebase(timescale as u64);
        }

        let search_time = (options.period_local_time.as_timebase(timescale as u64) + pto).max(0);
        let period_end = if options.period_duration.is_finite() {
            options.period_duration.as_timebase(timescale as u64) + pto
        } else {
            i64::MAX
        };
        if search_time >= period_end {
            return SearchResult::PastEndOfStream;
        }

        // (time, byte offset from the first subsegment, reference index)
        let mut positions = Vec::with_capacity(sidx.references.len());
        let mut time = sidx.earliest_presentation_time as i64;
        let mut offset = 0u64;
        let mut found = None;
        for (index, reference) in sidx.references.iter().enumerate() {
            if reference.reference_type
                || !reference.starts_with_sap
                || !matches!(reference.sap_type, 1 | 2)
                || reference.sap_delta_time != 0
            {
                self.mark_unusable("Segment index references are not supported (hierarchical or not starting with SAP 1/2)");
                return SearchResult::BadType;
            }
            positions.push((time, offset));
            if time >= search_time {
                let mut chosen = index;
                match options.search_type {
                    SearchType::Closest => {
                        if index > 0 && search_time - positions[index - 1].0 < time - search_time {
                            chosen = index - 1;
                        }
                    }
                    SearchType::After | SearchType::StrictlyAfter => {
                        if time >= period_end {
                            return SearchResult::PastEndOfStream;
                        }
                    }
                    SearchType::Same | SearchType::Before => {
                        if time > search_time && index > 0 {
                            chosen = index - 1;
                        }
                    }
                    SearchType::StrictlyBefore => {
                        if index > 0 {
                            chosen = index - 1;
                        }
                    }
                }
                found = Some(chosen);
                break;
            }
            time += reference.subsegment_duration as i64;
            offset += reference.referenced_size as u64;
        }
        // The search time lies inside the last subsegment.
        if found.is_none() && options.search_type.prefers_earlier() && search_time < time {
            found = positions.len().checked_sub(1);
        }

        let Some(index) = found else {
            return SearchResult::PastEndOfStream;
        };
        let (segment_time, segment_offset) = positions[index];
        if segment_time >= period_end {
            return SearchResult::PastEndOfStream;
        }
        let reference = &sidx.references[index];
        let duration = reference.subsegment_duration as i64;
        let bytes = reference.referenced_size as u64;
        let media_offset = sidx.first_offset
            + index_range.offset
            + index_range.length.unwrap_or(0)
            + segment_offset;

        let Some(base_url) = scope.base_url(session) else {
            self.mark_unusable("BaseURL cannot be resolved");
            return SearchResult::BadType;
        };
        let media_url = scope.finish_url(base_url.clone());
        let init = bases.iter().find_map(|base| base.child("Initialization"));
        let init_url = match init.and_then(|i| i.attr("sourceURL")) {
            Some(source) => match resolve_segment_url(&base_url, Some(source)) {
                Ok(url) => scope.finish_url(url),
                Err(_) => {
                    self.mark_unusable("Initialization@sourceURL cannot be resolved");
                    return SearchResult::BadType;
                }
            },
            None => media_url.clone(),
        };
        let init_range = init.and_then(|i| parse_range_attr(&i, "range"));

        SearchResult::Found(Box::new(SegmentInformation {
            media_url,
            media_range: Some(ByteRange::new(media_offset, Some(bytes))),
            is_init_segment_required: init.is_some(),
            init_url: init.map(|_| init_url),
            init_range,
            pto,
            time: segment_time,
            duration,
            timescale: timescale as u32,
            number: index as i64,
            first_au_time: search_time,
            last_au_time: period_end,
            availability_time_offset: availability_time_offset(bases),
            inband_event_streams: collect_inband_event_streams(&[
                scope.representation,
                scope.adaptation_set,
            ]),
            is_last_in_period: segment_time + duration >= period_end,
            sap_type: reference.sap_type,
            number_of_bytes: bytes,
            bitrate: self.bandwidth,
            ..Default::default()
        }))
    }

    fn find_in_template(
        self: &Arc<Self>,
        session: &PlayerSession,
        scope: &Scope<'_>,
        templates: &[Element<'_>],
        options: &SearchOptions,
    ) -> SearchResult {
        let pto = inherited_i64(templates, "presentationTimeOffset").unwrap_or(0);
        let timescale = inherited_i64(templates, "timescale").unwrap_or(1);
        let start_number = inherited_i64(templates, "startNumber").unwrap_or(1);
        let end_number = inherited_i64(templates, "endNumber");
        let ept_delta = inherited_i64(templates, "eptDelta").unwrap_or(0);
        if timescale <= 0 {
            self.mark_unusable("SegmentTemplate@timescale is 0");
            return SearchResult::BadType;
        }
        if timescale == 1 && self.warn_once(|w| &mut w.timescale_one) {
            tracing::warn!(representation = %self.id, "SegmentTemplate@timescale is 1, segment timing may be imprecise");
        }
        let duration = match inherited_i64(templates, "duration") {
            Some(duration) if duration > 0 => duration,
            _ => {
                self.mark_unusable("SegmentTemplate@duration is missing or 0");
                return SearchResult::BadType;
            }
        };

        let search_time = (options.period_local_time.as_timebase(timescale as u64) - ept_delta).max(0);
        let (period_duration, mut max_segments) = if options.period_duration.is_finite() {
            let period_duration = options.period_duration.as_timebase(timescale as u64) - ept_delta;
            (period_duration, (period_duration + duration - 1) / duration)
        } else {
            (i64::MAX, i64::MAX)
        };
        if let Some(end_number) = end_number {
            max_segments = max_segments.min(end_number - start_number + 1);
        }

        let mut segment = search_time / duration;
        let remainder = search_time - segment * duration;
        match options.search_type {
            SearchType::Closest => {
                if remainder > duration / 2 && segment + 1 < max_segments {
                    segment += 1;
                }
            }
            SearchType::After => {
                if remainder != 0 {
                    segment += 1;
                }
            }
            SearchType::StrictlyAfter => segment += 1,
            SearchType::StrictlyBefore => {
                if segment > 0 {
                    segment -= 1;
                }
            }
            SearchType::Same | SearchType::Before => {}
        }
        if segment >= max_segments {
            return SearchResult::PastEndOfStream;
        }

        let time = pto + ept_delta + segment * duration;
        let number = start_number + segment;
        let may_be_missing = segment + 1 >= max_segments;
        let mut info = SegmentInformation {
            pto,
            ept_delta,
            time,
            duration,
            timescale: timescale as u32,
            number,
            first_au_time: search_time + pto,
            last_au_time: period_duration.saturating_add(pto),
            availability_time_offset: availability_time_offset(templates),
            may_be_missing,
            is_last_in_period: may_be_missing && options.has_following_period,
            bitrate: self.bandwidth,
            number_of_bytes: (self.bandwidth as i128 * duration as i128 / timescale as i128 / 8) as u64,
            inband_event_streams: collect_inband_event_streams(&[
                scope.representation,
                scope.adaptation_set,
            ]),
            ..Default::default()
        };
        match self.prepare_template_urls(session, scope, templates, &mut info) {
            Ok(()) => SearchResult::Found(Box::new(info)),
            Err(result) => result,
        }
    }

    fn find_in_timeline(
        self: &Arc<Self>,
        session: &PlayerSession,
        scope: &Scope<'_>,
        templates: &[Element<'_>],
        options: &SearchOptions,
    ) -> SearchResult {
        let Some(timeline) = templates.iter().find_map(|t| t.child("SegmentTimeline")) else {
            return SearchResult::BadType;
        };
        let entries: Vec<TimelineEntry> = timeline
            .children_named("S")
            .map(|s| TimelineEntry {
                t: s.attr_i64("t"),
                d: s.attr_i64("d"),
                r: s.attr_i64("r").unwrap_or(0),
                n: s.attr_i64("n"),
                k: s.attr_i64("k"),
            })
            .collect();
        if entries.first().and_then(|s| s.d).is_none() {
            self.mark_unusable("SegmentTimeline is empty or its first entry has no duration");
            return SearchResult::BadType;
        }

        let pto = inherited_i64(templates, "presentationTimeOffset").unwrap_or(0);
        let timescale = inherited_i64(templates, "timescale").unwrap_or(1);
        let start_number = inherited_i64(templates, "startNumber").unwrap_or(1);
        let end_number = inherited_i64(templates, "endNumber").unwrap_or(i64::MAX);
        if timescale <= 0 {
            self.mark_unusable("SegmentTemplate@timescale is 0");
            return SearchResult::BadType;
        }

        let search_time = (options.period_local_time.as_timebase(timescale as u64) + pto).max(0);
        let period_end = if options.period_duration.is_finite() {
            options.period_duration.as_timebase(timescale as u64) + pto
        } else {
            i64::MAX
        };

        if entries.iter().any(|e| e.k.is_some()) && self.warn_once(|w| &mut w.timeline_k) {
            tracing::warn!(representation = %self.id, "SegmentTimeline S@k is not supported and is ignored");
        }
        let Some(runs) = self.resolve_timeline(&entries, timescale, start_number, period_end) else {
            return SearchResult::BadType;
        };

        let first = runs[0];
        let mut found = None;
        if first.t > search_time {
            let gap = first.t - search_time;
            if gap as f64 / timescale as f64 > 0.1 && self.warn_once(|w| &mut w.timeline_start_gap) {
                tracing::warn!(
                    representation = %self.id,
                    "SegmentTimeline starts {:.3}s after the search time",
                    gap as f64 / timescale as f64
                );
            }
            found = Some(TimelineSegment {
                t: first.t,
                d: first.d,
                n: first.n,
                is_gap: first.is_gap,
            });
        } else {
            let mut previous: Option<TimelineSegment> = None;
            'runs: for run in &runs {
                for k in 0..=run.repeat {
                    let segment = TimelineSegment {
                        t: run.t + k * run.d,
                        d: run.d,
                        n: run.n + k,
                        is_gap: run.is_gap,
                    };
                    if segment.n > end_number {
                        break 'runs;
                    }
                    if segment.t >= search_time {
                        let chosen = match (options.search_type, previous) {
                            (SearchType::Closest, Some(prev))
                                if search_time - prev.t < segment.t - search_time =>
                            {
                                prev
                            }
                            (SearchType::Same | SearchType::Before, Some(prev))
                                if segment.t > search_time =>
                            {
                                prev
                            }
                            (SearchType::StrictlyBefore, Some(prev)) => prev,
                            (SearchType::StrictlyAfter, _) if segment.t == search_time => {
                                previous = Some(segment);
                                continue;
                            }
                            _ => segment,
                        };
                        found = Some(chosen);
                        break 'runs;
                    }
                    previous = Some(segment);
                }
            }
            if found.is_none() && options.search_type.prefers_earlier() {
                found = previous.filter(|last| search_time < last.t + last.d);
            }
        }

        let Some(segment) = found.filter(|s| s.t < period_end) else {
            return SearchResult::PastEndOfStream;
        };

        let may_be_missing = segment.t + segment.d >= period_end;
        let mut info = SegmentInformation {
            pto,
            time: segment.t,
            duration: segment.d,
            timescale: timescale as u32,
            number: segment.n,
            first_au_time: search_time,
            last_au_time: period_end,
            availability_time_offset: availability_time_offset(templates),
            may_be_missing: may_be_missing || segment.is_gap,
            is_missing: segment.is_gap,
            is_last_in_period: may_be_missing && options.has_following_period,
            bitrate: self.bandwidth,
            number_of_bytes: (self.bandwidth as i128 * segment.d as i128 / timescale as i128 / 8) as u64,
            inband_event_streams: collect_inband_event_streams(&[
                scope.representation,
                scope.adaptation_set,
            ]),
            ..Default::default()
        };
        if segment.is_gap && self.warn_once(|w| &mut w.timeline_gap) {
            tracing::warn!(
                representation = %self.id,
                time = segment.t,
                "SegmentTimeline has a gap, the segment is treated as missing"
            );
        }
        if segment.is_gap {
            // Never fetched, so there is no URL to build.
            return SearchResult::Found(Box::new(info));
        }
        match self.prepare_template_urls(session, scope, templates, &mut info) {
            Ok(()) => SearchResult::Found(Box::new(info)),
            Err(result) => result,
        }
    }

    /// Expands `r=-1`, fills gaps with missing segments and checks the numbering.
    fn resolve_timeline(
        &self,
        entries: &[TimelineEntry],
        timescale: i64,
        start_number: i64,
        period_end: i64,
    ) -> Option<Vec<TimelineRun>> {
        // Differences below 20ms are rounding noise.
        let tolerance = (timescale * 20 / 1000).max(1);
        let mut runs = Vec::with_capacity(entries.len());
        let mut expected_t = entries[0].t.unwrap_or(0);
        let mut expected_n = entries[0].n.unwrap_or(start_number);

        for (index, entry) in entries.iter().enumerate() {
            let d = match entry.d {
                Some(d) if d > 0 => d,
                _ => {
                    self.mark_unusable("SegmentTimeline S@d is missing or 0");
                    return None;
                }
            };
            let t = entry.t.unwrap_or(expected_t);
            let n = entry.n.unwrap_or(expected_n);
            if n > u32::MAX as i64 && self.warn_once(|w| &mut w.number_overflow) {
                tracing::warn!(representation = %self.id, "SegmentTimeline segment number exceeds 32 bits");
            }
            if entry.n.is_some() && n != expected_n && self.warn_once(|w| &mut w.inconsistent_numbering) {
                tracing::warn!(representation = %self.id, expected = expected_n, found = n, "SegmentTimeline S@n is inconsistent");
            }

            if index > 0 {
                let diff = t - expected_t;
                if diff <= -tolerance {
                    if self.warn_once(|w| &mut w.timeline_overlap) {
                        tracing::warn!(representation = %self.id, "SegmentTimeline entries overlap by {} units", -diff);
                    }
                } else if diff >= tolerance {
                    runs.push(TimelineRun {
                        t: expected_t,
                        d: diff,
                        repeat: 0,
                        n: GAP_NUMBER,
                        is_gap: true,
                    });
                }
            }

            let repeat = if entry.r < 0 {
                let end = match entries.get(index + 1) {
                    Some(TimelineEntry { t: Some(next_t), .. }) => *next_t,
                    Some(_) => {
                        if self.warn_once(|w| &mut w.no_t_after_negative_r) {
                            tracing::warn!(representation = %self.id, "SegmentTimeline S@r is negative but the next S has no @t");
                        }
                        period_end
                    }
                    None => period_end,
                };
                if end == i64::MAX {
                    self.mark_unusable("SegmentTimeline S@r=-1 in an open ended period");
                    return None;
                }
                let repeat = (end - t + d - 1) / d - 1;
                if repeat < 0 {
                    self.mark_unusable("SegmentTimeline S@r=-1 does not resolve to any segment");
                    return None;
                }
                repeat
            } else {
                entry.r
            };

            runs.push(TimelineRun {
                t,
                d,
                repeat,
                n,
                is_gap: false,
            });
            expected_t = t + d * (repeat + 1);
            expected_n = n + repeat + 1;
        }
        Some(runs)
    }

    fn prepare_template_urls(
        &self,
        session: &PlayerSession,
        scope: &Scope<'_>,
        templates: &[Element<'_>],
        info: &mut SegmentInformation,
    ) -> Result<(), SearchResult> {
        let Some(base_url) = scope.base_url(session) else {
            self.mark_unusable("BaseURL cannot be resolved");
            return Err(SearchResult::BadType);
        };

        let mut template = Template::new();
        template.insert(Template::REPRESENTATION_ID, &self.id);
        template.insert(Template::BANDWIDTH, self.bandwidth);
        let init = inherited(templates, "initialization")
            .map(|init| template.resolve(init).ok_or(init));

        template.insert(Template::NUMBER, info.number);
        template.insert(Template::TIME, info.time);
        template.insert(Template::SUB_NUMBER, info.sub_index);
        let media = inherited(templates, "media").map(|media| template.resolve(media).ok_or(media));

        let resolve = |resolved: Result<String, &str>| -> Result<String, SearchResult> {
            let relative = resolved.map_err(|raw| {
                self.mark_unusable(format!("Unsupported SegmentTemplate \"{raw}\""));
                SearchResult::BadType
            })?;
            let url = resolve_segment_url(&base_url, Some(&relative)).map_err(|_| {
                self.mark_unusable(format!("Segment URL \"{relative}\" cannot be resolved"));
                SearchResult::BadType
            })?;
            Ok(scope.finish_url(url))
        };

        info.media_url = match media {
            Some(media) => resolve(media)?,
            None => scope.finish_url(base_url.clone()),
        };
        if let Some(init) = init {
            info.init_url = Some(resolve(init)?);
            info.is_init_segment_required = true;
        }
        Ok(())
    }

    /// Durations and sizes of the segments following `current` covering `look_ahead`, and
    /// their average duration.
    pub fn segment_information(
        &self,
        session: &PlayerSession,
        current: Option<&SegmentInformation>,
        look_ahead: TimeValue,
    ) -> (Vec<SegmentSize>, TimeValue) {
        let mut segments = Vec::new();
        let mut remaining = look_ahead;
        let fixed = TimeValue::from_seconds(FIXED_LOOKAHEAD_DURATION_SECONDS);
        let mut fixed_duration = fixed;

        if let Some(document) = session.documents().resolve(self.doc_ref) {
            if let Some(scope) = Scope::new(&document, document.element(self.doc_ref.node)) {
                let bases = scope.children("SegmentBase");
                let templates = scope.children("SegmentTemplate");
                if !bases.is_empty() {
                    self.segment_base_lookahead(session, &scope, &bases, current, &mut remaining, &mut segments);
                } else if let Some(timeline) = templates.iter().find_map(|t| t.child("SegmentTimeline")) {
                    let timescale = inherited_i64(&templates, "timescale").unwrap_or(1).max(1);
                    let start = current.map(|c| c.time + c.duration).unwrap_or(0);
                    let mut t = 0;
                    for s in timeline.children_named("S") {
                        let d = s.attr_i64("d").unwrap_or(0);
                        if d <= 0 {
                            break;
                        }
                        t = s.attr_i64("t").unwrap_or(t);
                        let repeat = s.attr_i64("r").unwrap_or(0);
                        let mut k = 0;
                        while (repeat < 0 || k <= repeat) && remaining > TimeValue::zero() {
                            if t >= start {
                                let duration = TimeValue::from_timebase(d, timescale as u64);
                                segments.push(SegmentSize {
                                    duration,
                                    bitrate: self.bandwidth,
                                    byte_size: (self.bandwidth as i128 * d as i128 / timescale as i128 / 8) as u64,
                                });
                                remaining -= duration;
                            }
                            t += d;
                            k += 1;
                        }
                    }
                } else if let Some(duration) = inherited_i64(&templates, "duration") {
                    let timescale = inherited_i64(&templates, "timescale").unwrap_or(1);
                    if duration > 0 && timescale > 0 {
                        fixed_duration = TimeValue::from_timebase(duration, timescale as u64);
                    }
                }
            }
        }

        while remaining > TimeValue::zero() {
            let seconds = fixed_duration.as_seconds();
            segments.push(SegmentSize {
                duration: fixed_duration,
                bitrate: self.bandwidth,
                byte_size: (self.bandwidth as f64 * seconds / 8.0) as u64,
            });
            remaining -= fixed_duration;
        }

        let average = match segments.len() {
            0 => fixed,
            count => {
                let total = segments
                    .iter()
                    .fold(TimeValue::zero(), |sum, s| sum + s.duration);
                total / count as i64
            }
        };
        (segments, average)
    }

    fn segment_base_lookahead(
        &self,
        session: &PlayerSession,
        scope: &Scope<'_>,
        bases: &[Element<'_>],
        current: Option<&SegmentInformation>,
        remaining: &mut TimeValue,
        segments: &mut Vec<SegmentSize>,
    ) {
        // The index of a sibling gives the durations when ours is not loaded yet, but not the
        // sizes.
        let own = self
            .segment_index_location(session, scope, bases)
            .and_then(|(url, range)| session.entity_cache().get_segment_index(&url, Some(range)));
        let (sidx, exact_sizes) = match own {
            Some(sidx) => (sidx, true),
            None => {
                let sibling = scope
                    .adaptation_set
                    .children_named("Representation")
                    .filter(|r| r.id() != scope.representation.id())
                    .find_map(|sibling| {
                        let sibling_scope = Scope::new(scope.document, sibling)?;
                        let sibling_bases = sibling_scope.children("SegmentBase");
                        let (url, range) =
                            self.segment_index_location(session, &sibling_scope, &sibling_bases)?;
                        session.entity_cache().get_segment_index(&url, Some(range))
                    });
                match sibling {
                    Some(sidx) => (sidx, false),
                    None => return,
                }
            }
        };
        if sidx.timescale == 0 {
            return;
        }
        let start = current
            .map(|c| {
                TimeFraction::new(c.time + c.duration, c.timescale).get_as_timebase(sidx.timescale as u64)
            })
            .unwrap_or(0);
        let mut time = sidx.earliest_presentation_time as i64;
        for reference in &sidx.references {
            if *remaining <= TimeValue::zero() {
                break;
            }
            let d = reference.subsegment_duration as i64;
            if time >= start {
                let duration = TimeValue::from_timebase(d, sidx.timescale as u64);
                let byte_size = if exact_sizes {
                    reference.referenced_size as u64
                } else {
                    (self.bandwidth as f64 * duration.as_seconds() / 8.0) as u64
                };
                segments.push(SegmentSize {
                    duration,
                    bitrate: self.bandwidth,
                    byte_size,
                });
                *remaining -= duration;
            }
            time += d;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::session_with_manifest;

    const TIMELINE: &str = r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" minBufferTime="PT2S" mediaPresentationDuration="PT10S">
  <Period id="p0">
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate timescale="1000" media="v/$Time$.m4s" initialization="v/init.mp4">
        <SegmentTimeline>
          <S t="0" d="2000" r="1"/>
          <S t="5000" d="2000" r="-1"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v1" bandwidth="500000" codecs="avc1.4d401f" width="640" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    const NUMBERED: &str = r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" minBufferTime="PT2S" mediaPresentationDuration="PT10S">
  <Period id="p0">
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate timescale="90000" duration="180000" startNumber="1"
        media="$RepresentationID$/seg-$Number%05d$-$$.m4s" initialization="$RepresentationID$/init.mp4"/>
      <Representation id="v1" bandwidth="500000" codecs="avc1.4d401f" width="640" height="360"/>
      <Representation id="v2" bandwidth="900000" codecs="avc1.4d401f" width="1280" height="720">
        <SegmentTemplate media="$Foo$.m4s"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn search(xml: &str, representation: usize, seconds: f64, search_type: SearchType) -> SearchResult {
        let (session, manifest) = session_with_manifest(xml);
        let period = &manifest.periods[0];
        let representation = period.adaptation_sets[0].representations[representation].clone();
        representation.find_segment(
            &session,
            &SearchOptions {
                period_local_time: TimeValue::from_seconds(seconds),
                period_duration: period.get_duration(),
                has_following_period: false,
                search_type,
            },
        )
    }

    fn found(result: SearchResult) -> SegmentInformation {
        match result {
            SearchResult::Found(info) => *info,
            other => panic!("expected a segment, got {other:?}"),
        }
    }

    #[test]
    fn test_timeline_repeat_runs_to_period_end() {
        let info = found(search(TIMELINE, 0, 9.5, SearchType::Closest));
        assert_eq!(info.time, 9000);
        assert_eq!(info.duration, 2000);
        assert!(info.may_be_missing);
        assert_eq!(info.media_url, "http://localhost/content/v/9000.m4s");
        assert_eq!(info.init_url.as_deref(), Some("http://localhost/content/v/init.mp4"));
        assert!(info.is_init_segment_required);

        assert!(matches!(
            search(TIMELINE, 0, 9.5, SearchType::After),
            SearchResult::PastEndOfStream
        ));
    }

    #[test]
    fn test_timeline_gap_is_missing_segment() {
        let gap = found(search(TIMELINE, 0, 4.2, SearchType::Closest));
        assert_eq!(gap.time, 4000);
        assert_eq!(gap.duration, 1000);
        assert!(gap.is_missing);
        assert!(gap.may_be_missing);

        let after = found(search(TIMELINE, 0, 4.2, SearchType::After));
        assert_eq!(after.time, 5000);
        assert!(!after.is_missing);
    }

    #[test]
    fn test_timeline_gap_does_not_reuse_numbers() {
        let before = found(search(TIMELINE, 0, 2.5, SearchType::Closest));
        let gap = found(search(TIMELINE, 0, 4.2, SearchType::Closest));
        let after = found(search(TIMELINE, 0, 5.0, SearchType::Closest));
        assert_eq!(before.number, 2);
        assert_eq!(gap.number, GAP_NUMBER);
        assert!(gap.media_url.is_empty());
        assert_eq!(after.number, 3);
    }

    #[test]
    fn test_timeline_k_is_ignored() {
        let xml = TIMELINE.replace(
            r#"<S t="5000" d="2000" r="-1"/>"#,
            r#"<S t="4000" d="2000" r="2" k="2"/>"#,
        );
        let (session, manifest) = session_with_manifest(&xml);
        let period = &manifest.periods[0];
        let representation = period.adaptation_sets[0].representations[0].clone();
        let mut options = SearchOptions {
            period_local_time: TimeValue::from_seconds(0.5),
            period_duration: period.get_duration(),
            has_following_period: false,
            search_type: SearchType::Closest,
        };
        let first = found(representation.find_segment(&session, &options));
        assert_eq!(first.time, 0);
        assert_eq!(first.media_url, "http://localhost/content/v/0.m4s");

        options.period_local_time = TimeValue::from_seconds(6.5);
        let with_k = found(representation.find_segment(&session, &options));
        assert_eq!(with_k.time, 6000);
        assert!(representation.is_usable());
    }

    #[test]
    fn test_numbered_template_search() {
        let closest = found(search(NUMBERED, 0, 3.1, SearchType::Closest));
        assert_eq!(closest.number, 3);
        assert_eq!(closest.time, 360000);
        assert_eq!(closest.media_url, "http://localhost/content/v1/seg-00003-$.m4s");
        assert_eq!(closest.period_local_start(), TimeValue::from_seconds(4.0));

        assert_eq!(found(search(NUMBERED, 0, 3.0, SearchType::After)).number, 3);
        assert_eq!(found(search(NUMBERED, 0, 3.9, SearchType::Before)).number, 2);

        let last = found(search(NUMBERED, 0, 9.0, SearchType::Closest));
        assert_eq!(last.number, 5);
        assert!(last.may_be_missing);
        assert!(matches!(
            search(NUMBERED, 0, 9.0, SearchType::After),
            SearchResult::PastEndOfStream
        ));
    }

    #[test]
    fn test_unknown_identifier_makes_representation_unusable() {
        let (session, manifest) = session_with_manifest(NUMBERED);
        let period = &manifest.periods[0];
        let representation = period.adaptation_sets[0].representations[1].clone();
        let options = SearchOptions {
            period_local_time: TimeValue::zero(),
            period_duration: period.get_duration(),
            has_following_period: false,
            search_type: SearchType::Closest,
        };
        assert!(matches!(
            representation.find_segment(&session, &options),
            SearchResult::BadType
        ));
        assert!(!representation.is_usable());
        assert!(representation.unusable_reason().unwrap().contains("$Foo$"));
    }

    #[test]
    fn test_lookahead_uses_template_duration() {
        let (session, manifest) = session_with_manifest(NUMBERED);
        let representation = manifest.periods[0].adaptation_sets[0].representations[0].clone();
        let (segments, average) =
            representation.segment_information(&session, None, TimeValue::from_seconds(5.0));
        assert_eq!(segments.len(), 3);
        assert_eq!(average, TimeValue::from_seconds(2.0));
        assert_eq!(segments[0].byte_size, 125000);
    }
}
