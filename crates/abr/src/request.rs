use std::{
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    mpd::{CodecInfo, SegmentInformation},
    time::TimeValue,
    util::ByteRange,
    StreamType,
};

/// Why the in-flight work of a stream handler is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CancelReason {
    None = 0,
    /// The handler is shutting down.
    Terminate = 1,
    Canceled = 2,
    /// Canceled without completion notification.
    Silent = 3,
    AbortedByAbr = 4,
}

/// Atomically readable [`CancelReason`].
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicU8);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> CancelReason {
        match self.0.load(Ordering::Acquire) {
            1 => CancelReason::Terminate,
            2 => CancelReason::Canceled,
            3 => CancelReason::Silent,
            4 => CancelReason::AbortedByAbr,
            _ => CancelReason::None,
        }
    }

    /// Sets the reason unless one is already set. `Terminate` always wins.
    pub fn set(&self, reason: CancelReason) {
        if reason == CancelReason::Terminate {
            self.0.store(reason as u8, Ordering::Release);
            return;
        }
        _ = self.0.compare_exchange(
            CancelReason::None as u8,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_set(&self) -> bool {
        self.get() != CancelReason::None
    }

    /// Clears the reason for the next request. A termination is kept.
    pub fn reset(&self) {
        _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current != CancelReason::Terminate as u8).then_some(CancelReason::None as u8)
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    InitSegmentDownload,
    InitSegmentParse,
    MediaDownload,
    MediaParse,
    Decryption,
    AbortedByAbr,
}

impl FailureKind {
    pub fn is_init_segment(&self) -> bool {
        matches!(self, FailureKind::InitSegmentDownload | FailureKind::InitSegmentParse)
    }
}

/// Statistics of one segment download, reported to the stream selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadStats {
    pub stream_type: Option<StreamType>,
    pub download_id: u64,
    pub url: String,
    pub range: Option<ByteRange>,
    pub period_id: String,
    pub adaptation_set_id: String,
    pub representation_id: String,
    pub bitrate: u64,
    pub quality_index: usize,

    pub http_status: u16,
    pub content_length: Option<u64>,
    pub bytes_downloaded: u64,
    /// Wallclock time the download was started.
    pub request_start: TimeValue,
    pub time_to_first_byte: Duration,
    pub time_to_download: Duration,
    pub throughput_bps: u64,

    pub segment_duration: TimeValue,
    pub duration_downloaded: TimeValue,
    pub duration_delivered: TimeValue,
    /// End of the latest access unit that reached the sink, on the presentation timeline.
    pub delivered_until: TimeValue,
    /// How long after its availability start a missing segment was requested.
    pub availability_delay: TimeValue,
    pub retry_number: u32,

    pub was_successful: bool,
    pub was_aborted: bool,
    pub is_missing_segment: bool,
    pub inserted_filler: bool,
    pub failure_kind: Option<FailureKind>,
    pub failure_reason: Option<String>,

    /// Access units may be delivered before the segment has been completely read.
    pub emit_partial_data: bool,
    pub abort_with_filler: bool,
}

impl DownloadStats {
    /// Fresh statistics for the download of `request`.
    pub fn for_request(request: &StreamSegmentRequest, download_id: u64) -> Self {
        Self {
            stream_type: Some(request.stream_type),
            download_id,
            url: request.segment.media_url.clone(),
            range: request.segment.media_range,
            period_id: request.period_id.clone(),
            adaptation_set_id: request.adaptation_set_id.clone(),
            representation_id: request.representation_id.clone(),
            bitrate: request.bitrate,
            quality_index: request.quality_index,
            request_start: TimeValue::invalid(),
            segment_duration: request.duration(),
            duration_downloaded: TimeValue::zero(),
            duration_delivered: TimeValue::zero(),
            availability_delay: TimeValue::zero(),
            retry_number: request.retry_count,
            ..Default::default()
        }
    }

    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) {
        self.was_successful = false;
        self.failure_kind = Some(kind);
        self.failure_reason = Some(reason.into());
    }

    /// Whether access units of the segment have reached the sink.
    pub fn has_delivered_data(&self) -> bool {
        self.duration_delivered > TimeValue::zero()
    }
}

/// One segment to fetch for one stream, together with its outcome.
#[derive(Debug, Clone)]
pub struct StreamSegmentRequest {
    pub stream_type: StreamType,
    pub segment: SegmentInformation,
    pub period_id: String,
    pub adaptation_set_id: String,
    pub representation_id: String,
    pub bitrate: u64,
    pub quality_index: usize,
    pub codec: Option<CodecInfo>,
    /// Requests of other streams started together with this one.
    pub dependent_streams: Vec<StreamSegmentRequest>,
    pub stats: DownloadStats,
    pub playback_sequence_id: u32,
    pub retry_count: u32,
    pub insert_filler: bool,
    pub is_eos_segment: bool,
    pub is_initial_start_request: bool,
    pub warned_about_timescale: bool,
    /// Period start relative to the availability start time.
    pub period_start: TimeValue,
    pub ast: TimeValue,
    /// Wallclock time the segment becomes available, invalid if not applicable.
    pub asast: TimeValue,
    pub saet: TimeValue,
    pub timestamp_offset: TimeValue,
}

impl StreamSegmentRequest {
    pub fn new(stream_type: StreamType, segment: SegmentInformation) -> Self {
        Self {
            stream_type,
            segment,
            period_id: String::new(),
            adaptation_set_id: String::new(),
            representation_id: String::new(),
            bitrate: 0,
            quality_index: 0,
            codec: None,
            dependent_streams: Vec::new(),
            stats: DownloadStats::default(),
            playback_sequence_id: 0,
            retry_count: 0,
            insert_filler: false,
            is_eos_segment: false,
            is_initial_start_request: false,
            warned_about_timescale: false,
            period_start: TimeValue::zero(),
            ast: TimeValue::zero(),
            asast: TimeValue::invalid(),
            saet: TimeValue::invalid(),
            timestamp_offset: TimeValue::zero(),
        }
    }

    /// A placeholder signalling that the stream has ended. It is never fetched.
    pub fn end_of_stream(stream_type: StreamType, period_id: impl Into<String>) -> Self {
        let mut request = Self::new(stream_type, SegmentInformation::default());
        request.period_id = period_id.into();
        request.is_eos_segment = true;
        request.segment.is_eos = true;
        request
    }

    /// Segment start on the presentation timeline.
    pub fn start_time(&self) -> TimeValue {
        self.period_start + self.timestamp_offset + self.segment.period_local_start()
    }

    pub fn end_time(&self) -> TimeValue {
        self.start_time() + self.segment.duration_time()
    }

    pub fn duration(&self) -> TimeValue {
        self.segment.duration_time()
    }

    pub fn failed(&self) -> bool {
        !self.is_eos_segment && !self.stats.was_successful
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_reason_first_wins() {
        let flag = CancelFlag::new();
        assert!(!flag.is_set());
        flag.set(CancelReason::AbortedByAbr);
        flag.set(CancelReason::Canceled);
        assert_eq!(flag.get(), CancelReason::AbortedByAbr);

        flag.set(CancelReason::Terminate);
        flag.reset();
        assert_eq!(flag.get(), CancelReason::Terminate);
    }

    #[test]
    fn test_request_times() {
        let segment = SegmentInformation {
            pto: 900,
            time: 900 + 4000,
            duration: 2000,
            timescale: 1000,
            ..Default::default()
        };
        let mut request = StreamSegmentRequest::new(StreamType::Video, segment);
        request.period_start = TimeValue::from_seconds(10.0);
        assert_eq!(request.start_time(), TimeValue::from_seconds(14.0));
        assert_eq!(request.end_time(), TimeValue::from_seconds(16.0));
    }
}
