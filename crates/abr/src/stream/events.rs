use std::collections::HashSet;

use bytes::Bytes;
use serde::Serialize;

use crate::{
    mp4::EventMessage,
    mpd::{InbandEventStream, MPD_EVENT_SCHEME},
    request::StreamSegmentRequest,
    time::{TimeFraction, TimeValue},
};

/// Value of the synthesized event telling that an MPD validity event may have been lost with a
/// failed segment.
pub const MISSED_EVENT_VALUE: &str = "$missed$";

/// An `emsg` event matched against the inband event streams of its representation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InbandEvent {
    pub scheme_id_uri: String,
    pub value: String,
    pub id: u32,
    /// Presentation time of the event on the presentation timeline.
    pub presentation_time: TimeValue,
    /// Invalid for an event of unknown duration.
    pub duration: TimeValue,
    #[serde(skip)]
    pub message_data: Bytes,
}

impl InbandEvent {
    pub fn is_mpd_event(&self) -> bool {
        self.scheme_id_uri == MPD_EVENT_SCHEME
    }
}

/// Receiver of inband events found in media segments.
pub trait EventHandler: Send + Sync {
    fn on_inband_event(&self, period_id: &str, event: &InbandEvent);
}

/// Matches, converts and de-duplicates the `emsg` boxes of a stream.
#[derive(Debug, Default)]
pub(crate) struct EventTracker {
    seen: HashSet<(String, String, u32)>,
    period_id: String,
}

impl EventTracker {
    /// Converts the messages of one segment. Events already reported for the period are
    /// skipped, as are messages of schemes the representation does not declare.
    pub fn collect(&mut self, request: &StreamSegmentRequest, messages: &[EventMessage]) -> Vec<InbandEvent> {
        if self.period_id != request.period_id {
            self.seen.clear();
            self.period_id = request.period_id.clone();
        }
        let mut events = Vec::new();
        for message in messages {
            let Some(stream) = find_stream(&request.segment.inband_event_streams, message) else {
                tracing::debug!(scheme = %message.scheme_id_uri, "Ignoring undeclared emsg");
                continue;
            };
            let key = (message.scheme_id_uri.clone(), message.value.clone(), message.id);
            if !self.seen.insert(key) {
                continue;
            }
            events.push(convert(request, stream, message));
        }
        events
    }
}

fn find_stream<'a>(streams: &'a [InbandEventStream], message: &EventMessage) -> Option<&'a InbandEventStream> {
    streams.iter().find(|stream| {
        stream.scheme_id_uri == message.scheme_id_uri
            && stream.value.as_deref().map_or(true, |value| value == message.value)
    })
}

fn convert(request: &StreamSegmentRequest, stream: &InbandEventStream, message: &EventMessage) -> InbandEvent {
    let period_start = request.period_start + request.timestamp_offset;
    let presentation_time = match message.version {
        0 => {
            period_start
                + request.segment.period_local_start()
                + TimeFraction::new(message.presentation_time as i64, message.timescale).as_time_value()
        }
        _ => {
            let offset = match stream.timescale {
                0 => TimeValue::zero(),
                timescale => TimeFraction::new(stream.presentation_time_offset, timescale).as_time_value(),
            };
            period_start + TimeFraction::new(message.presentation_time as i64, message.timescale).as_time_value()
                - offset
        }
    };
    let duration = match message.event_duration {
        u32::MAX => TimeValue::invalid(),
        duration => TimeFraction::new(duration as i64, message.timescale).as_time_value(),
    };
    InbandEvent {
        scheme_id_uri: message.scheme_id_uri.clone(),
        value: message.value.clone(),
        id: message.id,
        presentation_time,
        duration,
        message_data: message.message_data.clone(),
    }
}

/// Event raised when a segment of a stream carrying MPD validity events failed before such an
/// event was seen.
pub(crate) fn missed_mpd_event(request: &StreamSegmentRequest) -> Option<InbandEvent> {
    request
        .segment
        .inband_event_streams
        .iter()
        .any(|stream| stream.scheme_id_uri == MPD_EVENT_SCHEME)
        .then(|| InbandEvent {
            scheme_id_uri: MPD_EVENT_SCHEME.to_string(),
            value: MISSED_EVENT_VALUE.to_string(),
            id: 0,
            presentation_time: request.start_time(),
            duration: TimeValue::invalid(),
            message_data: Bytes::new(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mpd::SegmentInformation, StreamType};

    fn request() -> StreamSegmentRequest {
        let segment = SegmentInformation {
            pto: 1000,
            time: 1000 + 6000,
            duration: 2000,
            timescale: 1000,
            inband_event_streams: vec![
                InbandEventStream {
                    scheme_id_uri: MPD_EVENT_SCHEME.to_string(),
                    value: Some("1".to_string()),
                    presentation_time_offset: 1000,
                    timescale: 1000,
                },
                InbandEventStream {
                    scheme_id_uri: "urn:scte:scte35:2013:bin".to_string(),
                    value: None,
                    presentation_time_offset: 0,
                    timescale: 0,
                },
            ],
            ..Default::default()
        };
        let mut request = StreamSegmentRequest::new(StreamType::Video, segment);
        request.period_id = "p0".to_string();
        request.period_start = TimeValue::from_seconds(100.0);
        request
    }

    fn message(version: u8, scheme: &str, value: &str, id: u32, time: u64) -> EventMessage {
        EventMessage {
            version,
            scheme_id_uri: scheme.to_string(),
            value: value.to_string(),
            timescale: 10,
            presentation_time: time,
            event_duration: 20,
            id,
            message_data: Bytes::from_static(b"data"),
        }
    }

    #[test]
    fn test_event_times() {
        let request = request();
        let mut tracker = EventTracker::default();
        let events = tracker.collect(
            &request,
            &[
                message(0, MPD_EVENT_SCHEME, "1", 1, 5),
                message(1, "urn:scte:scte35:2013:bin", "", 2, 80),
            ],
        );
        assert_eq!(events.len(), 2);
        // Segment starts 6s into the period, the event half a second later.
        assert_eq!(events[0].presentation_time, TimeValue::from_seconds(106.5));
        assert_eq!(events[0].duration, TimeValue::from_seconds(2.0));
        assert!(events[0].is_mpd_event());
        assert_eq!(events[1].presentation_time, TimeValue::from_seconds(108.0));
    }

    #[test]
    fn test_events_are_matched_and_deduplicated() {
        let request = request();
        let mut tracker = EventTracker::default();
        let messages = [
            message(0, MPD_EVENT_SCHEME, "1", 1, 0),
            message(0, MPD_EVENT_SCHEME, "2", 1, 0),
            message(0, "urn:example:unknown", "", 3, 0),
        ];
        assert_eq!(tracker.collect(&request, &messages).len(), 1);
        assert!(tracker.collect(&request, &messages).is_empty());

        let mut next_period = request.clone();
        next_period.period_id = "p1".to_string();
        assert_eq!(tracker.collect(&next_period, &messages).len(), 1);
    }

    #[test]
    fn test_missed_event() {
        let mut request = request();
        let missed = missed_mpd_event(&request).unwrap();
        assert_eq!(missed.value, MISSED_EVENT_VALUE);
        assert_eq!(missed.presentation_time, TimeValue::from_seconds(106.0));

        request.segment.inband_event_streams.remove(0);
        assert!(missed_mpd_event(&request).is_none());
    }
}
