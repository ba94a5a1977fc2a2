use bytes::Bytes;

use crate::{
    mp4::TrackInfo,
    request::StreamSegmentRequest,
    sink::{AccessUnit, DropFlags},
    time::TimeValue,
    StreamType,
};

const DEFAULT_SAMPLES_PER_BLOCK: u32 = 1024;
const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Duration of one synthesized access unit.
///
/// The duration of the last real access unit is preferred when it is known. Audio uses the
/// block size and sample rate of the track, then the sample rate from the MPD.
pub(crate) fn filler_duration(
    request: &StreamSegmentRequest,
    track: Option<&TrackInfo>,
    last_duration: TimeValue,
) -> TimeValue {
    if last_duration.is_valid() && last_duration > TimeValue::zero() {
        return last_duration;
    }
    match request.stream_type {
        StreamType::Video => TimeValue::from_timebase(1, 60),
        StreamType::Audio => {
            let samples = track
                .and_then(|track| track.samples_per_block)
                .unwrap_or(DEFAULT_SAMPLES_PER_BLOCK);
            let sample_rate = track
                .map(|track| track.sample_rate)
                .filter(|rate| *rate > 0)
                .or_else(|| request.codec.as_ref().map(|codec| codec.sample_rate))
                .filter(|rate| *rate > 0)
                .unwrap_or(DEFAULT_SAMPLE_RATE);
            TimeValue::from_timebase(samples as i64, sample_rate as u64)
        }
        _ => TimeValue::from_timebase(1, 10),
    }
}

/// Dummy access units covering `from..to` on the presentation timeline.
pub(crate) fn filler_access_units(
    request: &StreamSegmentRequest,
    from: TimeValue,
    to: TimeValue,
    au_duration: TimeValue,
) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    if !from.is_valid() || !to.is_valid() || au_duration <= TimeValue::zero() {
        return units;
    }
    let mut pts = from;
    while pts < to {
        let duration = au_duration.min(to - pts);
        units.push(AccessUnit {
            stream_type: request.stream_type,
            dts: pts,
            pts,
            duration,
            data: Bytes::new(),
            is_sync_sample: true,
            is_dummy_data: true,
            is_last_in_period: false,
            drop_flags: DropFlags::default(),
            period_id: request.period_id.clone(),
            representation_id: request.representation_id.clone(),
            bitrate: request.bitrate,
            playback_sequence_id: request.playback_sequence_id,
        });
        pts += duration;
    }
    if request.segment.is_last_in_period {
        if let Some(last) = units.last_mut() {
            last.is_last_in_period = true;
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpd::{CodecInfo, SegmentInformation};

    fn request(stream_type: StreamType) -> StreamSegmentRequest {
        let segment = SegmentInformation {
            duration: 2,
            timescale: 1,
            is_last_in_period: true,
            ..Default::default()
        };
        let mut request = StreamSegmentRequest::new(stream_type, segment);
        request.period_id = "p0".to_string();
        request.representation_id = "r1".to_string();
        request
    }

    #[test]
    fn test_default_durations() {
        assert_eq!(
            filler_duration(&request(StreamType::Video), None, TimeValue::invalid()),
            TimeValue::from_timebase(1, 60)
        );
        assert_eq!(
            filler_duration(&request(StreamType::Subtitle), None, TimeValue::zero()),
            TimeValue::from_seconds(0.1)
        );

        let mut audio = request(StreamType::Audio);
        assert_eq!(
            filler_duration(&audio, None, TimeValue::invalid()),
            TimeValue::from_timebase(1024, 48000)
        );
        audio.codec = Some(CodecInfo {
            codec: "mp4a.40.2".to_string(),
            stream_type: StreamType::Audio,
            width: 0,
            height: 0,
            frame_rate: None,
            sample_rate: 32000,
            channels: 2,
            language: None,
        });
        assert_eq!(
            filler_duration(&audio, None, TimeValue::invalid()),
            TimeValue::from_seconds(0.032)
        );
        assert_eq!(
            filler_duration(&audio, None, TimeValue::from_seconds(0.02)),
            TimeValue::from_seconds(0.02)
        );
    }

    #[test]
    fn test_audio_duration_from_track() {
        let audio = request(StreamType::Audio);
        let mut track = TrackInfo {
            sample_rate: 48000,
            samples_per_block: Some(960),
            ..Default::default()
        };
        assert_eq!(
            filler_duration(&audio, Some(&track), TimeValue::invalid()),
            TimeValue::from_seconds(0.02)
        );

        // Without a parsed configuration the usual AAC block size applies.
        track.samples_per_block = None;
        track.sample_rate = 32000;
        assert_eq!(
            filler_duration(&audio, Some(&track), TimeValue::invalid()),
            TimeValue::from_seconds(0.032)
        );
    }

    #[test]
    fn test_filler_covers_range() {
        let request = request(StreamType::Subtitle);
        let units = filler_access_units(
            &request,
            TimeValue::from_seconds(1.0),
            TimeValue::from_seconds(1.25),
            TimeValue::from_seconds(0.1),
        );
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|au| au.is_dummy_data && au.data.is_empty()));
        assert_eq!(units[2].pts, TimeValue::from_seconds(1.2));
        assert_eq!(units[2].duration, TimeValue::from_seconds(0.05));
        assert!(units[2].is_last_in_period);
        assert!(!units[0].is_last_in_period);
        assert_eq!(units[0].representation_id, "r1");

        let empty = filler_access_units(
            &request,
            TimeValue::zero(),
            TimeValue::zero(),
            TimeValue::from_seconds(0.1),
        );
        assert!(empty.is_empty());
    }
}
