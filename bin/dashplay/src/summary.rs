use std::collections::BTreeMap;

use iori_abr::{request::StreamSegmentRequest, sink::AccessUnit, stream::InbandEvent};
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
pub struct StreamSummary {
    pub segments: u32,
    pub failed_segments: u32,
    pub missing_segments: u32,
    pub filled_segments: u32,
    pub aborted_segments: u32,
    pub bytes_downloaded: u64,
    pub access_units: u64,
    pub dummy_access_units: u64,
    pub played_seconds: f64,
    /// Completed segments per representation.
    pub representations: BTreeMap<String, u32>,
    pub switches: u32,
    #[serde(skip)]
    last_representation: Option<String>,
}

impl StreamSummary {
    pub fn record_segment(&mut self, request: &StreamSegmentRequest) {
        if request.is_eos_segment {
            return;
        }
        let stats = &request.stats;
        self.segments += 1;
        self.bytes_downloaded += stats.bytes_downloaded;
        if request.failed() {
            self.failed_segments += 1;
        }
        if stats.is_missing_segment {
            self.missing_segments += 1;
        }
        if stats.inserted_filler {
            self.filled_segments += 1;
        }
        if stats.was_aborted {
            self.aborted_segments += 1;
        }
        if request.stats.was_successful {
            *self
                .representations
                .entry(request.representation_id.clone())
                .or_default() += 1;
            if self
                .last_representation
                .replace(request.representation_id.clone())
                .is_some_and(|last| last != request.representation_id)
            {
                self.switches += 1;
            }
        }
    }

    pub fn record_played(&mut self, units: &[AccessUnit]) {
        for au in units {
            self.access_units += 1;
            if au.is_dummy_data {
                self.dummy_access_units += 1;
            }
            if au.duration.is_valid() {
                self.played_seconds += au.duration.as_seconds();
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AbrSummary {
    pub last_bandwidth: u64,
    pub average_bandwidth: u64,
    pub average_throughput: u64,
    pub average_latency_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub url: String,
    pub presentation_type: String,
    pub elapsed_seconds: f64,
    pub periods: Vec<String>,
    pub rebuffers: u32,
    pub streams: BTreeMap<String, StreamSummary>,
    pub abr: AbrSummary,
    pub inband_events: Vec<InbandEvent>,
}
