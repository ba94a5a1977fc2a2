pub mod abr;
pub mod cache;
pub mod clock;
pub mod drm;
pub mod error;
pub mod http;
pub mod mp4;
pub mod mpd;
pub mod params;
pub mod period;
pub mod reader;
pub mod request;
pub mod session;
pub mod sink;
pub mod stream;
#[cfg(test)]
pub(crate) mod testing;
pub mod time;
pub mod util;

use serde::{Deserialize, Serialize};

pub use error::{PlayerError, PlayerResult};

/// ```text
///                 ┌──────────────────┐   Manifest   ┌──────────────┐
///   MPD ─────────►  PlaylistReader   ├──────────────►  PlayPeriod  │
///                 └────────▲─────────┘              └──────┬───────┘
///                          │ sidx / forced update          │ StreamSegmentRequest
///                          │                        ┌──────▼───────┐    AccessUnit
///                          └────────────────────────┤ StreamHandler├──────────────► sink
///                                                   └──────┬───────┘
///                                        progress / stats  │  Continue / Abort
///                                                   ┌──────▼───────┐
///                                                   │StreamSelector│
///                                                   └──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamType {
    Video,
    Audio,
    Subtitle,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamType::Video => write!(f, "video"),
            StreamType::Audio => write!(f, "audio"),
            StreamType::Subtitle => write!(f, "subtitle"),
        }
    }
}
