//! MPEG-DASH manifest handling: the raw document arena, the derived [`Manifest`] snapshot and
//! the segment search over it.

mod builder;
mod document;
mod duration;
mod manifest;
mod search;
mod template;
mod url;
mod xml;

pub use builder::{build_manifest, BuildOptions};
pub(crate) use builder::{apply_xlink, collect_onload_xlinks, XlinkElement, XlinkResolution};
pub use document::{DocRef, DocumentStore, MpdDocument};
pub use duration::{parse_datetime, parse_duration};
pub use manifest::{AdaptationSet, CodecInfo, Manifest, Period, PresentationType, Representation};
pub use search::{
    InbandEventStream, RemoteLoad, SearchOptions, SearchResult, SearchType, SegmentInformation,
    SegmentSize, GAP_NUMBER,
};
pub use template::Template;
pub use xml::{Element, NodeId, XmlArena};

/// Scheme of the inband events signalling MPD validity expiration.
pub const MPD_EVENT_SCHEME: &str = "urn:mpeg:dash:event:2012";
