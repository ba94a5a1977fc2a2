//! Turns a parsed MPD document into a [`Manifest`] snapshot.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use url::Url;

use super::{
    document::MpdDocument,
    duration::{parse_datetime, parse_duration},
    manifest::{AdaptationSet, CodecInfo, Manifest, Period, PresentationType, Representation},
    search::collect_inband_event_streams,
    url::{merge_baseurls, resolve_base_url},
    xml::{Element, NodeId, XmlArena},
};
use crate::{
    clock::UtcTiming,
    error::{PlayerError, PlayerResult},
    time::TimeValue,
    StreamType,
};

pub const XLINK_RESOLVE_TO_ZERO: &str = "urn:mpeg:dash:resolve-to-zero:2013";
const DASH_ROLE_SCHEME: &str = "urn:mpeg:dash:role:2011";
const STEREO_ROLE_SCHEME: &str = "urn:mpeg:dash:stereoid:2011";
const KNOWN_ROLES: [&str; 10] = [
    "main",
    "alternate",
    "supplementary",
    "commentary",
    "dub",
    "emergency",
    "caption",
    "subtitle",
    "sign",
    "description",
];
const AUDIO_CHANNEL_SCHEMES: [&str; 2] = [
    "urn:mpeg:dash:23003:3:audio_channel_configuration:2011",
    "urn:mpeg:mpegB:cicp:ChannelConfiguration",
];

/// Options that influence which parts of the document are used.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Keep representations carrying `ContentProtection`. Only sensible with a decrypter.
    pub allow_content_protection: bool,
}

fn malformed(name: &str, value: &str) -> PlayerError {
    PlayerError::MpdParsing(format!("Malformed attribute {name}=\"{value}\""))
}

fn opt_duration(element: &Element<'_>, name: &str) -> PlayerResult<TimeValue> {
    match element.attr(name) {
        Some(value) => parse_duration(value).map_err(|_| malformed(name, value)),
        None => Ok(TimeValue::invalid()),
    }
}

fn opt_datetime(element: &Element<'_>, name: &str) -> PlayerResult<TimeValue> {
    match element.attr(name) {
        Some(value) => parse_datetime(value).map_err(|_| malformed(name, value)),
        None => Ok(TimeValue::invalid()),
    }
}

/// Element chain from the document root down to and including `element`.
pub(crate) fn ancestors_from_root<'a>(element: Element<'a>) -> Vec<Element<'a>> {
    let mut chain = vec![element];
    let mut current = element;
    while let Some(parent) = current.parent() {
        chain.push(parent);
        current = parent;
    }
    chain.reverse();
    chain
}

/// An element whose content has to be fetched from `url` before the document is usable.
#[derive(Debug, Clone)]
pub struct XlinkElement {
    pub node: NodeId,
    pub name: String,
    pub href: String,
    /// `None` for `resolve-to-zero`.
    pub url: Option<Url>,
}

/// Collects every element with `xlink:actuate="onLoad"`.
///
/// Elements with `onRequest` actuation are left alone and never resolved.
pub fn collect_onload_xlinks(
    arena: &XmlArena,
    document_url: &Url,
    service_location: Option<&str>,
) -> PlayerResult<Vec<XlinkElement>> {
    let mut elements = Vec::new();
    for id in arena.descendants() {
        let element = arena.element(id);
        let Some(href) = element.attr("xlink:href") else {
            continue;
        };
        if element.attr("xlink:actuate").unwrap_or("onRequest") != "onLoad" {
            continue;
        }
        let url = if href == XLINK_RESOLVE_TO_ZERO {
            None
        } else {
            let mut levels = ancestors_from_root(element);
            levels.pop();
            let base = resolve_base_url(document_url, &levels, service_location)?;
            Some(merge_baseurls(&base, href)?)
        };
        elements.push(XlinkElement {
            node: id,
            name: element.name().to_string(),
            href: href.to_string(),
            url,
        });
    }
    Ok(elements)
}

/// Outcome of resolving one xlink element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlinkResolution {
    Removed,
    Replaced(usize),
    /// The remote content was unusable, the original element stays without its xlink.
    KeptOriginal,
}

/// Applies the remote entity of an xlink element to the tree.
///
/// `remote` is `None` when the load failed.
pub fn apply_xlink(arena: &mut XmlArena, xlink: &XlinkElement, remote: Option<&str>) -> XlinkResolution {
    if xlink.href == XLINK_RESOLVE_TO_ZERO {
        arena.detach(xlink.node);
        return XlinkResolution::Removed;
    }

    let keep = |arena: &mut XmlArena, reason: &str| {
        tracing::warn!(href = %xlink.href, element = %xlink.name, "{reason}, keeping the original element");
        arena.remove_attribute(xlink.node, "xlink:href");
        arena.remove_attribute(xlink.node, "xlink:actuate");
        XlinkResolution::KeptOriginal
    };

    let Some(body) = remote.filter(|body| !body.trim().is_empty()) else {
        return keep(arena, "Remote element could not be loaded or is empty");
    };
    let fragment = match XmlArena::parse_fragment(body) {
        Ok(fragment) => fragment,
        Err(e) => return keep(arena, &format!("Remote element is malformed ({e})")),
    };
    let Some(fragment_root) = fragment.root() else {
        return keep(arena, "Remote element is empty");
    };
    let top_level: Vec<_> = fragment_root.children().collect();
    if top_level.is_empty() {
        // Remote content without elements resolves the element to zero.
        arena.detach(xlink.node);
        return XlinkResolution::Removed;
    }
    if top_level.iter().any(|e| e.name() != xlink.name) {
        return keep(arena, "Remote element has a different root element");
    }
    let has_nested_onload = fragment.descendants().into_iter().any(|id| {
        let element = fragment.element(id);
        element.has_attr("xlink:href") && element.attr("xlink:actuate") == Some("onLoad")
    });
    if has_nested_onload {
        return keep(arena, "Remote element references further onLoad elements");
    }

    let inserted = arena.replace_with_fragment(xlink.node, &fragment);
    XlinkResolution::Replaced(inserted.len())
}

/// Validates the document and derives the period timeline and the usable streams.
pub fn build_manifest(document: Arc<MpdDocument>, options: &BuildOptions) -> PlayerResult<Manifest> {
    let root = document
        .arena()
        .root()
        .filter(|root| root.name() == "MPD")
        .ok_or_else(|| PlayerError::MpdParsing("Root element is not <MPD>".to_string()))?;

    // Anything that is not 'static' is handled as 'dynamic'.
    let presentation_type = match root.attr("type").unwrap_or("static") {
        "static" => PresentationType::Static,
        _ => PresentationType::Dynamic,
    };
    let availability_start_time = opt_datetime(&root, "availabilityStartTime")?;
    let publish_time = opt_datetime(&root, "publishTime")?;
    let minimum_update_period = opt_duration(&root, "minimumUpdatePeriod")?;
    let min_buffer_time = opt_duration(&root, "minBufferTime")?;
    let media_presentation_duration = opt_duration(&root, "mediaPresentationDuration")?;

    match presentation_type {
        PresentationType::Dynamic
            if !availability_start_time.is_valid() || !publish_time.is_valid() =>
        {
            return Err(PlayerError::MpdParsing(
                "Dynamic presentations require both MPD@availabilityStartTime and MPD@publishTime"
                    .to_string(),
            ));
        }
        PresentationType::Static if minimum_update_period.is_valid() => {
            return Err(PlayerError::MpdParsing(
                "Static presentations must not have MPD@minimumUpdatePeriod".to_string(),
            ));
        }
        _ => {}
    }
    if !min_buffer_time.is_valid() {
        return Err(PlayerError::MpdParsing("MPD@minBufferTime is required".to_string()));
    }

    let period_elements: Vec<_> = root.children_named("Period").collect();
    if period_elements.is_empty() {
        return Err(PlayerError::MpdParsing("At least one Period is required".to_string()));
    }

    let timeline = derive_period_timeline(
        &period_elements,
        presentation_type,
        media_presentation_duration,
        minimum_update_period,
    )?;

    let last_regular = timeline.iter().rposition(|t| !t.is_early);
    let mut periods = Vec::with_capacity(timeline.len());
    for (index, (element, times)) in period_elements.iter().zip(timeline).enumerate() {
        periods.push(Arc::new(Period {
            id: times.id,
            start: times.start,
            end: times.end,
            duration: times.duration,
            is_early: times.is_early,
            has_following_period: last_regular.is_some_and(|last| index < last),
            doc_ref: document.doc_ref(element.id()),
            adaptation_sets: prepare_adaptation_sets(&document, element, options),
        }));
    }

    let location = match root.child("Location").map(|l| l.text()) {
        Some(location) if !location.is_empty() => Some(merge_baseurls(document.url(), location)?),
        _ => None,
    };
    let utc_timings = root
        .children_named("UTCTiming")
        .filter_map(|timing| {
            Some(UtcTiming {
                scheme_id_uri: timing.attr("schemeIdUri")?.to_string(),
                value: timing.attr("value").map(str::to_string),
            })
        })
        .collect();

    Ok(Manifest {
        presentation_type,
        availability_start_time,
        availability_end_time: opt_datetime(&root, "availabilityEndTime")?,
        publish_time,
        minimum_update_period,
        min_buffer_time,
        time_shift_buffer_depth: opt_duration(&root, "timeShiftBufferDepth")?,
        suggested_presentation_delay: opt_duration(&root, "suggestedPresentationDelay")?,
        media_presentation_duration,
        location,
        utc_timings,
        periods,
        fetch_time: Mutex::new(TimeValue::invalid()),
        document,
    })
}

struct PeriodTimes {
    id: String,
    start: TimeValue,
    end: TimeValue,
    duration: TimeValue,
    is_early: bool,
}

/// Derives start and end of every period (ISO/IEC 23009-1, 5.3.2.1).
fn derive_period_timeline(
    elements: &[Element<'_>],
    presentation_type: PresentationType,
    media_presentation_duration: TimeValue,
    minimum_update_period: TimeValue,
) -> PlayerResult<Vec<PeriodTimes>> {
    let mut periods: Vec<PeriodTimes> = Vec::with_capacity(elements.len());
    let mut warned_presentation_duration = false;
    let mut combined_duration = TimeValue::zero();
    let count = elements.len();

    for (index, element) in elements.iter().enumerate() {
        let id = match element.attr("id") {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("$unnamed.{index}$"),
        };
        let mut period = PeriodTimes {
            start: opt_duration(element, "start")?,
            duration: opt_duration(element, "duration")?,
            end: TimeValue::invalid(),
            is_early: false,
            id,
        };

        if !period.start.is_valid() {
            let previous_duration = match index {
                0 => TimeValue::invalid(),
                _ => opt_duration(&elements[index - 1], "duration")?,
            };
            if index == 0 && presentation_type == PresentationType::Static {
                period.start = TimeValue::zero();
            } else if let (Some(previous), true) = (periods.last(), previous_duration.is_valid()) {
                period.start = previous.start + previous_duration;
            } else if presentation_type == PresentationType::Dynamic {
                period.is_early = true;
            } else {
                return Err(PlayerError::MpdParsing(format!(
                    "Period@start cannot be derived for period \"{}\"",
                    period.id
                )));
            }
        }

        if !period.is_early {
            if let Some(previous) = periods.last_mut() {
                if previous.is_early {
                    return Err(PlayerError::MpdParsing(format!(
                        "Early available period \"{}\" must not be followed by a regular period (\"{}\")",
                        previous.id, period.id
                    )));
                }
                if !previous.end.is_valid() {
                    previous.end = period.start;
                }
            }

            if period.duration.is_valid() {
                period.end = period.start + period.duration;
            } else if index < count - 1 {
                let next_start = opt_duration(&elements[index + 1], "start")?;
                if next_start.is_valid() {
                    period.end = next_start;
                    period.duration = period.end - period.start;
                }
            } else if media_presentation_duration.is_valid() {
                let first_start = periods.first().map(|p| p.start).unwrap_or(period.start);
                period.end = first_start + media_presentation_duration;
                period.duration = period.end - period.start;
            } else if presentation_type == PresentationType::Static {
                return Err(PlayerError::MpdParsing(
                    "Static presentations with the last Period@duration missing need MPD@mediaPresentationDuration".to_string(),
                ));
            } else if !minimum_update_period.is_valid() {
                return Err(PlayerError::MpdParsing(
                    "Dynamic presentations with the last Period@duration missing and no MPD@minimumUpdatePeriod need MPD@mediaPresentationDuration".to_string(),
                ));
            }

            if let Some(previous) = periods.last_mut() {
                if period.start < previous.start {
                    return Err(PlayerError::MpdParsing(format!(
                        "Period@start times must be increasing for periods \"{}\" and \"{}\"",
                        previous.id, period.id
                    )));
                }
                let diff = period.start - previous.end;
                if diff.is_valid() && diff < TimeValue::zero() {
                    previous.end = period.start;
                } else if diff.is_valid() && diff.as_seconds() > 0.5 {
                    tracing::warn!(
                        "There is a gap of {:.3} seconds between periods \"{}\" and \"{}\"",
                        diff.as_seconds(),
                        previous.id,
                        period.id
                    );
                }
            }
        }

        if period.start.is_valid() && period.end.is_valid() {
            let length = period.end - period.start;
            if length < TimeValue::zero() {
                return Err(PlayerError::MpdParsing(format!(
                    "Duration of Period \"{}\" is calculated as negative",
                    period.id
                )));
            }
            combined_duration += length;
            if media_presentation_duration.is_finite() && !warned_presentation_duration {
                let diff = media_presentation_duration - combined_duration;
                if diff.as_seconds() < -0.5 {
                    tracing::warn!(
                        "MPD@mediaPresentationDuration cuts into Period \"{}\" by {:.3} seconds",
                        period.id,
                        -diff.as_seconds()
                    );
                    warned_presentation_duration = true;
                } else if index == count - 1 && diff.as_seconds() > 0.5 {
                    tracing::warn!(
                        "MPD@mediaPresentationDuration extends past the last period's end by {:.3} seconds",
                        diff.as_seconds()
                    );
                    warned_presentation_duration = true;
                }
            }
        }
        periods.push(period);
    }
    Ok(periods)
}

fn parse_frame_rate(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den > 0.0).then_some(num / den)
        }
        None => value.trim().parse().ok(),
    }
}

fn stream_type_from_mime(element: &Element<'_>) -> Option<StreamType> {
    let content_type = element
        .attr("contentType")
        .or_else(|| element.attr("mimeType").and_then(|m| m.split('/').next()))?;
    match content_type {
        "video" => Some(StreamType::Video),
        "audio" => Some(StreamType::Audio),
        "text" | "application" => Some(StreamType::Subtitle),
        _ => None,
    }
}

fn prepare_adaptation_sets(
    document: &MpdDocument,
    period: &Element<'_>,
    options: &BuildOptions,
) -> Vec<Arc<AdaptationSet>> {
    let mut adaptation_sets = Vec::new();
    for (index, element) in period.children_named("AdaptationSet").enumerate() {
        let unsupported = ["ContentComponent", "FramePacking", "Rating", "Viewpoint"]
            .into_iter()
            .find(|name| element.child(name).is_some());
        if let Some(name) = unsupported {
            tracing::info!("{name} in AdaptationSet is not supported, ignoring this AdaptationSet");
            continue;
        }
        if element.attr("scanType") == Some("interlace") {
            tracing::info!("Interlace video in AdaptationSet is not supported, ignoring this AdaptationSet");
            continue;
        }

        let mut roles = Vec::new();
        let mut bad_role = false;
        for role in element.children_named("Role") {
            match role.attr("schemeIdUri") {
                Some(STEREO_ROLE_SCHEME) => bad_role = true,
                Some(DASH_ROLE_SCHEME) => match role.attr("value") {
                    Some(value) if KNOWN_ROLES.contains(&value) => roles.push(value.to_string()),
                    value => tracing::info!("Unsupported Role type {value:?} found"),
                },
                _ => {}
            }
        }
        if bad_role {
            tracing::info!("Unsupported AdaptationSet Role found, ignoring this AdaptationSet");
            continue;
        }
        if roles.is_empty() {
            roles.push("main".to_string());
        }
        let accessibilities = element
            .children_named("Accessibility")
            .filter_map(|a| match a.attr("schemeIdUri")? {
                DASH_ROLE_SCHEME => a.attr("value").map(str::to_string),
                "urn:scte:dash:cc:cea-608:2015" => Some(format!("608:{}", a.attr("value").unwrap_or_default())),
                _ => None,
            })
            .collect();

        let language = element.attr("lang").map(str::to_string);
        let adaptation_protected = element.child("ContentProtection").is_some();
        let mut representations: Vec<Representation> = Vec::new();
        let mut max_bandwidth = 0;
        let mut codec_of_max = None;

        for (rep_index, rep) in element.children_named("Representation").enumerate() {
            if rep.child("SubRepresentation").is_some() {
                tracing::info!("SubRepresentations are not supported, ignoring this Representation");
                continue;
            }
            if rep.has_attr("dependencyId") || rep.has_attr("mediaStreamStructureId") {
                tracing::info!("Representation dependencies are not supported, ignoring this Representation");
                continue;
            }
            if rep.child("FramePacking").is_some() || rep.attr("scanType") == Some("interlace") {
                tracing::info!("Frame packed or interlaced Representation is not supported, ignoring it");
                continue;
            }
            if (adaptation_protected || rep.child("ContentProtection").is_some())
                && !options.allow_content_protection
            {
                tracing::warn!("ContentProtection is not supported, ignoring this Representation");
                continue;
            }

            let Some(codecs) = rep.attr("codecs").or_else(|| element.attr("codecs")) else {
                tracing::info!("Neither @codecs found on Representation or AdaptationSet level, ignoring this Representation");
                continue;
            };
            let mut codecs = codecs.split(',').map(str::trim);
            let codec = codecs.next().unwrap_or_default().to_string();
            if codecs.next().is_some() {
                tracing::info!("More than one codec found for Representation, using only first codec");
            }
            let Some(stream_type) = CodecInfo::stream_type_of(&codec).or_else(|| {
                stream_type_from_mime(&rep).or_else(|| stream_type_from_mime(&element))
            }) else {
                tracing::info!(codec, "Could not classify Representation@codecs, ignoring this Representation");
                continue;
            };

            let inherited = |name: &str| rep.attr(name).or_else(|| element.attr(name));
            let channels = [rep, element]
                .iter()
                .flat_map(|e| e.children_named("AudioChannelConfiguration"))
                .find(|acc| {
                    acc.attr("schemeIdUri")
                        .is_some_and(|s| AUDIO_CHANNEL_SCHEMES.contains(&s))
                })
                .and_then(|acc| acc.attr_u64("value"))
                .unwrap_or(0) as u32;
            let codec_info = CodecInfo {
                codec,
                stream_type,
                width: inherited("width").and_then(|w| w.parse().ok()).unwrap_or(0),
                height: inherited("height").and_then(|h| h.parse().ok()).unwrap_or(0),
                frame_rate: inherited("frameRate").and_then(parse_frame_rate),
                sample_rate: inherited("audioSamplingRate")
                    .and_then(|rate| rate.split_whitespace().next()?.parse().ok())
                    .unwrap_or(0),
                channels,
                language: language.clone(),
            };

            let bandwidth = rep.attr_u64("bandwidth").unwrap_or(0);
            if bandwidth > max_bandwidth || codec_of_max.is_none() {
                max_bandwidth = max_bandwidth.max(bandwidth);
                codec_of_max = Some(codec_info.clone());
            }
            let id = match rep.attr("id") {
                Some(id) => id.to_string(),
                None => format!("$unnamed.{rep_index}$"),
            };
            representations.push(Representation::new(
                id,
                bandwidth,
                codec_info,
                document.doc_ref(rep.id()),
            ));
        }

        if representations.is_empty() {
            continue;
        }
        let bandwidths: BTreeSet<u64> = representations.iter().map(|r| r.bandwidth).collect();
        let bandwidths: Vec<u64> = bandwidths.into_iter().collect();
        for representation in &mut representations {
            representation.quality_index = bandwidths
                .binary_search(&representation.bandwidth)
                .unwrap_or_default();
        }

        let stream_type = codec_of_max
            .as_ref()
            .map(|codec| codec.stream_type)
            .unwrap_or(StreamType::Video);
        adaptation_sets.push(Arc::new(AdaptationSet {
            id: element
                .attr("id")
                .map(str::to_string)
                .unwrap_or_else(|| index.to_string()),
            index,
            stream_type,
            language,
            roles,
            accessibilities,
            codec: codec_of_max,
            max_bandwidth,
            inband_event_streams: collect_inband_event_streams(&[element]),
            doc_ref: document.doc_ref(element.id()),
            representations: representations.into_iter().map(Arc::new).collect(),
        }));
    }
    adaptation_sets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(xml: &str) -> PlayerResult<Manifest> {
        let arena = XmlArena::parse(xml)?;
        let document = MpdDocument::new(1, arena, Url::parse("http://localhost/a.mpd").unwrap(), None);
        build_manifest(Arc::new(document), &BuildOptions::default())
    }

    const VIDEO_SET: &str = r#"<AdaptationSet mimeType="video/mp4" codecs="avc1.64001f">
        <Representation id="low" bandwidth="500000" width="640" height="360"/>
        <Representation id="high" bandwidth="2000000" width="1280" height="720" frameRate="30000/1001"/>
        <Representation id="high2" bandwidth="2000000" width="1280" height="720"/>
        <Representation id="dep" bandwidth="3000000" dependencyId="high"/>
    </AdaptationSet>"#;

    #[test]
    fn test_static_periods_and_quality() {
        let manifest = build(&format!(
            r#"<MPD type="static" minBufferTime="PT2S" mediaPresentationDuration="PT30S">
                <Period id="a" duration="PT10S">{VIDEO_SET}</Period>
                <Period>{VIDEO_SET}</Period>
            </MPD>"#
        ))
        .unwrap();
        assert_eq!(manifest.periods.len(), 2);
        let first = &manifest.periods[0];
        assert_eq!(first.start, TimeValue::zero());
        assert_eq!(first.end, TimeValue::from_seconds(10.0));
        assert!(first.has_following_period);

        let second = &manifest.periods[1];
        assert_eq!(second.id, "$unnamed.1$");
        assert_eq!(second.start, TimeValue::from_seconds(10.0));
        assert_eq!(second.end, TimeValue::from_seconds(30.0));
        assert!(!second.has_following_period);

        let video = &first.adaptation_sets[0];
        assert_eq!(video.stream_type, StreamType::Video);
        assert_eq!(video.roles, ["main"]);
        let qualities: Vec<_> = video
            .representations
            .iter()
            .map(|r| (r.id.as_str(), r.quality_index))
            .collect();
        assert_eq!(qualities, [("low", 0), ("high", 1), ("high2", 1)]);
        let high = video.representation_by_id("high").unwrap();
        assert!((high.codec.frame_rate.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(
            video.representation_by_max_bandwidth(1_000_000).unwrap().id,
            "low"
        );
        assert_eq!(video.representation_by_max_bandwidth(100).unwrap().id, "low");
    }

    #[test]
    fn test_validation() {
        assert!(build(r#"<MPD type="static"><Period/></MPD>"#).is_err());
        assert!(build(r#"<MPD type="static" minBufferTime="PT2S"/>"#).is_err());
        assert!(build(
            r#"<MPD type="dynamic" minBufferTime="PT2S"><Period start="PT0S"/></MPD>"#
        )
        .is_err());
        assert!(build(
            r#"<MPD type="static" minBufferTime="PT2S" minimumUpdatePeriod="PT2S"><Period start="PT0S" duration="PT1S"/></MPD>"#
        )
        .is_err());
        // Static without any way of deriving the end.
        assert!(build(r#"<MPD type="static" minBufferTime="PT2S"><Period/></MPD>"#).is_err());
    }

    #[test]
    fn test_dynamic_open_ended_period() {
        let manifest = build(
            r#"<MPD type="dynamic" minBufferTime="PT2S" minimumUpdatePeriod="PT4S"
                   availabilityStartTime="2024-01-01T00:00:00Z" publishTime="2024-01-01T00:00:00Z">
                <Location>http://localhost/live.mpd</Location>
                <Period id="live" start="PT0S"/>
            </MPD>"#,
        )
        .unwrap();
        assert!(manifest.are_updates_expected());
        assert!(!manifest.periods[0].end.is_valid());
        assert!(manifest.last_period_end_time().is_positive_infinity());
        assert_eq!(
            manifest.location.as_ref().map(Url::as_str),
            Some("http://localhost/live.mpd")
        );
    }

    #[test]
    fn test_apply_xlink() {
        let mut arena = XmlArena::parse(
            r#"<MPD type="static" minBufferTime="PT2S" xmlns:xlink="http://www.w3.org/1999/xlink">
                <Period id="zero" xlink:href="urn:mpeg:dash:resolve-to-zero:2013" xlink:actuate="onLoad"/>
                <Period id="remote" duration="PT5S" xlink:href="period.xml" xlink:actuate="onLoad"/>
                <Period id="lazy" xlink:href="later.xml"/>
            </MPD>"#,
        )
        .unwrap();
        let url = Url::parse("http://localhost/dir/a.mpd").unwrap();
        let xlinks = collect_onload_xlinks(&arena, &url, None).unwrap();
        assert_eq!(xlinks.len(), 2);
        assert_eq!(xlinks[0].url, None);
        assert_eq!(
            xlinks[1].url.as_ref().map(Url::as_str),
            Some("http://localhost/dir/period.xml")
        );

        assert_eq!(apply_xlink(&mut arena, &xlinks[0], None), XlinkResolution::Removed);
        // Wrong root element keeps the original without its xlink.
        assert_eq!(
            apply_xlink(&mut arena, &xlinks[1], Some("<AdaptationSet/>")),
            XlinkResolution::KeptOriginal
        );
        let ids: Vec<_> = arena
            .root()
            .unwrap()
            .children_named("Period")
            .map(|p| (p.attr("id").unwrap().to_string(), p.has_attr("xlink:href")))
            .collect();
        assert_eq!(
            ids,
            [("remote".to_string(), false), ("lazy".to_string(), true)]
        );
    }
}
