use url::Url;

use super::xml::Element;
use crate::{error::PlayerResult, util::ByteRange};

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://")
        || s.starts_with("https://")
        || s.starts_with("file://")
        || s.starts_with("ftp://")
}

pub(crate) fn merge_baseurls(current: &Url, new: &str) -> PlayerResult<Url> {
    if is_absolute_url(new) {
        Ok(Url::parse(new)?)
    } else {
        // The query of the current URL (the manifest URL, the URL it redirected to, or an outer
        // BaseURL) carries over unless the new URL has its own.
        //
        // merge_baseurls(https://example.com/manifest.mpd?auth=secret, /video42.mp4) =>
        //   https://example.com/video42.mp4?auth=secret
        let mut merged = current.join(new)?;
        if merged.query().is_none() {
            merged.set_query(current.query());
        }
        Ok(merged)
    }
}

/// Resolves the `BaseURL` chain from the MPD element down to `levels.last()`.
///
/// On every level the `BaseURL` whose `serviceLocation` equals `service_location` is taken,
/// otherwise the first one.
pub(crate) fn resolve_base_url(
    document_url: &Url,
    levels: &[Element<'_>],
    service_location: Option<&str>,
) -> PlayerResult<Url> {
    let mut current = document_url.clone();
    for level in levels {
        let mut candidates = level.children_named("BaseURL").peekable();
        if candidates.peek().is_none() {
            continue;
        }
        let candidates: Vec<_> = candidates.collect();
        let chosen = service_location
            .and_then(|location| {
                candidates
                    .iter()
                    .find(|base| base.attr("serviceLocation") == Some(location))
            })
            .unwrap_or(&candidates[0]);
        let text = chosen.text();
        if !text.is_empty() {
            current = merge_baseurls(&current, text)?;
        }
    }
    Ok(current)
}

/// Resolves a relative segment URL against the base URL. An empty URL refers to the base URL
/// itself.
pub(crate) fn resolve_segment_url(base: &Url, url: Option<&str>) -> PlayerResult<Url> {
    match url {
        Some(url) if !url.is_empty() => merge_baseurls(base, url),
        _ => Ok(base.clone()),
    }
}

/// `UrlQueryInfo` of the URL parameter descriptor (`urn:mpeg:dash:urlparam:2014`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlQueryInfo {
    pub query_template: String,
    pub use_mpd_url_query: bool,
    pub query_string: Option<String>,
}

const URL_PARAM_SCHEMES: [&str; 2] = ["urn:mpeg:dash:urlparam:2014", "urn:mpeg:dash:urlparam:2016"];

/// Collects the `UrlQueryInfo` elements declared on any of the levels, outermost first.
pub(crate) fn collect_url_queries(levels: &[Element<'_>]) -> Vec<UrlQueryInfo> {
    let mut queries = Vec::new();
    for level in levels {
        for property in level
            .children()
            .filter(|e| matches!(e.name(), "EssentialProperty" | "SupplementalProperty"))
            .filter(|e| {
                e.attr("schemeIdUri")
                    .is_some_and(|scheme| URL_PARAM_SCHEMES.contains(&scheme))
            })
        {
            for info in property.children_named("UrlQueryInfo") {
                queries.push(UrlQueryInfo {
                    query_template: info.attr("queryTemplate").unwrap_or_default().to_string(),
                    use_mpd_url_query: info.attr_bool("useMPDUrlQuery").unwrap_or(false),
                    query_string: info.attr("queryString").map(str::to_string),
                });
            }
        }
    }
    queries
}

/// Appends the queries requested by `UrlQueryInfo` to a segment URL.
pub(crate) fn apply_url_queries(mut url: Url, mpd_url: &Url, queries: &[UrlQueryInfo]) -> Url {
    for query in queries {
        if query.query_template != "$querypart$" {
            continue;
        }
        let mut parts = Vec::new();
        if query.use_mpd_url_query {
            if let Some(mpd_query) = mpd_url.query().filter(|q| !q.is_empty()) {
                parts.push(mpd_query.to_string());
            }
        }
        if let Some(query_string) = query.query_string.as_deref().filter(|q| !q.is_empty()) {
            parts.push(query_string.to_string());
        }
        if parts.is_empty() {
            continue;
        }
        let addition = parts.join("&");
        let merged = match url.query().filter(|q| !q.is_empty()) {
            Some(existing) if existing.contains(&addition) => existing.to_string(),
            Some(existing) => format!("{existing}&{addition}"),
            None => addition,
        };
        url.set_query(Some(&merged));
    }
    url
}

/// Parses an optional `mediaRange`/`indexRange`/`range` attribute.
pub(crate) fn parse_range_attr(element: &Element<'_>, name: &str) -> Option<ByteRange> {
    let value = element.attr(name)?;
    match value.parse() {
        Ok(range) => Some(range),
        Err(_) => {
            tracing::warn!(attribute = name, value, "Ignoring malformed byte range");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpd::xml::XmlArena;

    #[test]
    fn test_merge_baseurls_keeps_query() {
        let base = Url::parse("https://example.com/manifest.mpd?auth=secret").unwrap();
        assert_eq!(
            merge_baseurls(&base, "/video42.mp4").unwrap().as_str(),
            "https://example.com/video42.mp4?auth=secret"
        );
        assert_eq!(
            merge_baseurls(&base, "/video42.mp4?auth=new").unwrap().as_str(),
            "https://example.com/video42.mp4?auth=new"
        );
        assert_eq!(
            merge_baseurls(&base, "http://cdn.example.com/a/").unwrap().as_str(),
            "http://cdn.example.com/a/"
        );
    }

    #[test]
    fn test_base_url_chain_prefers_service_location() {
        let arena = XmlArena::parse(
            r#"<MPD>
                <BaseURL serviceLocation="a">http://a.example.com/content/</BaseURL>
                <BaseURL serviceLocation="b">http://b.example.com/content/</BaseURL>
                <Period><AdaptationSet><BaseURL>video/</BaseURL></AdaptationSet></Period>
            </MPD>"#,
        )
        .unwrap();
        let mpd = arena.root().unwrap();
        let period = mpd.child("Period").unwrap();
        let adaptation_set = period.child("AdaptationSet").unwrap();
        let document = Url::parse("http://origin/manifest.mpd").unwrap();

        let levels = [mpd, period, adaptation_set];
        assert_eq!(
            resolve_base_url(&document, &levels, None).unwrap().as_str(),
            "http://a.example.com/content/video/"
        );
        assert_eq!(
            resolve_base_url(&document, &levels, Some("b")).unwrap().as_str(),
            "http://b.example.com/content/video/"
        );
    }

    #[test]
    fn test_url_query_info() {
        let arena = XmlArena::parse(
            r#"<AdaptationSet>
                <SupplementalProperty schemeIdUri="urn:mpeg:dash:urlparam:2014">
                  <up:UrlQueryInfo queryTemplate="$querypart$" useMPDUrlQuery="true"/>
                </SupplementalProperty>
            </AdaptationSet>"#,
        )
        .unwrap();
        let queries = collect_url_queries(&[arena.root().unwrap()]);
        assert_eq!(queries.len(), 1);

        let mpd_url = Url::parse("http://origin/manifest.mpd?token=abc").unwrap();
        let segment = Url::parse("http://cdn/seg-1.m4s").unwrap();
        assert_eq!(
            apply_url_queries(segment, &mpd_url, &queries).as_str(),
            "http://cdn/seg-1.m4s?token=abc"
        );
    }
}
