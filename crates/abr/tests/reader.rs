use std::sync::Arc;

use iori_abr::{
    params::ParamDict,
    reader::PlaylistReader,
    session::PlayerEvent,
    PlayerError,
};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    fixtures::{init_tracing, session, wait_for},
    AssertWrapper,
};

const LIVE_MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" availabilityStartTime="2024-01-01T00:00:00Z"
     minimumUpdatePeriod="PT1S" minBufferTime="PT2S" timeShiftBufferDepth="PT30S">
  <Period id="live" start="PT0S">
    <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" duration="2000" media="$RepresentationID$/$Number$.m4s"
                       initialization="$RepresentationID$/init.mp4" startNumber="1"/>
      <Representation id="v1" bandwidth="400000" codecs="avc1.4d401f" width="640" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

const XLINK_MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:xlink="http://www.w3.org/1999/xlink"
     type="static" mediaPresentationDuration="PT10S" minBufferTime="PT2S">
  <Period id="p0" duration="PT5S" xlink:href="periods/first.xml" xlink:actuate="onLoad"/>
  <Period id="p1" duration="PT5S" xlink:href="periods/gone.xml" xlink:actuate="onLoad">
    <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" duration="2000" media="p1/$Number$.m4s" initialization="p1/init.mp4"/>
      <Representation id="v1" bandwidth="400000" codecs="avc1.4d401f"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

const REMOTE_PERIOD: &str = r#"<Period xmlns="urn:mpeg:dash:schema:mpd:2011" id="remote" duration="PT5S">
  <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
    <SegmentTemplate timescale="1000" duration="2000" media="remote/$Number$.m4s" initialization="remote/init.mp4"/>
    <Representation id="r1" bandwidth="400000" codecs="avc1.4d401f"/>
  </AdaptationSet>
</Period>"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refresh_not_modified() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    // Mounted first, so it wins over the unconditional mock once the ETag is sent back.
    Mock::given(method("GET"))
        .and(path("/live/manifest.mpd"))
        .and(header("If-None-Match", "\"rev-1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/manifest.mpd"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"rev-1\"")
                .set_body_string(LIVE_MPD),
        )
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/live/manifest.mpd", server.uri());
    let (session, channels) = session(ParamDict::new());
    tokio::task::spawn_blocking(move || {
        let reader = PlaylistReader::new(session.clone());
        reader.load_and_parse(&url).assert_success();
        wait_for(&channels.events, |e| matches!(e, PlayerEvent::ManifestLoaded { .. }));

        let manifest = session.manifest().assert_success();
        assert!(!manifest.is_static());
        assert!(manifest.are_updates_expected());
        assert_eq!(manifest.etag(), Some("\"rev-1\""));
        assert_eq!(manifest.periods[0].id, "live");
        let first_fetch = manifest.fetch_time();

        wait_for(&channels.events, |e| *e == PlayerEvent::ManifestNotModified);
        let current = session.manifest().assert_success();
        assert!(Arc::ptr_eq(&manifest, &current));
        assert!(current.fetch_time() > first_fetch);

        reader.close();
        assert!(channels.errors.try_recv().is_err());
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_xlink_periods_resolved() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vod/manifest.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(XLINK_MPD))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vod/periods/first.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(REMOTE_PERIOD))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vod/periods/gone.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = format!("{}/vod/manifest.mpd", server.uri());
    let (session, channels) = session(ParamDict::new());
    tokio::task::spawn_blocking(move || {
        let reader = PlaylistReader::new(session.clone());
        reader.load_and_parse(&url).assert_success();
        wait_for(&channels.events, |e| *e == PlayerEvent::InitialXlinkElementsResolved);
        wait_for(&channels.events, |e| matches!(e, PlayerEvent::ManifestLoaded { .. }));

        let manifest = session.manifest().assert_success();
        let ids: Vec<_> = manifest.periods.iter().map(|p| p.id.as_str()).collect();
        // The period whose remote element could not be loaded keeps its local content.
        assert_eq!(ids, ["remote", "p1"]);
        let representation = manifest.periods[0].adaptation_sets[0]
            .representation_by_id("r1")
            .assert_success();
        assert!(representation.is_usable());

        reader.close();
        assert!(channels.errors.try_recv().is_err());
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initial_load_gives_up_after_server_errors() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken/manifest.mpd"))
        .respond_with(ResponseTemplate::new(503))
        // The first attempt and two retries.
        .expect(3)
        .mount(&server)
        .await;

    let url = format!("{}/broken/manifest.mpd", server.uri());
    let (session, channels) = session(ParamDict::new());
    tokio::task::spawn_blocking(move || {
        let reader = PlaylistReader::new(session.clone());
        reader.load_and_parse(&url).assert_success();
        let error = channels
            .errors
            .recv_timeout(std::time::Duration::from_secs(10))
            .assert_success();
        assert!(matches!(error, PlayerError::ManifestLoadFailed(_)), "{error:?}");
        assert!(session.has_failed());
        assert!(session.manifest().is_none());
        reader.close();
    })
    .await?;
    Ok(())
}
