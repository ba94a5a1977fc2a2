use std::sync::Arc;

use url::Url;

use crate::{
    http::StaticTransport,
    mpd::{build_manifest, BuildOptions, Manifest, MpdDocument, XmlArena},
    params::ParamDict,
    session::PlayerSession,
};

pub(crate) const MANIFEST_URL: &str = "http://localhost/content/manifest.mpd";

/// A session whose current manifest is `xml`, served from [`MANIFEST_URL`].
pub(crate) fn session_with_manifest(xml: &str) -> (Arc<PlayerSession>, Arc<Manifest>) {
    session_with_transport(xml, Arc::new(StaticTransport::new()))
}

pub(crate) fn session_with_transport(
    xml: &str,
    transport: Arc<StaticTransport>,
) -> (Arc<PlayerSession>, Arc<Manifest>) {
    let (session, _channels) = PlayerSession::new(ParamDict::new(), transport, None);
    let arena = XmlArena::parse(xml).unwrap();
    let document = Arc::new(MpdDocument::new(
        session.documents().next_generation(),
        arena,
        Url::parse(MANIFEST_URL).unwrap(),
        None,
    ));
    session.documents().publish(document.clone());
    let manifest = Arc::new(build_manifest(document, &BuildOptions::default()).unwrap());
    session.set_manifest(manifest.clone());
    (session, manifest)
}

pub(crate) fn mp4_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(box_type);
    out.extend_from_slice(payload);
    out
}

pub(crate) fn full_box(box_type: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = (((version as u32) << 24) | flags).to_be_bytes().to_vec();
    body.extend_from_slice(payload);
    mp4_box(box_type, &body)
}

/// Initialization segment with a single track with ID 1.
pub(crate) fn init_segment(handler: &[u8; 4], timescale: u32) -> Vec<u8> {
    let mut tkhd = vec![0u8; 8];
    tkhd.extend_from_slice(&1u32.to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 4 + 4 + 8 + 2 + 2 + 2 + 2 + 36]);
    tkhd.extend_from_slice(&(640u32 << 16).to_be_bytes());
    tkhd.extend_from_slice(&(360u32 << 16).to_be_bytes());

    let mut mdhd = vec![0u8; 8];
    mdhd.extend_from_slice(&timescale.to_be_bytes());
    mdhd.extend_from_slice(&[0, 0, 0, 0, 0x15, 0xc7, 0, 0]);

    let mut hdlr = vec![0u8; 4];
    hdlr.extend_from_slice(handler);
    hdlr.extend_from_slice(&[0u8; 13]);

    let mut trex = 1u32.to_be_bytes().to_vec();
    for value in [1u32, 0, 0, 0] {
        trex.extend_from_slice(&value.to_be_bytes());
    }

    let mdia = [full_box(b"mdhd", 0, 0, &mdhd), full_box(b"hdlr", 0, 0, &hdlr)].concat();
    let trak = [full_box(b"tkhd", 0, 7, &tkhd), mp4_box(b"mdia", &mdia)].concat();
    let moov = [
        mp4_box(b"trak", &trak),
        mp4_box(b"mvex", &full_box(b"trex", 0, 0, &trex)),
    ]
    .concat();
    [mp4_box(b"ftyp", b"iso6\0\0\0\0iso6dash"), mp4_box(b"moov", &moov)].concat()
}

/// Media segment with `count` sync samples of `duration` ticks starting at `decode_time`.
/// Sample `i` consists of `sample_size` bytes of value `i`.
pub(crate) fn media_segment(decode_time: u64, count: u32, duration: u32, sample_size: u32) -> Vec<u8> {
    let mut trun = count.to_be_bytes().to_vec();
    trun.extend_from_slice(&0i32.to_be_bytes());
    for _ in 0..count {
        trun.extend_from_slice(&duration.to_be_bytes());
        trun.extend_from_slice(&sample_size.to_be_bytes());
        trun.extend_from_slice(&0u32.to_be_bytes());
    }
    let traf = [
        full_box(b"tfhd", 0, 0x2_0000, &1u32.to_be_bytes()),
        full_box(b"tfdt", 1, 0, &decode_time.to_be_bytes()),
        full_box(b"trun", 0, 0x001 | 0x100 | 0x200 | 0x400, &trun),
    ]
    .concat();
    let moof_payload = [full_box(b"mfhd", 0, 0, &1u32.to_be_bytes()), mp4_box(b"traf", &traf)].concat();

    // Point the data offset right behind the mdat header.
    let data_offset = (moof_payload.len() + 8 + 8) as i32;
    let mut moof = mp4_box(b"moof", &moof_payload);
    let trun_pos = moof.windows(4).position(|w| w == b"trun").unwrap();
    let field = trun_pos + 4 + 4 + 4;
    moof[field..field + 4].copy_from_slice(&data_offset.to_be_bytes());

    let mdat: Vec<u8> = (0..count)
        .flat_map(|i| std::iter::repeat(i as u8).take(sample_size as usize))
        .collect();
    [mp4_box(b"styp", b"msdh\0\0\0\0msdh"), moof, mp4_box(b"mdat", &mdat)].concat()
}

/// Version 0 `emsg` box.
pub(crate) fn emsg_v0(scheme: &str, value: &str, timescale: u32, delta: u32, id: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    for text in [scheme, value] {
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
    }
    for field in [timescale, delta, 0xFFFF_FFFF, id] {
        payload.extend_from_slice(&field.to_be_bytes());
    }
    full_box(b"emsg", 0, 0, &payload)
}
