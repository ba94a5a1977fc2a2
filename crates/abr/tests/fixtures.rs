//! Synthesized fragmented MP4 payloads and session plumbing shared by the tests.

use std::{
    sync::{mpsc::Receiver, Arc},
    time::Duration,
};

use iori_abr::{
    http::ReqwestTransport,
    params::ParamDict,
    session::{PlayerEvent, PlayerSession, SessionChannels},
};

pub fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A session talking to the mock server through reqwest on the test runtime.
pub fn session(options: ParamDict) -> (Arc<PlayerSession>, SessionChannels) {
    let transport = ReqwestTransport::new(reqwest::Client::new(), tokio::runtime::Handle::current());
    PlayerSession::new(options, Arc::new(transport), None)
}

pub fn wait_for(events: &Receiver<PlayerEvent>, wanted: impl Fn(&PlayerEvent) -> bool) -> PlayerEvent {
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(10))
            .expect("event not received in time");
        if wanted(&event) {
            return event;
        }
    }
}

fn mp4_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(box_type);
    out.extend_from_slice(payload);
    out
}

fn full_box(box_type: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = (((version as u32) << 24) | flags).to_be_bytes().to_vec();
    body.extend_from_slice(payload);
    mp4_box(box_type, &body)
}

/// Video initialization segment with track 1 at `timescale`.
pub fn init_segment(timescale: u32) -> Vec<u8> {
    let mut tkhd = vec![0u8; 8];
    tkhd.extend_from_slice(&1u32.to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 60]);
    tkhd.extend_from_slice(&(640u32 << 16).to_be_bytes());
    tkhd.extend_from_slice(&(360u32 << 16).to_be_bytes());

    let mut mdhd = vec![0u8; 8];
    mdhd.extend_from_slice(&timescale.to_be_bytes());
    mdhd.extend_from_slice(&[0, 0, 0, 0, 0x15, 0xc7, 0, 0]);

    let mut hdlr = vec![0u8; 4];
    hdlr.extend_from_slice(b"vide");
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

/// Media segment of `count` sync samples of `duration` ticks from `decode_time` on.
pub fn media_segment(decode_time: u64, count: u32, duration: u32, sample_size: u32) -> Vec<u8> {
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
        full_box(b"trun", 0, 0x701, &trun),
    ]
    .concat();
    let moof_payload = [full_box(b"mfhd", 0, 0, &1u32.to_be_bytes()), mp4_box(b"traf", &traf)].concat();

    let data_offset = (moof_payload.len() + 16) as i32;
    let mut moof = mp4_box(b"moof", &moof_payload);
    let trun_pos = moof.windows(4).position(|w| w == b"trun").unwrap();
    let field = trun_pos + 12;
    moof[field..field + 4].copy_from_slice(&data_offset.to_be_bytes());

    let mdat = vec![0xAB; (count * sample_size) as usize];
    [mp4_box(b"styp", b"msdh\0\0\0\0msdh"), moof, mp4_box(b"mdat", &mdat)].concat()
}
