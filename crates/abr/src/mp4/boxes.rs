use bytes::Bytes;

use super::FourCC;
use crate::error::{PlayerError, PlayerResult};

pub(super) struct BoxCursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BoxCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn bytes(&mut self, count: usize) -> PlayerResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(PlayerError::Mp4Parsing(format!(
                "Box truncated: need {count} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn skip(&mut self, count: usize) -> PlayerResult<()> {
        self.bytes(count).map(|_| ())
    }

    pub fn u8(&mut self) -> PlayerResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> PlayerResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> PlayerResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> PlayerResult<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> PlayerResult<u64> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok(hi << 32 | lo)
    }

    pub fn fourcc(&mut self) -> PlayerResult<FourCC> {
        let b = self.bytes(4)?;
        Ok(FourCC([b[0], b[1], b[2], b[3]]))
    }

    pub fn array16(&mut self) -> PlayerResult<[u8; 16]> {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.bytes(16)?);
        Ok(out)
    }

    /// Version and flags of a full box.
    pub fn full_box(&mut self) -> PlayerResult<(u8, u32)> {
        let v = self.u32()?;
        Ok(((v >> 24) as u8, v & 0x00ff_ffff))
    }

    pub fn cstring(&mut self) -> PlayerResult<String> {
        let rest = &self.data[self.position..];
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.position += (end + 1).min(rest.len());
        Ok(text)
    }

    /// Reads the header of a child box. Returns the type and the payload.
    pub fn child_box(&mut self) -> PlayerResult<(FourCC, &'a [u8])> {
        let size = self.u32()? as u64;
        let box_type = self.fourcc()?;
        let (header, size) = match size {
            1 => (16, self.u64()?),
            0 => (8, (self.remaining() + 8) as u64),
            size => (8, size),
        };
        if size < header {
            return Err(PlayerError::Mp4Parsing(format!(
                "Box {box_type} has invalid size {size}"
            )));
        }
        let payload = self.bytes((size - header) as usize)?;
        Ok((box_type, payload))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackEncryption {
    pub scheme: Option<FourCC>,
    pub is_protected: bool,
    pub per_sample_iv_size: u8,
    pub default_kid: [u8; 16],
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub constant_iv: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub track_id: u32,
    pub handler: FourCC,
    pub timescale: u32,
    /// Sample entry type, the original format for encrypted entries.
    pub codec: FourCC,
    pub width: u16,
    pub height: u16,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// PCM samples per AAC access unit, from the AudioSpecificConfig.
    pub samples_per_block: Option<u32>,
    pub language: Option<String>,
    pub encryption: Option<TrackEncryption>,
}

impl Default for TrackInfo {
    fn default() -> Self {
        Self {
            track_id: 0,
            handler: FourCC(*b"\0\0\0\0"),
            timescale: 0,
            codec: FourCC(*b"\0\0\0\0"),
            width: 0,
            height: 0,
            sample_rate: 0,
            channel_count: 0,
            samples_per_block: None,
            language: None,
            encryption: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackExtends {
    pub track_id: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

#[derive(Debug, Clone)]
pub struct Pssh {
    pub system_id: [u8; 16],
    pub kids: Vec<[u8; 16]>,
    pub data: Bytes,
    /// The complete box including its header.
    pub raw: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentIndexReference {
    /// `true` if the reference points at another `sidx`.
    pub reference_type: bool,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

#[derive(Debug, Clone)]
pub struct SegmentIndex {
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub first_offset: u64,
    pub references: Vec<SegmentIndexReference>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub version: u8,
    pub scheme_id_uri: String,
    pub value: String,
    pub timescale: u32,
    /// Relative to the segment's earliest presentation time for version 0, absolute for
    /// version 1.
    pub presentation_time: u64,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSample {
    pub clear_bytes: u16,
    pub protected_bytes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SampleEncryptionEntry {
    pub iv: Vec<u8>,
    pub subsamples: Vec<SubSample>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub composition_offset: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackRun {
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrunSample>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackFragment {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub default_base_is_moof: bool,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub base_media_decode_time: Option<u64>,
    pub runs: Vec<TrackRun>,
    /// Raw `senc` payload. It can only be decoded once the IV size is known.
    senc: Option<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub struct MovieFragment {
    pub sequence_number: u32,
    /// File offset of the first byte of the `moof` box.
    pub offset: u64,
    pub tracks: Vec<TrackFragment>,
}

/// One sample resolved from a track fragment.
#[derive(Debug, Clone)]
pub struct Sample {
    pub dts: i64,
    pub pts: i64,
    pub duration: u32,
    pub size: u32,
    pub is_sync: bool,
    pub file_offset: u64,
    pub encryption: Option<SampleEncryptionEntry>,
}

const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

impl MovieFragment {
    /// Resolves the samples of `track` in decode order.
    pub fn samples(&self, track: &TrackInfo, trex: Option<&TrackExtends>) -> PlayerResult<Vec<Sample>> {
        let Some(traf) = self.tracks.iter().find(|t| t.track_id == track.track_id) else {
            return Ok(Vec::new());
        };
        let default_duration = traf
            .default_sample_duration
            .or(trex.map(|t| t.default_sample_duration))
            .unwrap_or(0);
        let default_size = traf
            .default_sample_size
            .or(trex.map(|t| t.default_sample_size))
            .unwrap_or(0);
        let default_flags = traf
            .default_sample_flags
            .or(trex.map(|t| t.default_sample_flags))
            .unwrap_or(0);

        let encryption = match (&traf.senc, &track.encryption) {
            (Some(senc), Some(tenc)) => parse_senc(senc, tenc.per_sample_iv_size)?,
            _ => Vec::new(),
        };

        let base = traf.base_data_offset.unwrap_or(self.offset);
        let mut samples = Vec::new();
        let mut dts = traf.base_media_decode_time.unwrap_or(0) as i64;
        let mut position = base;
        for run in &traf.runs {
            if let Some(data_offset) = run.data_offset {
                position = base.checked_add_signed(data_offset as i64).ok_or_else(|| {
                    PlayerError::Mp4Parsing("trun data offset points before the file".into())
                })?;
            }
            for (index, entry) in run.samples.iter().enumerate() {
                let duration = entry.duration.unwrap_or(default_duration);
                let size = entry.size.unwrap_or(default_size);
                let flags = match (index, run.first_sample_flags) {
                    (0, Some(flags)) => flags,
                    _ => entry.flags.unwrap_or(default_flags),
                };
                let mut encryption_entry = encryption.get(samples.len()).cloned();
                if let (Some(entry), Some(tenc)) = (encryption_entry.as_mut(), &track.encryption) {
                    if entry.iv.is_empty() {
                        entry.iv = tenc.constant_iv.clone().unwrap_or_default();
                    }
                }
                samples.push(Sample {
                    dts,
                    pts: dts + entry.composition_offset.unwrap_or(0),
                    duration,
                    size,
                    is_sync: flags & SAMPLE_IS_NON_SYNC == 0,
                    file_offset: position,
                    encryption: encryption_entry,
                });
                dts += duration as i64;
                position += size as u64;
            }
        }
        Ok(samples)
    }
}

pub(super) fn parse_tkhd(payload: &[u8], track: &mut TrackInfo) -> PlayerResult<()> {
    let mut c = BoxCursor::new(payload);
    let (version, _) = c.full_box()?;
    if version == 1 {
        c.skip(16)?;
        track.track_id = c.u32()?;
        c.skip(4 + 8)?;
    } else {
        c.skip(8)?;
        track.track_id = c.u32()?;
        c.skip(4 + 4)?;
    }
    // reserved, layer, alternate_group, volume, reserved, matrix
    c.skip(8 + 2 + 2 + 2 + 2 + 36)?;
    let width = c.u32()? >> 16;
    let height = c.u32()? >> 16;
    if track.width == 0 {
        track.width = width as u16;
        track.height = height as u16;
    }
    Ok(())
}

pub(super) fn parse_mdhd(payload: &[u8], track: &mut TrackInfo) -> PlayerResult<()> {
    let mut c = BoxCursor::new(payload);
    let (version, _) = c.full_box()?;
    if version == 1 {
        c.skip(16)?;
        track.timescale = c.u32()?;
        c.skip(8)?;
    } else {
        c.skip(8)?;
        track.timescale = c.u32()?;
        c.skip(4)?;
    }
    let language = c.u16()?;
    if language != 0 {
        let chars = [
            ((language >> 10) & 0x1f) as u8 + 0x60,
            ((language >> 5) & 0x1f) as u8 + 0x60,
            (language & 0x1f) as u8 + 0x60,
        ];
        track.language = Some(String::from_utf8_lossy(&chars).into_owned());
    }
    Ok(())
}

pub(super) fn parse_hdlr(payload: &[u8], track: &mut TrackInfo) -> PlayerResult<()> {
    let mut c = BoxCursor::new(payload);
    c.full_box()?;
    c.skip(4)?;
    track.handler = c.fourcc()?;
    Ok(())
}

pub(super) fn parse_stsd(payload: &[u8], track: &mut TrackInfo) -> PlayerResult<()> {
    let mut c = BoxCursor::new(payload);
    c.full_box()?;
    let entry_count = c.u32()?;
    if entry_count == 0 {
        return Err(PlayerError::Mp4Parsing("stsd has no sample entry".into()));
    }
    let (entry_type, entry) = c.child_box()?;
    track.codec = entry_type;

    let mut e = BoxCursor::new(entry);
    let children_at = match track.handler {
        FourCC::HANDLER_VIDEO => {
            e.skip(6 + 2 + 2 + 2 + 12)?;
            track.width = e.u16()?;
            track.height = e.u16()?;
            Some(78)
        }
        FourCC::HANDLER_AUDIO => {
            e.skip(6 + 2 + 8)?;
            track.channel_count = e.u16()?;
            e.skip(2 + 2 + 2)?;
            track.sample_rate = e.u32()? >> 16;
            Some(28)
        }
        _ => None,
    };

    if let Some(children_at) = children_at.filter(|at| *at <= entry.len()) {
        let mut children = BoxCursor::new(&entry[children_at..]);
        while children.remaining() >= 8 {
            let (child_type, child) = children.child_box()?;
            match child_type {
                FourCC::SINF => parse_sinf(child, track)?,
                FourCC::ESDS => track.samples_per_block = parse_esds(child),
                _ => {}
            }
        }
    }
    Ok(())
}

/// Length of an MPEG-4 descriptor, 7 bits per byte.
fn descriptor_length(c: &mut BoxCursor<'_>) -> PlayerResult<usize> {
    let mut length = 0usize;
    for _ in 0..4 {
        let b = c.u8()?;
        length = length << 7 | (b & 0x7f) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(length)
}

/// Samples per block of an AAC elementary stream. `None` when the descriptor cannot be read or
/// the stream is not AAC.
fn parse_esds(payload: &[u8]) -> Option<u32> {
    let mut c = BoxCursor::new(payload);
    c.full_box().ok()?;
    if c.u8().ok()? != 0x03 {
        return None;
    }
    descriptor_length(&mut c).ok()?;
    c.skip(2).ok()?;
    let flags = c.u8().ok()?;
    if flags & 0x80 != 0 {
        c.skip(2).ok()?;
    }
    if flags & 0x40 != 0 {
        let len = c.u8().ok()? as usize;
        c.skip(len).ok()?;
    }
    if flags & 0x20 != 0 {
        c.skip(2).ok()?;
    }
    if c.u8().ok()? != 0x04 {
        return None;
    }
    descriptor_length(&mut c).ok()?;
    let object_type = c.u8().ok()?;
    // MPEG-4 audio and the MPEG-2 AAC profiles.
    if !matches!(object_type, 0x40 | 0x66..=0x68) {
        return None;
    }
    c.skip(1 + 3 + 4 + 4).ok()?;
    if c.u8().ok()? != 0x05 {
        return None;
    }
    let length = descriptor_length(&mut c).ok()?;
    audio_specific_config_samples(c.bytes(length).ok()?)
}

fn audio_specific_config_samples(config: &[u8]) -> Option<u32> {
    let mut bits = BitReader::new(config);
    let mut object_type = bits.read(5)?;
    if object_type == 31 {
        object_type = 32 + bits.read(6)?;
    }
    if bits.read(4)? == 0xf {
        bits.read(24)?;
    }
    bits.read(4)?;
    if matches!(object_type, 5 | 29) {
        if bits.read(4)? == 0xf {
            bits.read(24)?;
        }
        object_type = bits.read(5)?;
        if object_type == 31 {
            object_type = 32 + bits.read(6)?;
        }
    }
    match object_type {
        1..=4 | 6 | 7 | 17 | 19..=23 => Some(if bits.read(1)? == 1 { 960 } else { 1024 }),
        _ => None,
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn read(&mut self, count: usize) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            let byte = *self.data.get(self.position / 8)?;
            let bit = byte >> (7 - self.position % 8) & 1;
            value = value << 1 | bit as u32;
            self.position += 1;
        }
        Some(value)
    }
}

fn parse_sinf(payload: &[u8], track: &mut TrackInfo) -> PlayerResult<()> {
    let mut encryption = track.encryption.take().unwrap_or_default();
    let mut c = BoxCursor::new(payload);
    while c.remaining() >= 8 {
        let (box_type, child) = c.child_box()?;
        let mut b = BoxCursor::new(child);
        match box_type {
            FourCC::FRMA => track.codec = b.fourcc()?,
            FourCC::SCHM => {
                b.full_box()?;
                encryption.scheme = Some(b.fourcc()?);
            }
            FourCC::SCHI => {
                while b.remaining() >= 8 {
                    let (inner_type, inner) = b.child_box()?;
                    if inner_type == FourCC::TENC {
                        parse_tenc(inner, &mut encryption)?;
                    }
                }
            }
            _ => {}
        }
    }
    track.encryption = Some(encryption);
    Ok(())
}

fn parse_tenc(payload: &[u8], encryption: &mut TrackEncryption) -> PlayerResult<()> {
    let mut c = BoxCursor::new(payload);
    let (version, _) = c.full_box()?;
    c.skip(1)?;
    let pattern = c.u8()?;
    if version > 0 {
        encryption.crypt_byte_block = pattern >> 4;
        encryption.skip_byte_block = pattern & 0x0f;
    }
    encryption.is_protected = c.u8()? == 1;
    encryption.per_sample_iv_size = c.u8()?;
    encryption.default_kid = c.array16()?;
    if encryption.is_protected && encryption.per_sample_iv_size == 0 {
        let size = c.u8()? as usize;
        encryption.constant_iv = Some(c.bytes(size)?.to_vec());
    }
    Ok(())
}

pub(super) fn parse_trex(payload: &[u8]) -> PlayerResult<TrackExtends> {
    let mut c = BoxCursor::new(payload);
    c.full_box()?;
    let track_id = c.u32()?;
    c.skip(4)?;
    Ok(TrackExtends {
        track_id,
        default_sample_duration: c.u32()?,
        default_sample_size: c.u32()?,
        default_sample_flags: c.u32()?,
    })
}

pub(super) fn parse_mfhd(payload: &[u8]) -> PlayerResult<u32> {
    let mut c = BoxCursor::new(payload);
    c.full_box()?;
    c.u32()
}

pub(super) fn parse_traf(payload: &[u8]) -> PlayerResult<TrackFragment> {
    let mut traf = TrackFragment::default();
    let mut c = BoxCursor::new(payload);
    while c.remaining() >= 8 {
        let (box_type, child) = c.child_box()?;
        match box_type {
            FourCC::TFHD => parse_tfhd(child, &mut traf)?,
            FourCC::TFDT => {
                let mut b = BoxCursor::new(child);
                let (version, _) = b.full_box()?;
                traf.base_media_decode_time = Some(if version == 1 {
                    b.u64()?
                } else {
                    b.u32()? as u64
                });
            }
            FourCC::TRUN => traf.runs.push(parse_trun(child)?),
            FourCC::SENC => traf.senc = Some(Bytes::copy_from_slice(child)),
            _ => {}
        }
    }
    Ok(traf)
}

fn parse_tfhd(payload: &[u8], traf: &mut TrackFragment) -> PlayerResult<()> {
    let mut c = BoxCursor::new(payload);
    let (_, flags) = c.full_box()?;
    traf.track_id = c.u32()?;
    if flags & 0x01 != 0 {
        traf.base_data_offset = Some(c.u64()?);
    }
    if flags & 0x02 != 0 {
        c.skip(4)?;
    }
    if flags & 0x08 != 0 {
        traf.default_sample_duration = Some(c.u32()?);
    }
    if flags & 0x10 != 0 {
        traf.default_sample_size = Some(c.u32()?);
    }
    if flags & 0x20 != 0 {
        traf.default_sample_flags = Some(c.u32()?);
    }
    traf.default_base_is_moof = flags & 0x2_0000 != 0;
    Ok(())
}

fn parse_trun(payload: &[u8]) -> PlayerResult<TrackRun> {
    let mut c = BoxCursor::new(payload);
    let (version, flags) = c.full_box()?;
    let sample_count = c.u32()?;
    let mut run = TrackRun::default();
    if flags & 0x01 != 0 {
        run.data_offset = Some(c.i32()?);
    }
    if flags & 0x04 != 0 {
        run.first_sample_flags = Some(c.u32()?);
    }
    for _ in 0..sample_count {
        let mut sample = TrunSample::default();
        if flags & 0x100 != 0 {
            sample.duration = Some(c.u32()?);
        }
        if flags & 0x200 != 0 {
            sample.size = Some(c.u32()?);
        }
        if flags & 0x400 != 0 {
            sample.flags = Some(c.u32()?);
        }
        if flags & 0x800 != 0 {
            sample.composition_offset = Some(if version == 0 {
                c.u32()? as i64
            } else {
                c.i32()? as i64
            });
        }
        run.samples.push(sample);
    }
    Ok(run)
}

fn parse_senc(payload: &[u8], iv_size: u8) -> PlayerResult<Vec<SampleEncryptionEntry>> {
    let mut c = BoxCursor::new(payload);
    let (_, flags) = c.full_box()?;
    let count = c.u32()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let iv = c.bytes(iv_size as usize)?.to_vec();
        let mut subsamples = Vec::new();
        if flags & 0x02 != 0 {
            let subsample_count = c.u16()?;
            for _ in 0..subsample_count {
                subsamples.push(SubSample {
                    clear_bytes: c.u16()?,
                    protected_bytes: c.u32()?,
                });
            }
        }
        entries.push(SampleEncryptionEntry { iv, subsamples });
    }
    Ok(entries)
}

pub(super) fn parse_sidx(payload: &[u8]) -> PlayerResult<SegmentIndex> {
    let mut c = BoxCursor::new(payload);
    let (version, _) = c.full_box()?;
    let reference_id = c.u32()?;
    let timescale = c.u32()?;
    let (earliest_presentation_time, first_offset) = if version == 0 {
        (c.u32()? as u64, c.u32()? as u64)
    } else {
        (c.u64()?, c.u64()?)
    };
    c.skip(2)?;
    let count = c.u16()?;
    let mut references = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let a = c.u32()?;
        let subsegment_duration = c.u32()?;
        let b = c.u32()?;
        references.push(SegmentIndexReference {
            reference_type: a >> 31 == 1,
            referenced_size: a & 0x7fff_ffff,
            subsegment_duration,
            starts_with_sap: b >> 31 == 1,
            sap_type: ((b >> 28) & 0x07) as u8,
            sap_delta_time: b & 0x0fff_ffff,
        });
    }
    Ok(SegmentIndex {
        reference_id,
        timescale,
        earliest_presentation_time,
        first_offset,
        references,
    })
}

pub(super) fn parse_emsg(payload: &[u8]) -> PlayerResult<EventMessage> {
    let mut c = BoxCursor::new(payload);
    let (version, _) = c.full_box()?;
    let (scheme_id_uri, value, timescale, presentation_time, event_duration, id) = match version {
        0 => {
            let scheme = c.cstring()?;
            let value = c.cstring()?;
            (scheme, value, c.u32()?, c.u32()? as u64, c.u32()?, c.u32()?)
        }
        1 => {
            let timescale = c.u32()?;
            let presentation_time = c.u64()?;
            let event_duration = c.u32()?;
            let id = c.u32()?;
            (c.cstring()?, c.cstring()?, timescale, presentation_time, event_duration, id)
        }
        version => {
            return Err(PlayerError::Mp4Parsing(format!(
                "Unsupported emsg version {version}"
            )))
        }
    };
    let message_data = Bytes::copy_from_slice(c.bytes(c.remaining())?);
    Ok(EventMessage {
        version,
        scheme_id_uri,
        value,
        timescale,
        presentation_time,
        event_duration,
        id,
        message_data,
    })
}

pub(super) fn parse_pssh(payload: &[u8], raw: Bytes) -> PlayerResult<Pssh> {
    let mut c = BoxCursor::new(payload);
    let (version, _) = c.full_box()?;
    let system_id = c.array16()?;
    let mut kids = Vec::new();
    if version > 0 {
        let count = c.u32()?;
        for _ in 0..count {
            kids.push(c.array16()?);
        }
    }
    let size = c.u32()? as usize;
    let data = Bytes::copy_from_slice(c.bytes(size)?);
    Ok(Pssh {
        system_id,
        kids,
        data,
        raw,
    })
}
