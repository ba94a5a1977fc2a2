use bytes::Bytes;

use super::{
    boxes::{self, BoxCursor},
    BoxCallback, BoxReader, EventMessage, FourCC, MovieFragment, ParseContinuation, Pssh,
    SegmentIndex, SliceReader, TrackExtends, TrackInfo,
};
use crate::error::{PlayerError, PlayerResult};

/// Track metadata of an initialization segment.
#[derive(Debug, Clone, Default)]
pub struct InitSegment {
    pub brands: Vec<FourCC>,
    pub tracks: Vec<TrackInfo>,
    pub trex: Vec<TrackExtends>,
    pub pssh: Vec<Pssh>,
}

impl InitSegment {
    /// Parses a complete initialization segment held in memory.
    pub fn parse(data: impl Into<Bytes>) -> PlayerResult<Self> {
        let mut parser = Mp4Parser::new();
        let mut reader = SliceReader::new(data);
        parser.parse_header(&mut reader, &mut ContinueAll)?;
        parser
            .take_init_segment()
            .ok_or_else(|| PlayerError::Mp4Parsing("No moov box found".into()))
    }

    pub fn track_extends(&self, track_id: u32) -> Option<&TrackExtends> {
        self.trex.iter().find(|t| t.track_id == track_id)
    }
}

struct ContinueAll;

impl BoxCallback for ContinueAll {
    fn on_found_box(&mut self, _: FourCC, _: u64, _: u64) -> ParseContinuation {
        ParseContinuation::Continue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The callback stopped parsing. The reader is positioned at the payload of `box_type` if
    /// it was stopped on finding the box, or right after the box otherwise.
    Stopped {
        box_type: FourCC,
        /// Bytes of the box not yet consumed. `None` for a box that extends to the end of the
        /// stream.
        remaining: Option<u64>,
    },
    EndOfStream,
}

/// Incremental top-level box walker.
///
/// Every call of [`Mp4Parser::parse_header`] continues where the previous one stopped. Boxes
/// other than `mdat` are read into memory and parsed; the results of one call are available
/// until the next call starts.
#[derive(Debug, Default)]
pub struct Mp4Parser {
    init: Option<InitSegment>,
    brands: Vec<FourCC>,
    fragments: Vec<MovieFragment>,
    events: Vec<EventMessage>,
    pssh: Vec<Pssh>,
    segment_index: Option<SegmentIndex>,
    fragment_count: usize,
}

impl Mp4Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_header(
        &mut self,
        reader: &mut dyn BoxReader,
        callback: &mut dyn BoxCallback,
    ) -> PlayerResult<ParseStatus> {
        self.fragments.clear();
        self.events.clear();

        loop {
            if reader.has_reached_eof() {
                return Ok(ParseStatus::EndOfStream);
            }
            let box_offset = reader.current_offset();
            let mut header = [0u8; 8];
            match read_exact(reader, &mut header)? {
                0 => return Ok(ParseStatus::EndOfStream),
                8 => {}
                n => {
                    return Err(PlayerError::Mp4Parsing(format!(
                        "Truncated box header at offset {box_offset} ({n} bytes)"
                    )))
                }
            }
            let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let box_type = FourCC([header[4], header[5], header[6], header[7]]);
            let mut header_size = 8u64;
            let box_size = match size {
                1 => {
                    let mut large = [0u8; 8];
                    if read_exact(reader, &mut large)? != 8 {
                        return Err(PlayerError::Mp4Parsing("Truncated largesize".into()));
                    }
                    header_size += 8;
                    Some(u64::from_be_bytes(large))
                }
                0 => None,
                size => Some(size),
            };
            if box_type == FourCC::UUID {
                let mut user_type = [0u8; 16];
                if read_exact(reader, &mut user_type)? != 16 {
                    return Err(PlayerError::Mp4Parsing("Truncated uuid box".into()));
                }
                header_size += 16;
            }
            let payload_size = match box_size {
                Some(size) if size < header_size => {
                    return Err(PlayerError::Mp4Parsing(format!(
                        "Box {box_type} at offset {box_offset} has invalid size {size}"
                    )))
                }
                Some(size) => Some(size - header_size),
                None => None,
            };

            let reported_size = box_size.unwrap_or(u64::MAX);
            if callback.on_found_box(box_type, reported_size, box_offset) == ParseContinuation::Stop {
                return Ok(ParseStatus::Stopped {
                    box_type,
                    remaining: payload_size,
                });
            }

            if box_type == FourCC::MDAT {
                match payload_size {
                    Some(size) => {
                        if reader.skip(size)? != size {
                            return Err(PlayerError::Mp4Parsing("Truncated mdat".into()));
                        }
                    }
                    None => while reader.skip(u32::MAX as u64)? > 0 {},
                }
            } else {
                let payload = match payload_size {
                    Some(size) => {
                        let mut payload = vec![0u8; size as usize];
                        if read_exact(reader, &mut payload)? != payload.len() {
                            return Err(PlayerError::Mp4Parsing(format!(
                                "Truncated {box_type} box at offset {box_offset}"
                            )));
                        }
                        payload
                    }
                    None => read_to_end(reader)?,
                };
                self.on_box(box_type, box_offset, payload)?;
            }

            if callback.on_end_of_box(box_type, reported_size, box_offset) == ParseContinuation::Stop {
                return Ok(ParseStatus::Stopped {
                    box_type,
                    remaining: Some(0),
                });
            }
        }
    }

    fn on_box(&mut self, box_type: FourCC, box_offset: u64, payload: Vec<u8>) -> PlayerResult<()> {
        match box_type {
            FourCC::FTYP | FourCC::STYP => {
                let mut c = BoxCursor::new(&payload);
                let mut brands = vec![c.fourcc()?];
                c.skip(4)?;
                while c.remaining() >= 4 {
                    brands.push(c.fourcc()?);
                }
                self.brands.extend(brands);
            }
            FourCC::MOOV => {
                let mut init = parse_moov(&payload)?;
                init.brands = self.brands.clone();
                self.pssh.extend(init.pssh.iter().cloned());
                self.init = Some(init);
            }
            FourCC::MOOF => {
                self.fragment_count += 1;
                self.fragments.push(parse_moof(&payload, box_offset)?);
            }
            FourCC::SIDX => self.segment_index = Some(boxes::parse_sidx(&payload)?),
            FourCC::EMSG => self.events.push(boxes::parse_emsg(&payload)?),
            FourCC::PSSH => self.pssh.push(parse_pssh_box(&payload)?),
            _ => {}
        }
        Ok(())
    }

    /// Movie fragments found by the last call of [`Mp4Parser::parse_header`].
    pub fn fragments(&self) -> &[MovieFragment] {
        &self.fragments
    }

    /// Event messages found by the last call of [`Mp4Parser::parse_header`].
    pub fn events(&self) -> &[EventMessage] {
        &self.events
    }

    /// Protection system boxes seen so far.
    pub fn pssh(&self) -> &[Pssh] {
        &self.pssh
    }

    pub fn take_pssh(&mut self) -> Vec<Pssh> {
        std::mem::take(&mut self.pssh)
    }

    pub fn segment_index(&self) -> Option<&SegmentIndex> {
        self.segment_index.as_ref()
    }

    pub fn brands(&self) -> &[FourCC] {
        &self.brands
    }

    /// Number of `moof` boxes seen over all calls.
    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    pub fn take_init_segment(&mut self) -> Option<InitSegment> {
        self.init.take()
    }
}

fn read_exact(reader: &mut dyn BoxReader, buf: &mut [u8]) -> PlayerResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read_data(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_to_end(reader: &mut dyn BoxReader) -> PlayerResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = reader.read_data(&mut chunk)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Keeps the complete box since decrypters consume `pssh` boxes as a whole.
fn parse_pssh_box(payload: &[u8]) -> PlayerResult<Pssh> {
    let mut raw = Vec::with_capacity(payload.len() + 8);
    raw.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    raw.extend_from_slice(&FourCC::PSSH.0);
    raw.extend_from_slice(payload);
    boxes::parse_pssh(payload, Bytes::from(raw))
}


fn parse_moov(payload: &[u8]) -> PlayerResult<InitSegment> {
    let mut init = InitSegment::default();
    let mut c = BoxCursor::new(payload);
    while c.remaining() >= 8 {
        let (box_type, child) = c.child_box()?;
        match box_type {
            FourCC::TRAK => init.tracks.push(parse_trak(child)?),
            FourCC::MVEX => {
                let mut m = BoxCursor::new(child);
                while m.remaining() >= 8 {
                    let (inner_type, inner) = m.child_box()?;
                    if inner_type == FourCC::TREX {
                        init.trex.push(boxes::parse_trex(inner)?);
                    }
                }
            }
            FourCC::PSSH => init.pssh.push(parse_pssh_box(child)?),
            _ => {}
        }
    }
    Ok(init)
}

fn parse_trak(payload: &[u8]) -> PlayerResult<TrackInfo> {
    let mut track = TrackInfo::default();
    let mut c = BoxCursor::new(payload);
    let mut mdia = None;
    while c.remaining() >= 8 {
        let (box_type, child) = c.child_box()?;
        match box_type {
            FourCC::TKHD => boxes::parse_tkhd(child, &mut track)?,
            FourCC::MDIA => mdia = Some(child),
            _ => {}
        }
    }
    let Some(mdia) = mdia else {
        return Err(PlayerError::Mp4Parsing(format!(
            "Track {} has no mdia box",
            track.track_id
        )));
    };

    // The handler decides how the sample entry is laid out, so minf goes last.
    let mut minf = None;
    let mut c = BoxCursor::new(mdia);
    while c.remaining() >= 8 {
        let (box_type, child) = c.child_box()?;
        match box_type {
            FourCC::MDHD => boxes::parse_mdhd(child, &mut track)?,
            FourCC::HDLR => boxes::parse_hdlr(child, &mut track)?,
            FourCC::MINF => minf = Some(child),
            _ => {}
        }
    }
    if let Some(minf) = minf {
        if let Some(stsd) = find_path(minf, &[FourCC::STBL, FourCC::STSD])? {
            boxes::parse_stsd(stsd, &mut track)?;
        }
    }
    Ok(track)
}

fn find_path<'a>(payload: &'a [u8], path: &[FourCC]) -> PlayerResult<Option<&'a [u8]>> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(Some(payload));
    };
    let mut c = BoxCursor::new(payload);
    while c.remaining() >= 8 {
        let (box_type, child) = c.child_box()?;
        if box_type == *first {
            return find_path(child, rest);
        }
    }
    Ok(None)
}

fn parse_moof(payload: &[u8], offset: u64) -> PlayerResult<MovieFragment> {
    let mut moof = MovieFragment {
        offset,
        ..Default::default()
    };
    let mut c = BoxCursor::new(payload);
    while c.remaining() >= 8 {
        let (box_type, child) = c.child_box()?;
        match box_type {
            FourCC::MFHD => moof.sequence_number = boxes::parse_mfhd(child)?,
            FourCC::TRAF => moof.tracks.push(boxes::parse_traf(child)?),
            _ => {}
        }
    }
    if c.position() != payload.len() {
        tracing::debug!(offset, "Trailing bytes in moof ignored");
    }
    Ok(moof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::DefaultBoxCallback;

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

    fn init_segment() -> Vec<u8> {
        let mut tkhd = vec![0u8; 8];
        tkhd.extend_from_slice(&1u32.to_be_bytes());
        tkhd.extend_from_slice(&[0u8; 4 + 4 + 8 + 2 + 2 + 2 + 2 + 36]);
        tkhd.extend_from_slice(&(1280u32 << 16).to_be_bytes());
        tkhd.extend_from_slice(&(720u32 << 16).to_be_bytes());

        let mut mdhd = vec![0u8; 8];
        mdhd.extend_from_slice(&90000u32.to_be_bytes());
        mdhd.extend_from_slice(&[0, 0, 0, 0, 0x15, 0xc7, 0, 0]);

        let mut hdlr = vec![0u8; 4];
        hdlr.extend_from_slice(b"vide");
        hdlr.extend_from_slice(&[0u8; 13]);

        let mut trex = 1u32.to_be_bytes().to_vec();
        for v in [1u32, 3000, 0, 0x0001_0000] {
            trex.extend_from_slice(&v.to_be_bytes());
        }

        let mdia = [
            full_box(b"mdhd", 0, 0, &mdhd),
            full_box(b"hdlr", 0, 0, &hdlr),
        ]
        .concat();
        let trak = [full_box(b"tkhd", 0, 7, &tkhd), mp4_box(b"mdia", &mdia)].concat();
        let moov = [
            mp4_box(b"trak", &trak),
            mp4_box(b"mvex", &full_box(b"trex", 0, 0, &trex)),
        ]
        .concat();

        [
            mp4_box(b"ftyp", b"iso6\0\0\0\0iso6dash"),
            mp4_box(b"moov", &moov),
        ]
        .concat()
    }

    fn media_segment() -> Vec<u8> {
        let mut tfdt = Vec::new();
        tfdt.extend_from_slice(&180000u64.to_be_bytes());

        // Two samples with explicit size and flags, composition offsets of 3000.
        let mut trun = 2u32.to_be_bytes().to_vec();
        trun.extend_from_slice(&0i32.to_be_bytes());
        for (size, flags) in [(4u32, 0u32), (4, 0x0001_0000)] {
            trun.extend_from_slice(&size.to_be_bytes());
            trun.extend_from_slice(&flags.to_be_bytes());
            trun.extend_from_slice(&3000u32.to_be_bytes());
        }
        let traf = [
            full_box(b"tfhd", 0, 0x2_0000, &1u32.to_be_bytes()),
            full_box(b"tfdt", 1, 0, &tfdt),
            full_box(b"trun", 0, 0x001 | 0x200 | 0x400 | 0x800, &trun),
        ]
        .concat();
        let moof_payload = [
            full_box(b"mfhd", 0, 0, &1u32.to_be_bytes()),
            mp4_box(b"traf", &traf),
        ]
        .concat();

        // Patch the data offset to point right behind the mdat header.
        let moof_len = moof_payload.len() + 8;
        let data_offset = (moof_len + 8) as i32;
        let mut moof = mp4_box(b"moof", &moof_payload);
        let trun_pos = moof
            .windows(4)
            .position(|w| w == b"trun")
            .unwrap();
        let field = trun_pos + 4 + 4 + 4;
        moof[field..field + 4].copy_from_slice(&data_offset.to_be_bytes());

        [
            mp4_box(b"styp", b"msdh\0\0\0\0msdh"),
            moof,
            mp4_box(b"mdat", b"AAAABBBB"),
        ]
        .concat()
    }

    #[test]
    fn test_parse_init_segment() {
        let init = InitSegment::parse(init_segment()).unwrap();
        assert_eq!(init.tracks.len(), 1);
        let track = &init.tracks[0];
        assert_eq!(track.track_id, 1);
        assert_eq!(track.timescale, 90000);
        assert_eq!(track.handler, FourCC::HANDLER_VIDEO);
        assert_eq!(track.width, 1280);
        assert_eq!(track.language.as_deref(), Some("eng"));
        assert_eq!(init.track_extends(1).unwrap().default_sample_duration, 3000);
        assert_eq!(init.brands[0], FourCC(*b"iso6"));
    }

    #[test]
    fn test_parse_media_segment_stops_at_mdat() {
        let init = InitSegment::parse(init_segment()).unwrap();
        let data = media_segment();
        let mut reader = SliceReader::new(data.clone());
        let mut parser = Mp4Parser::new();

        let status = parser.parse_header(&mut reader, &mut DefaultBoxCallback).unwrap();
        assert_eq!(
            status,
            ParseStatus::Stopped {
                box_type: FourCC::MDAT,
                remaining: Some(8)
            }
        );
        assert_eq!(parser.fragments().len(), 1);

        let track = &init.tracks[0];
        let samples = parser.fragments()[0]
            .samples(track, init.track_extends(1))
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].dts, 180000);
        assert_eq!(samples[0].pts, 183000);
        assert_eq!(samples[1].dts, 183000);
        assert!(samples[0].is_sync);
        assert!(!samples[1].is_sync);
        assert_eq!(samples[0].file_offset, reader.current_offset());
        let start = samples[1].file_offset as usize;
        assert_eq!(&data[start..start + 4], b"BBBB");

        reader.skip(8).unwrap();
        let status = parser.parse_header(&mut reader, &mut DefaultBoxCallback).unwrap();
        assert_eq!(status, ParseStatus::EndOfStream);
        assert!(parser.fragments().is_empty());
        assert_eq!(parser.fragment_count(), 1);
    }

    #[test]
    fn test_missing_moov_is_error() {
        let data = mp4_box(b"ftyp", b"iso6\0\0\0\0");
        assert!(InitSegment::parse(data).is_err());
    }
}
