//! Minimal ISO/IEC 14496-12 reader for fragmented MP4.
//!
//! The reader is push style: an [`Mp4Parser`] pulls bytes from a [`BoxReader`] and reports box
//! boundaries to a [`BoxCallback`], which may stop parsing. Parsing of a media segment stops at
//! every `mdat` so the caller can read the sample payloads straight from the source.

mod boxes;
mod parser;

use std::fmt;

use bytes::Bytes;

pub use boxes::{
    EventMessage, MovieFragment, Pssh, Sample, SampleEncryptionEntry, SegmentIndex,
    SegmentIndexReference, SubSample, TrackEncryption, TrackExtends, TrackFragment, TrackInfo,
    TrackRun, TrunSample,
};
pub use parser::{InitSegment, Mp4Parser, ParseStatus};

use crate::error::PlayerResult;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const FTYP: FourCC = FourCC(*b"ftyp");
    pub const STYP: FourCC = FourCC(*b"styp");
    pub const MOOV: FourCC = FourCC(*b"moov");
    pub const MVHD: FourCC = FourCC(*b"mvhd");
    pub const TRAK: FourCC = FourCC(*b"trak");
    pub const TKHD: FourCC = FourCC(*b"tkhd");
    pub const MDIA: FourCC = FourCC(*b"mdia");
    pub const MDHD: FourCC = FourCC(*b"mdhd");
    pub const HDLR: FourCC = FourCC(*b"hdlr");
    pub const MINF: FourCC = FourCC(*b"minf");
    pub const STBL: FourCC = FourCC(*b"stbl");
    pub const STSD: FourCC = FourCC(*b"stsd");
    pub const MVEX: FourCC = FourCC(*b"mvex");
    pub const TREX: FourCC = FourCC(*b"trex");
    pub const MOOF: FourCC = FourCC(*b"moof");
    pub const MFHD: FourCC = FourCC(*b"mfhd");
    pub const TRAF: FourCC = FourCC(*b"traf");
    pub const TFHD: FourCC = FourCC(*b"tfhd");
    pub const TFDT: FourCC = FourCC(*b"tfdt");
    pub const TRUN: FourCC = FourCC(*b"trun");
    pub const SENC: FourCC = FourCC(*b"senc");
    pub const SIDX: FourCC = FourCC(*b"sidx");
    pub const EMSG: FourCC = FourCC(*b"emsg");
    pub const PSSH: FourCC = FourCC(*b"pssh");
    pub const MDAT: FourCC = FourCC(*b"mdat");
    pub const SINF: FourCC = FourCC(*b"sinf");
    pub const ESDS: FourCC = FourCC(*b"esds");
    pub const FRMA: FourCC = FourCC(*b"frma");
    pub const SCHM: FourCC = FourCC(*b"schm");
    pub const SCHI: FourCC = FourCC(*b"schi");
    pub const TENC: FourCC = FourCC(*b"tenc");
    pub const UUID: FourCC = FourCC(*b"uuid");

    pub const HANDLER_VIDEO: FourCC = FourCC(*b"vide");
    pub const HANDLER_AUDIO: FourCC = FourCC(*b"soun");
    pub const HANDLER_SUBTITLE: FourCC = FourCC(*b"subt");
    pub const HANDLER_TEXT: FourCC = FourCC(*b"text");

    pub const SCHEME_CENC: FourCC = FourCC(*b"cenc");
    pub const SCHEME_CBC1: FourCC = FourCC(*b"cbc1");
    pub const SCHEME_CBCS: FourCC = FourCC(*b"cbcs");

    pub const BRAND_LMSG: FourCC = FourCC(*b"lmsg");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

/// Source of box data.
pub trait BoxReader {
    /// Fills `buf` completely, blocking if needed. Returns less than `buf.len()` only when the
    /// data ended.
    fn read_data(&mut self, buf: &mut [u8]) -> PlayerResult<usize>;

    /// Skips `count` bytes. Returns how many were skipped.
    fn skip(&mut self, count: u64) -> PlayerResult<u64>;

    fn has_reached_eof(&mut self) -> bool;

    /// Offset of the next byte to be read, relative to the start of the source.
    fn current_offset(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseContinuation {
    Continue,
    Stop,
}

/// Observer of box boundaries.
pub trait BoxCallback {
    fn on_found_box(&mut self, box_type: FourCC, box_size: u64, file_offset: u64) -> ParseContinuation;

    fn on_end_of_box(&mut self, _box_type: FourCC, _box_size: u64, _file_offset: u64) -> ParseContinuation {
        ParseContinuation::Continue
    }
}

/// Callback that walks every box and stops at `mdat`.
pub struct DefaultBoxCallback;

impl BoxCallback for DefaultBoxCallback {
    fn on_found_box(&mut self, box_type: FourCC, _box_size: u64, _file_offset: u64) -> ParseContinuation {
        if box_type == FourCC::MDAT {
            ParseContinuation::Stop
        } else {
            ParseContinuation::Continue
        }
    }
}

/// [`BoxReader`] over an in-memory buffer.
pub struct SliceReader {
    data: Bytes,
    position: usize,
}

impl SliceReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }
}

impl BoxReader for SliceReader {
    fn read_data(&mut self, buf: &mut [u8]) -> PlayerResult<usize> {
        let available = self.data.len() - self.position;
        let count = buf.len().min(available);
        buf[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }

    fn skip(&mut self, count: u64) -> PlayerResult<u64> {
        let available = (self.data.len() - self.position) as u64;
        let count = count.min(available);
        self.position += count as usize;
        Ok(count)
    }

    fn has_reached_eof(&mut self) -> bool {
        self.position >= self.data.len()
    }

    fn current_offset(&self) -> u64 {
        self.position as u64
    }
}
