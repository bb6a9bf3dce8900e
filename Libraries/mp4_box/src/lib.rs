//! # ISOBMFF box parsing for OMAF media
//!
//! Read-only parsing of the ISO Base Media File Format boxes an OMAF
//! (omnidirectional video) client needs:
//!
//! - `ftyp`/`styp` brand checks
//! - the `moov` hierarchy (`trak`, `mdia`, `minf`, `stbl` descendants,
//!   `mvex`, `tref`) for initialization segments and whole files
//! - movie fragments (`moof` with `tfhd`/`tfdt`/`trun`) for media segments
//! - segment indexes (`sidx`) for on-demand byte-range addressing
//! - the OMAF projection metadata carried inside restricted video sample
//!   entries (`prfl`, `rwpk`, `stvi`, `rotn`, `covi`, `srqr`, `2dqr`)
//!
//! The `boxes` module holds one file per box family with a `read_box`
//! constructor each; the `reader` module walks whole buffers and assembles
//! the track/sample views a streaming client consumes. This library has no
//! notion of DASH, downloads or playback state; callers feed it complete
//! byte blobs.

pub mod boxes;
pub mod reader;

use thiserror::Error;

/// Errors produced while decoding box structures.
#[derive(Debug, Error)]
pub enum BoxError {
    #[error("buffer too small for {0} box")]
    Truncated(&'static str),
    #[error("malformed {0} box: {1}")]
    Malformed(&'static str, String),
    #[error("not an ISOBMFF stream")]
    NotMp4,
    #[error("unsupported structure: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, BoxError>;

/// Four-character box/brand/codec code.
pub type FourCc = [u8; 4];

pub fn format_fourcc(fourcc: &FourCc) -> String {
    std::str::from_utf8(fourcc).unwrap_or("????").to_string()
}

pub fn format_capped_bytes(data: &[u8]) -> String {
    let capped = &data[..data.len().min(8)];
    if data.len() > 8 {
        format!("{:?} ...", capped)
    } else {
        format!("{:?}", capped)
    }
}

pub(crate) fn read_u16_be(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes(b.try_into().unwrap()))
        .ok_or(BoxError::Truncated("u16"))
}

pub(crate) fn read_u32_be(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
        .ok_or(BoxError::Truncated("u32"))
}

pub(crate) fn read_u64_be(data: &[u8], offset: usize) -> Result<u64> {
    data.get(offset..offset + 8)
        .map(|b| u64::from_be_bytes(b.try_into().unwrap()))
        .ok_or(BoxError::Truncated("u64"))
}

pub(crate) fn read_i32_be(data: &[u8], offset: usize) -> Result<i32> {
    read_u32_be(data, offset).map(|v| v as i32)
}

/// Reads the version byte and 24-bit flags of a full box payload.
pub(crate) fn read_version_and_flags(data: &[u8]) -> Result<(u8, u32)> {
    if data.len() < 4 {
        return Err(BoxError::Truncated("full box header"));
    }
    let version = data[0];
    let flags = ((data[1] as u32) << 16) | ((data[2] as u32) << 8) | data[3] as u32;
    Ok((version, flags))
}

/// Fixed-point 16.16 signed value to degrees.
pub fn q16_to_f64(raw: i32) -> f64 {
    raw as f64 / 65536.0
}
