use crate::boxes::generic::{BoxHeader, BoxIter};
use crate::boxes::stbl::StblBox;
use crate::{
    read_u16_be, read_u32_be, read_u64_be, read_version_and_flags, BoxError, FourCc, Result,
};

/// Track Header Box (`tkhd`).
#[derive(Debug, Default, Clone)]
pub struct TkhdBox {
    pub track_id: u32,
    pub duration: u64,
    pub width: u16,
    pub height: u16,
    pub enabled: bool,
}

impl TkhdBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        let (version, flags) = read_version_and_flags(payload)?;
        let (track_id, duration, tail) = if version == 1 {
            (
                read_u32_be(payload, 4 + 16)?,
                read_u64_be(payload, 4 + 24)?,
                4 + 32,
            )
        } else {
            (
                read_u32_be(payload, 4 + 8)?,
                read_u32_be(payload, 4 + 16)? as u64,
                4 + 20,
            )
        };
        // reserved(8) + layer/group/volume/reserved(8) + matrix(36)
        let dims = tail + 52;
        // width/height are 16.16 fixed point
        let width = read_u16_be(payload, dims)?;
        let height = read_u16_be(payload, dims + 4)?;
        Ok((
            TkhdBox {
                track_id,
                duration,
                width,
                height,
                enabled: flags & 0x1 != 0,
            },
            header.total_size,
        ))
    }
}

/// Media Header Box (`mdhd`): the track timescale everything is counted in.
#[derive(Debug, Default, Clone)]
pub struct MdhdBox {
    pub timescale: u32,
    pub duration: u64,
}

impl MdhdBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        let (version, _) = read_version_and_flags(payload)?;
        let (timescale, duration) = if version == 1 {
            (read_u32_be(payload, 4 + 16)?, read_u64_be(payload, 4 + 20)?)
        } else {
            (
                read_u32_be(payload, 4 + 8)?,
                read_u32_be(payload, 4 + 12)? as u64,
            )
        };
        Ok((
            MdhdBox {
                timescale,
                duration,
            },
            header.total_size,
        ))
    }
}

/// Handler Reference Box (`hdlr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Video,
    Audio,
    TimedMetadata,
    Other(FourCc),
}

impl HandlerType {
    pub fn from_fourcc(fourcc: FourCc) -> Self {
        match &fourcc {
            b"vide" => HandlerType::Video,
            b"soun" => HandlerType::Audio,
            b"meta" | b"text" | b"urim" => HandlerType::TimedMetadata,
            _ => HandlerType::Other(fourcc),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HdlrBox {
    pub handler: HandlerType,
}

impl HdlrBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        if payload.len() < 12 {
            return Err(BoxError::Truncated("hdlr"));
        }
        let fourcc: FourCc = payload[8..12].try_into().unwrap();
        Ok((
            HdlrBox {
                handler: HandlerType::from_fourcc(fourcc),
            },
            header.total_size,
        ))
    }
}

/// One entry of a Track Reference Box (`tref`), e.g. `cdsc` for timed
/// metadata describing a media track or `scal` for extractor dependencies.
#[derive(Debug, Clone)]
pub struct TrackReference {
    pub reference_type: FourCc,
    pub track_ids: Vec<u32>,
}

fn read_tref(data: &[u8]) -> Result<Vec<TrackReference>> {
    let header = BoxHeader::read(data)?;
    let payload = header.payload(data);
    let mut references = Vec::new();
    for entry in BoxIter::new(payload) {
        let (child, bytes) = entry?;
        let body = child.payload(bytes);
        let mut track_ids = Vec::new();
        let mut offset = 0;
        while offset + 4 <= body.len() {
            track_ids.push(read_u32_be(body, offset)?);
            offset += 4;
        }
        references.push(TrackReference {
            reference_type: child.box_type,
            track_ids,
        });
    }
    Ok(references)
}

/// Track Box (`trak`) with the descendants the player reads.
#[derive(Debug, Clone)]
pub struct TrakBox {
    pub tkhd: TkhdBox,
    pub mdhd: MdhdBox,
    pub handler: HandlerType,
    pub stbl: StblBox,
    pub references: Vec<TrackReference>,
}

impl TrakBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        let mut tkhd = None;
        let mut mdhd = None;
        let mut handler = None;
        let mut stbl = None;
        let mut references = Vec::new();
        for entry in BoxIter::new(payload) {
            let (child, bytes) = entry?;
            match &child.box_type {
                b"tkhd" => tkhd = Some(TkhdBox::read_box(bytes)?.0),
                b"tref" => references = read_tref(bytes)?,
                b"mdia" => {
                    for sub in BoxIter::new(child.payload(bytes)) {
                        let (mdia_child, mdia_bytes) = sub?;
                        match &mdia_child.box_type {
                            b"mdhd" => mdhd = Some(MdhdBox::read_box(mdia_bytes)?.0),
                            b"hdlr" => handler = Some(HdlrBox::read_box(mdia_bytes)?.0.handler),
                            b"minf" => {
                                for minf in BoxIter::new(mdia_child.payload(mdia_bytes)) {
                                    let (minf_child, minf_bytes) = minf?;
                                    if &minf_child.box_type == b"stbl" {
                                        stbl = Some(StblBox::read_box(minf_bytes)?.0);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        Ok((
            TrakBox {
                tkhd: tkhd.ok_or(BoxError::Malformed("trak", "missing tkhd".into()))?,
                mdhd: mdhd.ok_or(BoxError::Malformed("trak", "missing mdhd".into()))?,
                handler: handler.ok_or(BoxError::Malformed("trak", "missing hdlr".into()))?,
                stbl: stbl.ok_or(BoxError::Malformed("trak", "missing stbl".into()))?,
                references,
            },
            header.total_size,
        ))
    }
}
