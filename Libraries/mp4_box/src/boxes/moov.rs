use crate::boxes::generic::{BoxHeader, BoxIter};
use crate::boxes::trak::TrakBox;
use crate::{read_u32_be, read_u64_be, read_version_and_flags, BoxError, Result};

/// Movie Header Box (`mvhd`).
#[derive(Debug, Default, Clone)]
pub struct MvhdBox {
    pub timescale: u32,
    pub duration: u64,
}

impl MvhdBox {
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
            MvhdBox {
                timescale,
                duration,
            },
            header.total_size,
        ))
    }
}

/// Track Extends Box (`trex`): per-track fragment defaults.
#[derive(Debug, Clone, Copy)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

impl TrexBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        Ok((
            TrexBox {
                track_id: read_u32_be(payload, 4)?,
                default_sample_description_index: read_u32_be(payload, 8)?,
                default_sample_duration: read_u32_be(payload, 12)?,
                default_sample_size: read_u32_be(payload, 16)?,
                default_sample_flags: read_u32_be(payload, 20)?,
            },
            header.total_size,
        ))
    }
}

/// Movie Box (`moov`): tracks plus the fragment defaults from `mvex`.
#[derive(Debug, Clone)]
pub struct MoovBox {
    pub mvhd: MvhdBox,
    pub tracks: Vec<TrakBox>,
    pub track_extends: Vec<TrexBox>,
}

impl MoovBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        if &header.box_type != b"moov" {
            return Err(BoxError::Malformed("moov", "unexpected type".into()));
        }
        let payload = header.payload(data);
        let mut mvhd = None;
        let mut tracks = Vec::new();
        let mut track_extends = Vec::new();
        for entry in BoxIter::new(payload) {
            let (child, bytes) = entry?;
            match &child.box_type {
                b"mvhd" => mvhd = Some(MvhdBox::read_box(bytes)?.0),
                b"trak" => tracks.push(TrakBox::read_box(bytes)?.0),
                b"mvex" => {
                    for sub in BoxIter::new(child.payload(bytes)) {
                        let (mvex_child, mvex_bytes) = sub?;
                        if &mvex_child.box_type == b"trex" {
                            track_extends.push(TrexBox::read_box(mvex_bytes)?.0);
                        }
                    }
                }
                _ => {}
            }
        }
        if tracks.is_empty() {
            return Err(BoxError::Malformed("moov", "no tracks".into()));
        }
        Ok((
            MoovBox {
                mvhd: mvhd.ok_or(BoxError::Malformed("moov", "missing mvhd".into()))?,
                tracks,
                track_extends,
            },
            header.total_size,
        ))
    }

    pub fn trex_for(&self, track_id: u32) -> Option<&TrexBox> {
        self.track_extends.iter().find(|t| t.track_id == track_id)
    }
}
