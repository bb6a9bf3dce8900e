use crate::boxes::generic::{BoxHeader, BoxIter};
use crate::{read_u32_be, read_u64_be, read_version_and_flags, BoxError, Result};

/// Movie Fragment Header Box (`mfhd`).
#[derive(Debug, Default, Clone, Copy)]
pub struct MfhdBox {
    pub sequence_number: u32,
}

impl MfhdBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        Ok((
            MfhdBox {
                sequence_number: read_u32_be(payload, 4)?,
            },
            header.total_size,
        ))
    }
}

/// Track Fragment Header Box (`tfhd`). Optional fields are flag-driven.
#[derive(Debug, Default, Clone, Copy)]
pub struct TfhdBox {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub default_base_is_moof: bool,
}

const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESC_INDEX: u32 = 0x000002;
const TFHD_DEFAULT_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

impl TfhdBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        let (_, flags) = read_version_and_flags(payload)?;
        let mut tfhd = TfhdBox {
            track_id: read_u32_be(payload, 4)?,
            default_base_is_moof: flags & TFHD_DEFAULT_BASE_IS_MOOF != 0,
            ..Default::default()
        };
        let mut offset = 8;
        if flags & TFHD_BASE_DATA_OFFSET != 0 {
            tfhd.base_data_offset = Some(read_u64_be(payload, offset)?);
            offset += 8;
        }
        if flags & TFHD_SAMPLE_DESC_INDEX != 0 {
            tfhd.sample_description_index = Some(read_u32_be(payload, offset)?);
            offset += 4;
        }
        if flags & TFHD_DEFAULT_DURATION != 0 {
            tfhd.default_sample_duration = Some(read_u32_be(payload, offset)?);
            offset += 4;
        }
        if flags & TFHD_DEFAULT_SIZE != 0 {
            tfhd.default_sample_size = Some(read_u32_be(payload, offset)?);
            offset += 4;
        }
        if flags & TFHD_DEFAULT_FLAGS != 0 {
            tfhd.default_sample_flags = Some(read_u32_be(payload, offset)?);
        }
        Ok((tfhd, header.total_size))
    }
}

/// Track Fragment Decode Time Box (`tfdt`).
#[derive(Debug, Default, Clone, Copy)]
pub struct TfdtBox {
    pub base_decode_time: u64,
}

impl TfdtBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        let (version, _) = read_version_and_flags(payload)?;
        let base_decode_time = if version == 1 {
            read_u64_be(payload, 4)?
        } else {
            read_u32_be(payload, 4)? as u64
        };
        Ok((TfdtBox { base_decode_time }, header.total_size))
    }
}

/// One sample row of a `trun`; absent columns stay `None` and are resolved
/// from tfhd/trex defaults by the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub composition_offset: Option<i32>,
}

/// Track Fragment Run Box (`trun`).
#[derive(Debug, Default, Clone)]
pub struct TrunBox {
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrunSample>,
}

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_CTS_OFFSET: u32 = 0x000800;

impl TrunBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        let (_, flags) = read_version_and_flags(payload)?;
        let sample_count = read_u32_be(payload, 4)? as usize;
        let mut trun = TrunBox::default();
        let mut offset = 8;
        if flags & TRUN_DATA_OFFSET != 0 {
            trun.data_offset = Some(read_u32_be(payload, offset)? as i32);
            offset += 4;
        }
        if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
            trun.first_sample_flags = Some(read_u32_be(payload, offset)?);
            offset += 4;
        }
        trun.samples.reserve(sample_count);
        for _ in 0..sample_count {
            let mut sample = TrunSample::default();
            if flags & TRUN_SAMPLE_DURATION != 0 {
                sample.duration = Some(read_u32_be(payload, offset)?);
                offset += 4;
            }
            if flags & TRUN_SAMPLE_SIZE != 0 {
                sample.size = Some(read_u32_be(payload, offset)?);
                offset += 4;
            }
            if flags & TRUN_SAMPLE_FLAGS != 0 {
                sample.flags = Some(read_u32_be(payload, offset)?);
                offset += 4;
            }
            if flags & TRUN_SAMPLE_CTS_OFFSET != 0 {
                sample.composition_offset = Some(read_u32_be(payload, offset)? as i32);
                offset += 4;
            }
            trun.samples.push(sample);
        }
        Ok((trun, header.total_size))
    }
}

/// Track Fragment Box (`traf`).
#[derive(Debug, Clone)]
pub struct TrafBox {
    pub tfhd: TfhdBox,
    pub tfdt: Option<TfdtBox>,
    pub truns: Vec<TrunBox>,
}

impl TrafBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        let mut tfhd = None;
        let mut tfdt = None;
        let mut truns = Vec::new();
        for entry in BoxIter::new(payload) {
            let (child, bytes) = entry?;
            match &child.box_type {
                b"tfhd" => tfhd = Some(TfhdBox::read_box(bytes)?.0),
                b"tfdt" => tfdt = Some(TfdtBox::read_box(bytes)?.0),
                b"trun" => truns.push(TrunBox::read_box(bytes)?.0),
                _ => {}
            }
        }
        Ok((
            TrafBox {
                tfhd: tfhd.ok_or(BoxError::Malformed("traf", "missing tfhd".into()))?,
                tfdt,
                truns,
            },
            header.total_size,
        ))
    }
}

/// Movie Fragment Box (`moof`).
#[derive(Debug, Clone)]
pub struct MoofBox {
    pub mfhd: MfhdBox,
    pub trafs: Vec<TrafBox>,
}

impl MoofBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        if &header.box_type != b"moof" {
            return Err(BoxError::Malformed("moof", "unexpected type".into()));
        }
        let payload = header.payload(data);
        let mut mfhd = None;
        let mut trafs = Vec::new();
        for entry in BoxIter::new(payload) {
            let (child, bytes) = entry?;
            match &child.box_type {
                b"mfhd" => mfhd = Some(MfhdBox::read_box(bytes)?.0),
                b"traf" => trafs.push(TrafBox::read_box(bytes)?.0),
                _ => {}
            }
        }
        if trafs.is_empty() {
            return Err(BoxError::Malformed("moof", "no track fragments".into()));
        }
        Ok((
            MoofBox {
                mfhd: mfhd.ok_or(BoxError::Malformed("moof", "missing mfhd".into()))?,
                trafs,
            },
            header.total_size,
        ))
    }
}

/// Sample flag helper: ISO 14496-12 `sample_is_non_sync_sample` is bit 16.
pub fn sample_flags_is_sync(flags: u32) -> bool {
    flags & 0x0001_0000 == 0
}
