use crate::boxes::generic::{BoxHeader, BoxIter};
use crate::boxes::stsd::StsdBox;
use crate::{read_u32_be, read_u64_be, read_version_and_flags, BoxError, Result};

/// Decoding Time to Sample Box (`stts`): run-length encoded per-sample
/// durations.
#[derive(Debug, Default, Clone)]
pub struct SttsBox {
    pub entries: Vec<SttsEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

impl SttsBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let entry_count = read_u32_be(payload, 4)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let base = 8 + i * 8;
            entries.push(SttsEntry {
                sample_count: read_u32_be(payload, base)?,
                sample_delta: read_u32_be(payload, base + 4)?,
            });
        }
        Ok((SttsBox { entries }, header.total_size))
    }
}

/// Sample To Chunk Box (`stsc`).
#[derive(Debug, Default, Clone)]
pub struct StscBox {
    pub entries: Vec<StscEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

impl StscBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let entry_count = read_u32_be(payload, 4)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let base = 8 + i * 12;
            entries.push(StscEntry {
                first_chunk: read_u32_be(payload, base)?,
                samples_per_chunk: read_u32_be(payload, base + 4)?,
                sample_description_index: read_u32_be(payload, base + 8)?,
            });
        }
        Ok((StscBox { entries }, header.total_size))
    }
}

/// Sample Size Box (`stsz`). A non-zero `sample_size` means all samples
/// share that size and the table is empty.
#[derive(Debug, Default, Clone)]
pub struct StszBox {
    pub sample_size: u32,
    pub sample_count: u32,
    pub entry_sizes: Vec<u32>,
}

impl StszBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let sample_size = read_u32_be(payload, 4)?;
        let sample_count = read_u32_be(payload, 8)?;
        let mut entry_sizes = Vec::new();
        if sample_size == 0 {
            entry_sizes.reserve(sample_count as usize);
            for i in 0..sample_count as usize {
                entry_sizes.push(read_u32_be(payload, 12 + i * 4)?);
            }
        }
        Ok((
            StszBox {
                sample_size,
                sample_count,
                entry_sizes,
            },
            header.total_size,
        ))
    }

    pub fn size_of(&self, sample_index: usize) -> Option<u32> {
        if self.sample_size != 0 {
            (sample_index < self.sample_count as usize).then_some(self.sample_size)
        } else {
            self.entry_sizes.get(sample_index).copied()
        }
    }
}

/// Chunk Offset Box: `stco` (32-bit) or `co64` (64-bit), normalized to u64.
#[derive(Debug, Default, Clone)]
pub struct StcoBox {
    pub offsets: Vec<u64>,
}

impl StcoBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let wide = &header.box_type == b"co64";
        if !wide && &header.box_type != b"stco" {
            return Err(BoxError::Malformed("stco", "unexpected type".into()));
        }
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let entry_count = read_u32_be(payload, 4)? as usize;
        let mut offsets = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            if wide {
                offsets.push(read_u64_be(payload, 8 + i * 8)?);
            } else {
                offsets.push(read_u32_be(payload, 8 + i * 4)? as u64);
            }
        }
        Ok((StcoBox { offsets }, header.total_size))
    }
}

/// Sync Sample Box (`stss`): 1-based sample numbers of sync frames. Absent
/// box means every sample is a sync sample.
#[derive(Debug, Default, Clone)]
pub struct StssBox {
    pub sample_numbers: Vec<u32>,
}

impl StssBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let entry_count = read_u32_be(payload, 4)? as usize;
        let mut sample_numbers = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            sample_numbers.push(read_u32_be(payload, 8 + i * 4)?);
        }
        Ok((StssBox { sample_numbers }, header.total_size))
    }
}

/// Sample Table Box (`stbl`).
#[derive(Debug, Default, Clone)]
pub struct StblBox {
    pub stsd: StsdBox,
    pub stts: SttsBox,
    pub stsc: StscBox,
    pub stsz: StszBox,
    pub stco: StcoBox,
    pub stss: Option<StssBox>,
}

impl StblBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        let mut stbl = StblBox::default();
        for entry in BoxIter::new(payload) {
            let (child, bytes) = entry?;
            match &child.box_type {
                b"stsd" => stbl.stsd = StsdBox::read_box(bytes)?.0,
                b"stts" => stbl.stts = SttsBox::read_box(bytes)?.0,
                b"stsc" => stbl.stsc = StscBox::read_box(bytes)?.0,
                b"stsz" => stbl.stsz = StszBox::read_box(bytes)?.0,
                b"stco" | b"co64" => stbl.stco = StcoBox::read_box(bytes)?.0,
                b"stss" => stbl.stss = Some(StssBox::read_box(bytes)?.0),
                _ => {}
            }
        }
        Ok((stbl, header.total_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((body.len() as u32) + 12).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn stts_runs() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_be_bytes());
        for (count, delta) in [(10u32, 512u32), (1, 256)] {
            body.extend_from_slice(&count.to_be_bytes());
            body.extend_from_slice(&delta.to_be_bytes());
        }
        let data = full_box(b"stts", &body);
        let (stts, _) = SttsBox::read_box(&data).unwrap();
        assert_eq!(stts.entries.len(), 2);
        assert_eq!(stts.entries[0].sample_delta, 512);
    }

    #[test]
    fn stsz_constant_size() {
        let mut body = Vec::new();
        body.extend_from_slice(&100u32.to_be_bytes());
        body.extend_from_slice(&7u32.to_be_bytes());
        let data = full_box(b"stsz", &body);
        let (stsz, _) = StszBox::read_box(&data).unwrap();
        assert_eq!(stsz.size_of(6), Some(100));
        assert_eq!(stsz.size_of(7), None);
    }
}
