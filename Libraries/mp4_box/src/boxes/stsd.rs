use crate::boxes::generic::{BoxHeader, BoxIter};
use crate::boxes::omaf::OmafProperties;
use crate::{
    format_capped_bytes, format_fourcc, read_u16_be, read_u32_be, read_version_and_flags, BoxError,
    FourCc, Result,
};

/// One entry of the Sample Description Box.
///
/// Visual entries carry picture dimensions, the decoder configuration record
/// (`avcC`/`hvcC` payload, raw) and any OMAF projection properties found in
/// the restricted-scheme containers. Audio entries carry channel/rate info
/// and the `esds` payload. Anything else (timed metadata `urim`/`mett`,
/// unknown formats) is kept as an opaque entry so tracks still enumerate.
#[derive(Clone)]
pub enum SampleEntry {
    Visual(VisualSampleEntry),
    Audio(AudioSampleEntry),
    Other(OtherSampleEntry),
}

impl SampleEntry {
    pub fn format(&self) -> FourCc {
        match self {
            SampleEntry::Visual(v) => v.format,
            SampleEntry::Audio(a) => a.format,
            SampleEntry::Other(o) => o.format,
        }
    }

    pub fn codec_config(&self) -> Option<&[u8]> {
        match self {
            SampleEntry::Visual(v) => v.codec_config.as_deref(),
            SampleEntry::Audio(a) => a.codec_config.as_deref(),
            SampleEntry::Other(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct VisualSampleEntry {
    pub format: FourCc,
    /// For restricted video (`resv`) the original format from `frma`.
    pub original_format: Option<FourCc>,
    pub width: u16,
    pub height: u16,
    pub codec_config: Option<Vec<u8>>,
    pub omaf: OmafProperties,
}

#[derive(Clone)]
pub struct AudioSampleEntry {
    pub format: FourCc,
    pub channel_count: u16,
    pub sample_rate: u32,
    pub codec_config: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct OtherSampleEntry {
    pub format: FourCc,
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for SampleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleEntry::Visual(v) => f
                .debug_struct("VisualSampleEntry")
                .field("format", &format_fourcc(&v.format))
                .field("original_format", &v.original_format.map(|ff| format_fourcc(&ff)))
                .field("width", &v.width)
                .field("height", &v.height)
                .field(
                    "codec_config",
                    &v.codec_config.as_ref().map(|c| format_capped_bytes(c)),
                )
                .field("omaf", &v.omaf.any())
                .finish(),
            SampleEntry::Audio(a) => f
                .debug_struct("AudioSampleEntry")
                .field("format", &format_fourcc(&a.format))
                .field("channel_count", &a.channel_count)
                .field("sample_rate", &a.sample_rate)
                .finish(),
            SampleEntry::Other(o) => f
                .debug_struct("OtherSampleEntry")
                .field("format", &format_fourcc(&o.format))
                .field("payload", &format_capped_bytes(&o.payload))
                .finish(),
        }
    }
}

const VISUAL_FORMATS: &[&FourCc] = &[
    b"avc1", b"avc3", b"hev1", b"hvc1", b"hvc2", b"resv", b"encv",
];
const AUDIO_FORMATS: &[&FourCc] = &[b"mp4a", b"enca"];
const CONFIG_BOXES: &[&FourCc] = &[b"avcC", b"hvcC", b"esds"];

/// Sample Description Box (`stsd`).
#[derive(Debug, Default, Clone)]
pub struct StsdBox {
    pub entries: Vec<SampleEntry>,
}

impl StsdBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let entry_count = read_u32_be(payload, 4)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        let mut offset = 8;
        for _ in 0..entry_count {
            if offset >= payload.len() {
                return Err(BoxError::Truncated("stsd"));
            }
            let entry_header = BoxHeader::read(&payload[offset..])?;
            let bytes = &payload[offset..offset + entry_header.total_size];
            entries.push(Self::read_entry(&entry_header, bytes)?);
            offset += entry_header.total_size;
        }
        Ok((StsdBox { entries }, header.total_size))
    }

    fn read_entry(header: &BoxHeader, bytes: &[u8]) -> Result<SampleEntry> {
        let format = header.box_type;
        let body = header.payload(bytes);
        if VISUAL_FORMATS.iter().any(|f| **f == format) {
            // SampleEntry base (8) + VisualSampleEntry fixed fields (70)
            if body.len() < 78 {
                return Err(BoxError::Truncated("visual sample entry"));
            }
            let width = read_u16_be(body, 24)?;
            let height = read_u16_be(body, 26)?;
            let children = &body[78..];
            let mut codec_config = None;
            let mut original_format = None;
            let mut omaf = OmafProperties::default();
            for entry in BoxIter::new(children) {
                let (child, child_bytes) = entry?;
                if CONFIG_BOXES.iter().any(|f| **f == child.box_type) {
                    codec_config = Some(child.payload(child_bytes).to_vec());
                } else if &child.box_type == b"rinf" || &child.box_type == b"sinf" {
                    original_format = find_original_format(child.payload(child_bytes))?;
                    // restricted-scheme video hides the real decoder config
                    // and the OMAF boxes below rinf
                    omaf.collect(child.payload(child_bytes))?;
                    if codec_config.is_none() {
                        codec_config = find_config_recursive(child.payload(child_bytes))?;
                    }
                }
            }
            // OMAF boxes may also sit directly on the entry
            omaf.collect(children)?;
            Ok(SampleEntry::Visual(VisualSampleEntry {
                format,
                original_format,
                width,
                height,
                codec_config,
                omaf,
            }))
        } else if AUDIO_FORMATS.iter().any(|f| **f == format) {
            // SampleEntry base (8) + AudioSampleEntry fixed fields (20)
            if body.len() < 28 {
                return Err(BoxError::Truncated("audio sample entry"));
            }
            let channel_count = read_u16_be(body, 16)?;
            // 16.16 fixed; integer part only
            let sample_rate = read_u32_be(body, 24)? >> 16;
            let mut codec_config = None;
            for entry in BoxIter::new(&body[28..]) {
                let (child, child_bytes) = entry?;
                if &child.box_type == b"esds" {
                    codec_config = Some(child.payload(child_bytes).to_vec());
                }
            }
            Ok(SampleEntry::Audio(AudioSampleEntry {
                format,
                channel_count,
                sample_rate,
                codec_config,
            }))
        } else {
            Ok(SampleEntry::Other(OtherSampleEntry {
                format,
                payload: body.to_vec(),
            }))
        }
    }
}

fn find_original_format(data: &[u8]) -> Result<Option<FourCc>> {
    for entry in BoxIter::new(data) {
        let (child, bytes) = entry?;
        if &child.box_type == b"frma" {
            let payload = child.payload(bytes);
            if payload.len() < 4 {
                return Err(BoxError::Truncated("frma"));
            }
            return Ok(Some(payload[0..4].try_into().unwrap()));
        }
    }
    Ok(None)
}

fn find_config_recursive(data: &[u8]) -> Result<Option<Vec<u8>>> {
    for entry in BoxIter::new(data) {
        let (child, bytes) = entry?;
        if CONFIG_BOXES.iter().any(|f| **f == child.box_type) {
            return Ok(Some(child.payload(bytes).to_vec()));
        }
        if matches!(&child.box_type, b"schi" | b"rinf" | b"sinf" | b"povd") {
            if let Some(found) = find_config_recursive(child.payload(bytes))? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((body.len() as u32) + 8).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend_from_slice(body);
        out
    }

    fn visual_entry(format: &[u8; 4], width: u16, height: u16, children: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 78];
        body[24..26].copy_from_slice(&width.to_be_bytes());
        body[26..28].copy_from_slice(&height.to_be_bytes());
        body.extend_from_slice(children);
        plain_box(format, &body)
    }

    fn stsd(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut body = vec![0, 0, 0, 0];
        body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for e in entries {
            body.extend_from_slice(e);
        }
        plain_box(b"stsd", &body)
    }

    #[test]
    fn hvc1_entry_with_config() {
        let hvcc = plain_box(b"hvcC", &[1, 2, 3]);
        let data = stsd(&[visual_entry(b"hvc1", 3840, 1920, &hvcc)]);
        let (parsed, _) = StsdBox::read_box(&data).unwrap();
        match &parsed.entries[0] {
            SampleEntry::Visual(v) => {
                assert_eq!(v.width, 3840);
                assert_eq!(v.codec_config.as_deref(), Some(&[1u8, 2, 3][..]));
            }
            other => panic!("wrong entry kind: {:?}", other),
        }
    }

    #[test]
    fn resv_entry_resolves_original_format() {
        let frma = plain_box(b"frma", b"hvc1");
        let hvcc = plain_box(b"hvcC", &[7]);
        let prfl = plain_box(b"prfl", &[0, 0, 0, 0, 0x00]);
        let mut schi_body = hvcc.clone();
        schi_body.extend_from_slice(&plain_box(b"povd", &prfl));
        let schi = plain_box(b"schi", &schi_body);
        let mut rinf_body = frma;
        rinf_body.extend_from_slice(&schi);
        let rinf = plain_box(b"rinf", &rinf_body);
        let data = stsd(&[visual_entry(b"resv", 2880, 1440, &rinf)]);
        let (parsed, _) = StsdBox::read_box(&data).unwrap();
        match &parsed.entries[0] {
            SampleEntry::Visual(v) => {
                assert_eq!(v.original_format, Some(*b"hvc1"));
                assert_eq!(v.codec_config.as_deref(), Some(&[7u8][..]));
                assert_eq!(v.omaf.projection.unwrap().projection_type, 0);
            }
            other => panic!("wrong entry kind: {:?}", other),
        }
    }
}
