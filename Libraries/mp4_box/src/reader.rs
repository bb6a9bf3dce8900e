//! Whole-buffer parsing: assembles the box modules into the views a
//! streaming client consumes. Track descriptions come from initialization
//! segments or whole files, per-track sample runs from media segments, and
//! segment indexes from (possibly truncated) on-demand windows.

use crate::boxes::ftyp::FtypBox;
use crate::boxes::generic::{BoxHeader, BoxIter};
use crate::boxes::moof::{sample_flags_is_sync, MoofBox};
use crate::boxes::moov::{MoovBox, TrexBox};
use crate::boxes::sidx::SidxBox;
use crate::boxes::stsd::SampleEntry;
use crate::boxes::trak::{HandlerType, TrackReference, TrakBox};
use crate::{read_u32_be, BoxError, Result};

/// One sample, located inside some byte blob (a media segment or a whole
/// file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleView {
    /// Byte offset of the sample payload inside the parsed blob.
    pub offset: u64,
    pub size: u32,
    /// Duration in track timescale units.
    pub duration: u32,
    pub is_sync: bool,
    /// 1-based index into the track's sample entries.
    pub sample_description_index: u32,
}

/// Static description of one track from `moov`.
#[derive(Debug, Clone)]
pub struct TrackDescription {
    pub track_id: u32,
    pub handler: HandlerType,
    pub timescale: u32,
    pub duration_ms: u64,
    pub width: u16,
    pub height: u16,
    pub sample_entries: Vec<SampleEntry>,
    pub references: Vec<TrackReference>,
    pub default_sample_duration: Option<u32>,
    /// Sample table for non-fragmented files; empty for init segments.
    pub samples: Vec<SampleView>,
    /// 1-based sync sample numbers; `None` means all samples sync.
    pub sync_samples: Option<Vec<u32>>,
}

impl TrackDescription {
    pub fn is_video(&self) -> bool {
        self.handler == HandlerType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.handler == HandlerType::Audio
    }

    pub fn is_timed_metadata(&self) -> bool {
        self.handler == HandlerType::TimedMetadata
    }
}

/// Result of parsing an initialization segment or whole file.
#[derive(Debug, Clone)]
pub struct InitializationInfo {
    pub brands: Option<FtypBox>,
    pub movie_timescale: u32,
    pub duration_ms: u64,
    pub tracks: Vec<TrackDescription>,
    pub track_extends: Vec<TrexBox>,
}

fn build_track(trak: &TrakBox, moov: &MoovBox, with_samples: bool) -> Result<TrackDescription> {
    let timescale = trak.mdhd.timescale.max(1);
    let duration_ms = trak.mdhd.duration * 1000 / timescale as u64;
    let samples = if with_samples {
        build_sample_table(trak)?
    } else {
        Vec::new()
    };
    Ok(TrackDescription {
        track_id: trak.tkhd.track_id,
        handler: trak.handler,
        timescale,
        duration_ms,
        width: trak.tkhd.width,
        height: trak.tkhd.height,
        sample_entries: trak.stbl.stsd.entries.clone(),
        references: trak.references.clone(),
        default_sample_duration: moov
            .trex_for(trak.tkhd.track_id)
            .map(|t| t.default_sample_duration),
        samples,
        sync_samples: trak
            .stbl
            .stss
            .as_ref()
            .map(|stss| stss.sample_numbers.clone()),
    })
}

/// Expands the compacted `stbl` tables into a flat per-sample list with
/// absolute file offsets. Only meaningful for non-fragmented files.
fn build_sample_table(trak: &TrakBox) -> Result<Vec<SampleView>> {
    let stbl = &trak.stbl;
    let sample_count = stbl.stsz.sample_count as usize;
    let mut durations = Vec::with_capacity(sample_count);
    for entry in &stbl.stts.entries {
        for _ in 0..entry.sample_count {
            durations.push(entry.sample_delta);
        }
    }
    if durations.len() < sample_count {
        return Err(BoxError::Malformed(
            "stts",
            "fewer durations than samples".into(),
        ));
    }

    let sync: Option<&Vec<u32>> = stbl.stss.as_ref().map(|s| &s.sample_numbers);
    let mut samples = Vec::with_capacity(sample_count);
    let mut sample_index = 0usize;

    let chunk_count = stbl.stco.offsets.len();
    for chunk in 0..chunk_count {
        // resolve samples-per-chunk and description index from the stsc run
        // covering this chunk (entries use 1-based first_chunk)
        let mut samples_per_chunk = 1u32;
        let mut description_index = 1u32;
        for entry in &stbl.stsc.entries {
            if entry.first_chunk as usize <= chunk + 1 {
                samples_per_chunk = entry.samples_per_chunk;
                description_index = entry.sample_description_index;
            } else {
                break;
            }
        }
        let mut offset = stbl.stco.offsets[chunk];
        for _ in 0..samples_per_chunk {
            if sample_index >= sample_count {
                break;
            }
            let size = stbl
                .stsz
                .size_of(sample_index)
                .ok_or_else(|| BoxError::Malformed("stsz", "sample size missing".into()))?;
            let number = sample_index as u32 + 1;
            samples.push(SampleView {
                offset,
                size,
                duration: durations[sample_index],
                is_sync: sync.map_or(true, |s| s.binary_search(&number).is_ok()),
                sample_description_index: description_index,
            });
            offset += size as u64;
            sample_index += 1;
        }
    }
    if sample_index != sample_count {
        return Err(BoxError::Malformed(
            "stbl",
            format!("chunk walk produced {} of {} samples", sample_index, sample_count),
        ));
    }
    Ok(samples)
}

fn parse_moov_buffer(data: &[u8], with_samples: bool) -> Result<InitializationInfo> {
    let mut brands = None;
    let mut moov = None;
    for entry in BoxIter::new(data) {
        let (header, bytes) = entry?;
        match &header.box_type {
            b"ftyp" | b"styp" => brands = Some(FtypBox::read_box(bytes)?.0),
            b"moov" => {
                moov = Some(MoovBox::read_box(bytes)?.0);
                break;
            }
            _ => {}
        }
    }
    let moov = moov.ok_or(BoxError::Malformed("moov", "not found".into()))?;
    let movie_timescale = moov.mvhd.timescale.max(1);
    let duration_ms = moov.mvhd.duration * 1000 / movie_timescale as u64;
    let tracks = moov
        .tracks
        .iter()
        .map(|t| build_track(t, &moov, with_samples))
        .collect::<Result<Vec<_>>>()?;
    Ok(InitializationInfo {
        brands,
        movie_timescale,
        duration_ms,
        tracks,
        track_extends: moov.track_extends.clone(),
    })
}

/// Parses an initialization segment: optional `ftyp`/`styp` plus `moov`.
/// Sample tables are left empty; samples arrive in media segments.
pub fn parse_initialization(data: &[u8]) -> Result<InitializationInfo> {
    parse_moov_buffer(data, false)
}

/// Parses a whole (non-fragmented) file, including the expanded sample
/// tables. Fails with [`BoxError::NotMp4`] when no `ftyp` leads the buffer
/// and with [`BoxError::Unsupported`] for brands outside the accepted set.
pub fn parse_file(data: &[u8]) -> Result<InitializationInfo> {
    if data.len() < 8 || &data[4..8] != b"ftyp" {
        return Err(BoxError::NotMp4);
    }
    let info = parse_moov_buffer(data, true)?;
    match &info.brands {
        Some(ftyp) if ftyp.is_supported() => Ok(info),
        Some(ftyp) => Err(BoxError::Unsupported(format!(
            "brand {}",
            crate::format_fourcc(&ftyp.major_brand)
        ))),
        None => Err(BoxError::NotMp4),
    }
}

/// Per-track sample run extracted from one `moof`.
#[derive(Debug, Clone)]
pub struct TrackFragment {
    pub track_id: u32,
    pub sequence_number: u32,
    pub base_decode_time: Option<u64>,
    pub sample_description_index: u32,
    pub samples: Vec<SampleView>,
}

/// Parses a media segment: every `moof` in the blob (a concatenated
/// extractor segment carries several) with sample offsets resolved to
/// absolute positions inside `data`. `defaults` are the `trex` rows from
/// the matching initialization segment.
pub fn parse_media_segment(data: &[u8], defaults: &[TrexBox]) -> Result<Vec<TrackFragment>> {
    let mut fragments = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= data.len() {
        let header = BoxHeader::read(&data[offset..])?;
        if &header.box_type == b"moof" {
            let moof_start = offset as u64;
            let (moof, _) = MoofBox::read_box(&data[offset..offset + header.total_size])?;
            for traf in &moof.trafs {
                fragments.push(build_fragment(&moof, traf, moof_start, defaults)?);
            }
        }
        offset += header.total_size;
    }
    if fragments.is_empty() {
        return Err(BoxError::Malformed(
            "moof",
            "media segment contains no movie fragment".into(),
        ));
    }
    Ok(fragments)
}

fn build_fragment(
    moof: &MoofBox,
    traf: &crate::boxes::moof::TrafBox,
    moof_start: u64,
    defaults: &[TrexBox],
) -> Result<TrackFragment> {
    let tfhd = &traf.tfhd;
    let trex = defaults.iter().find(|t| t.track_id == tfhd.track_id);
    let default_duration = tfhd
        .default_sample_duration
        .or(trex.map(|t| t.default_sample_duration));
    let default_size = tfhd
        .default_sample_size
        .or(trex.map(|t| t.default_sample_size));
    let default_flags = tfhd
        .default_sample_flags
        .or(trex.map(|t| t.default_sample_flags));

    // absolute position truns measure their data offset from
    let base = tfhd.base_data_offset.unwrap_or(moof_start);

    let mut samples = Vec::new();
    for trun in &traf.truns {
        let mut position = base
            .checked_add_signed(trun.data_offset.unwrap_or(0) as i64)
            .ok_or_else(|| BoxError::Malformed("trun", "data offset underflow".into()))?;
        for (i, sample) in trun.samples.iter().enumerate() {
            let size = sample.size.or(default_size).ok_or_else(|| {
                BoxError::Malformed("trun", "sample size unresolved".into())
            })?;
            let duration = sample.duration.or(default_duration).unwrap_or(0);
            let flags = if i == 0 {
                sample.flags.or(trun.first_sample_flags).or(default_flags)
            } else {
                sample.flags.or(default_flags)
            };
            let is_sync = match flags {
                Some(f) => sample_flags_is_sync(f),
                // no flag information anywhere: segment-leading sample is
                // the sync point
                None => samples.is_empty(),
            };
            samples.push(SampleView {
                offset: position,
                size,
                duration,
                is_sync,
                sample_description_index: tfhd.sample_description_index.unwrap_or(
                    trex.map(|t| t.default_sample_description_index).unwrap_or(1),
                ),
            });
            position += size as u64;
        }
    }
    Ok(TrackFragment {
        track_id: tfhd.track_id,
        sequence_number: moof.mfhd.sequence_number,
        base_decode_time: traf.tfdt.map(|t| t.base_decode_time),
        sample_description_index: tfhd
            .sample_description_index
            .unwrap_or(trex.map(|t| t.default_sample_description_index).unwrap_or(1)),
        samples,
    })
}

/// Scans a (possibly truncated) buffer for a `sidx`. Boxes before the
/// `sidx` are skipped by declared size; the `sidx` itself must be complete.
/// `position` is the absolute offset of `data` in the enclosing resource.
pub fn parse_segment_index(data: &[u8], position: u64) -> Result<SidxBox> {
    let mut offset = 0usize;
    while offset + 8 <= data.len() {
        let size = read_u32_be(data, offset)? as usize;
        if size < 8 {
            return Err(BoxError::Malformed("sidx scan", "bad box size".into()));
        }
        if &data[offset + 4..offset + 8] == b"sidx" {
            if offset + size > data.len() {
                return Err(BoxError::Truncated("sidx"));
            }
            let (sidx, _) = SidxBox::read_at(&data[offset..offset + size], position + offset as u64)?;
            return Ok(sidx);
        }
        offset += size;
    }
    Err(BoxError::Truncated("sidx"))
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

    fn full_box(fourcc: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
        let mut inner = vec![version, 0, 0, 0];
        inner.extend_from_slice(body);
        plain_box(fourcc, &inner)
    }

    fn ftyp() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"isom");
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(b"dash");
        plain_box(b"ftyp", &body)
    }

    fn mvhd(timescale: u32, duration: u32) -> Vec<u8> {
        let mut body = vec![0u8; 96];
        body[8..12].copy_from_slice(&timescale.to_be_bytes());
        body[12..16].copy_from_slice(&duration.to_be_bytes());
        full_box(b"mvhd", 0, &body)
    }

    fn tkhd(track_id: u32) -> Vec<u8> {
        let mut body = vec![0u8; 80];
        body[8..12].copy_from_slice(&track_id.to_be_bytes());
        body[72..74].copy_from_slice(&1920u16.to_be_bytes());
        body[76..78].copy_from_slice(&960u16.to_be_bytes());
        full_box(b"tkhd", 0, &body)
    }

    fn mdhd(timescale: u32) -> Vec<u8> {
        let mut body = vec![0u8; 20];
        body[8..12].copy_from_slice(&timescale.to_be_bytes());
        full_box(b"mdhd", 0, &body)
    }

    fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
        let mut body = vec![0u8; 20];
        body[4..8].copy_from_slice(handler);
        full_box(b"hdlr", 0, &body)
    }

    fn empty_stbl() -> Vec<u8> {
        let stsd = full_box(b"stsd", 0, &[0, 0, 0, 0]); // entry count 0
        let stts = full_box(b"stts", 0, &0u32.to_be_bytes());
        let stsc = full_box(b"stsc", 0, &0u32.to_be_bytes());
        let mut stsz_body = Vec::new();
        stsz_body.extend_from_slice(&0u32.to_be_bytes());
        stsz_body.extend_from_slice(&0u32.to_be_bytes());
        let stsz = full_box(b"stsz", 0, &stsz_body);
        let stco = full_box(b"stco", 0, &0u32.to_be_bytes());
        let mut body = stsd;
        body.extend_from_slice(&stts);
        body.extend_from_slice(&stsc);
        body.extend_from_slice(&stsz);
        body.extend_from_slice(&stco);
        plain_box(b"stbl", &body)
    }

    fn video_trak(track_id: u32) -> Vec<u8> {
        let minf = plain_box(b"minf", &empty_stbl());
        let mut mdia_body = mdhd(90000);
        mdia_body.extend_from_slice(&hdlr(b"vide"));
        mdia_body.extend_from_slice(&minf);
        let mdia = plain_box(b"mdia", &mdia_body);
        let mut trak_body = tkhd(track_id);
        trak_body.extend_from_slice(&mdia);
        plain_box(b"trak", &trak_body)
    }

    fn trex(track_id: u32, duration: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&track_id.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&duration.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        full_box(b"trex", 0, &body)
    }

    fn init_segment() -> Vec<u8> {
        let mvex = plain_box(b"mvex", &trex(1, 3000));
        let mut moov_body = mvhd(1000, 10_000);
        moov_body.extend_from_slice(&video_trak(1));
        moov_body.extend_from_slice(&mvex);
        let moov = plain_box(b"moov", &moov_body);
        let mut out = ftyp();
        out.extend_from_slice(&moov);
        out
    }

    #[test]
    fn init_segment_enumerates_tracks() {
        let data = init_segment();
        let info = parse_initialization(&data).unwrap();
        assert_eq!(info.tracks.len(), 1);
        let track = &info.tracks[0];
        assert_eq!(track.track_id, 1);
        assert!(track.is_video());
        assert_eq!(track.timescale, 90000);
        assert_eq!(track.width, 1920);
        assert_eq!(track.default_sample_duration, Some(3000));
        assert!(track.samples.is_empty());
    }

    fn media_segment(sequence: u32, sizes: &[u32]) -> Vec<u8> {
        let mfhd = full_box(b"mfhd", 0, &sequence.to_be_bytes());
        let mut tfhd_body = Vec::new();
        tfhd_body.extend_from_slice(&1u32.to_be_bytes());
        let tfhd = {
            let mut inner = vec![0, 0x02, 0, 0]; // default-base-is-moof
            inner.extend_from_slice(&tfhd_body);
            plain_box(b"tfhd", &inner)
        };
        let tfdt = full_box(b"tfdt", 0, &6000u32.to_be_bytes());
        let mut trun_inner = vec![0, 0, 0x02, 0x01]; // data offset + sizes
        trun_inner.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
        // data offset filled in after sizes are known
        let moof_payload_before_trun = mfhd.len() + tfhd.len() + tfdt.len();
        let trun_size = 8 + 4 + 4 + 4 + 4 * sizes.len();
        let moof_size = 8 + moof_payload_before_trun + trun_size;
        trun_inner.extend_from_slice(&((moof_size + 8) as u32).to_be_bytes());
        for s in sizes {
            trun_inner.extend_from_slice(&s.to_be_bytes());
        }
        let trun = plain_box(b"trun", &trun_inner);
        let mut traf_body = tfhd;
        traf_body.extend_from_slice(&tfdt);
        traf_body.extend_from_slice(&trun);
        let traf = plain_box(b"traf", &traf_body);
        let mut moof_body = mfhd;
        moof_body.extend_from_slice(&traf);
        let moof = plain_box(b"moof", &moof_body);
        assert_eq!(moof.len(), moof_size);
        let total: u32 = sizes.iter().sum();
        let mdat = plain_box(b"mdat", &vec![0xafu8; total as usize]);
        let mut out = moof;
        out.extend_from_slice(&mdat);
        out
    }

    #[test]
    fn media_segment_sample_runs() {
        let init = parse_initialization(&init_segment()).unwrap();
        let data = media_segment(4, &[100, 50, 25]);
        let fragments = parse_media_segment(&data, &init.track_extends).unwrap();
        assert_eq!(fragments.len(), 1);
        let frag = &fragments[0];
        assert_eq!(frag.track_id, 1);
        assert_eq!(frag.sequence_number, 4);
        assert_eq!(frag.base_decode_time, Some(6000));
        assert_eq!(frag.samples.len(), 3);
        // duration comes from trex default
        assert_eq!(frag.samples[0].duration, 3000);
        // offsets start right after moof and accumulate sizes
        let first = frag.samples[0].offset;
        assert_eq!(frag.samples[1].offset, first + 100);
        assert_eq!(frag.samples[2].offset, first + 150);
        // payload actually lives there
        assert_eq!(data[first as usize], 0xaf);
    }

    #[test]
    fn sidx_found_behind_other_boxes() {
        let sidx = crate::boxes::sidx::build_sidx(1000, &[(10, 2000)]);
        let mut data = ftyp();
        let ftyp_len = data.len() as u64;
        data.extend_from_slice(&sidx);
        // truncated trailing mdat must not break the scan
        data.extend_from_slice(&[0, 0, 1, 0, b'm', b'd', b'a', b't']);
        let parsed = parse_segment_index(&data, 0).unwrap();
        assert_eq!(parsed.anchor, ftyp_len + sidx.len() as u64);
    }

    #[test]
    fn missing_sidx_reports_truncation() {
        let data = ftyp();
        assert!(matches!(
            parse_segment_index(&data, 0),
            Err(BoxError::Truncated(_))
        ));
    }
}
