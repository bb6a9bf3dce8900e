//! Decoder-boundary types and the segment parser adapter.

pub mod adapter;

/// Stable identity of one elementary stream. Tied to an adaptation set, not
/// a representation: it survives ABR switches.
pub type StreamId = u32;

/// One decodable sample handed across the decoder boundary.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub stream_id: StreamId,
    pub data: Vec<u8>,
    /// Running sample number within the stream.
    pub sample_id: u32,
    pub presentation_time_us: u64,
    pub duration_us: u64,
    pub is_sync: bool,
    /// First sample carrying a new sample description; `decoder_config`
    /// holds the new codec configuration when set.
    pub config_changed: bool,
    pub decoder_config: Option<Vec<u8>>,
}

/// Test fixtures: hand-built fragmented MP4 segments, shared by the
/// adapter, representation and adaptation-set tests.
#[cfg(test)]
pub(crate) mod test_media {
    use bytes::Bytes;

    pub fn plain_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((body.len() as u32) + 8).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend_from_slice(body);
        out
    }

    pub fn full_box(fourcc: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
        let mut inner = vec![version, 0, 0, 0];
        inner.extend_from_slice(body);
        plain_box(fourcc, &inner)
    }

    fn ftyp() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"isom");
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(b"dash");
        body.extend_from_slice(b"hevi");
        plain_box(b"ftyp", &body)
    }

    fn mvhd(timescale: u32, duration: u32) -> Vec<u8> {
        let mut body = vec![0u8; 96];
        body[8..12].copy_from_slice(&timescale.to_be_bytes());
        body[12..16].copy_from_slice(&duration.to_be_bytes());
        full_box(b"mvhd", 0, &body)
    }

    fn tkhd(track_id: u32, width: u16, height: u16) -> Vec<u8> {
        let mut body = vec![0u8; 80];
        body[8..12].copy_from_slice(&track_id.to_be_bytes());
        body[72..74].copy_from_slice(&width.to_be_bytes());
        body[76..78].copy_from_slice(&height.to_be_bytes());
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

    fn visual_sample_entry(format: &[u8; 4], config: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 78];
        body[24..26].copy_from_slice(&1920u16.to_be_bytes());
        body[26..28].copy_from_slice(&960u16.to_be_bytes());
        body.extend_from_slice(&plain_box(b"hvcC", config));
        plain_box(format, &body)
    }

    fn stbl_with_entries(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut stsd_body = vec![0u8; 4];
        stsd_body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for entry in entries {
            stsd_body.extend_from_slice(entry);
        }
        // stsd is a full box; the leading 4 bytes above are version/flags
        let mut stsd = Vec::new();
        stsd.extend_from_slice(&((stsd_body.len() as u32) + 8).to_be_bytes());
        stsd.extend_from_slice(b"stsd");
        stsd.extend_from_slice(&stsd_body);

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

    fn trak(track_id: u32, handler: &[u8; 4], entries: &[Vec<u8>]) -> Vec<u8> {
        let minf = plain_box(b"minf", &stbl_with_entries(entries));
        let mut mdia_body = mdhd(1000);
        mdia_body.extend_from_slice(&hdlr(handler));
        mdia_body.extend_from_slice(&minf);
        let mdia = plain_box(b"mdia", &mdia_body);
        let mut trak_body = tkhd(track_id, 1920, 960);
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

    /// Init segment with one video track (track 1, timescale 1000, default
    /// sample duration `sample_duration_ms`) and optionally a timed
    /// metadata track (track 2).
    pub fn init_segment(sample_duration_ms: u32, with_metadata_track: bool) -> Bytes {
        let mut moov_body = mvhd(1000, 10_000);
        moov_body.extend_from_slice(&trak(
            1,
            b"vide",
            &[visual_sample_entry(b"hvc1", &[1, 2, 3])],
        ));
        let mut mvex_body = trex(1, sample_duration_ms);
        if with_metadata_track {
            moov_body.extend_from_slice(&trak(
                2,
                b"meta",
                &[plain_box(b"urim", &vec![0u8; 16])],
            ));
            mvex_body.extend_from_slice(&trex(2, sample_duration_ms));
        }
        moov_body.extend_from_slice(&plain_box(b"mvex", &mvex_body));
        let moov = plain_box(b"moov", &moov_body);
        let mut out = ftyp();
        out.extend_from_slice(&moov);
        Bytes::from(out)
    }

    /// Media segment for `track_id` holding `sizes.len()` samples, decode
    /// start time `base_time_ms`. The first sample is a sync sample.
    pub fn media_segment(track_id: u32, sequence: u32, base_time_ms: u32, sizes: &[u32]) -> Bytes {
        let mfhd = full_box(b"mfhd", 0, &sequence.to_be_bytes());
        let tfhd = {
            // default-base-is-moof
            let mut inner = vec![0, 0x02, 0, 0];
            inner.extend_from_slice(&track_id.to_be_bytes());
            plain_box(b"tfhd", &inner)
        };
        let tfdt = full_box(b"tfdt", 0, &base_time_ms.to_be_bytes());
        // trun: data offset + first-sample-flags (sync) + per-sample sizes
        let mut trun_inner = vec![0, 0, 0x02, 0x05];
        trun_inner.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
        let before_trun = mfhd.len() + tfhd.len() + tfdt.len();
        let trun_size = 8 + 4 + 4 + 4 + 4 + 4 * sizes.len();
        let moof_size = 8 + before_trun + trun_size;
        trun_inner.extend_from_slice(&((moof_size + 8) as u32).to_be_bytes());
        trun_inner.extend_from_slice(&0u32.to_be_bytes());
        for size in sizes {
            trun_inner.extend_from_slice(&size.to_be_bytes());
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
        let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let mdat = plain_box(b"mdat", &payload);
        let mut out = moof;
        out.extend_from_slice(&mdat);
        Bytes::from(out)
    }
}
