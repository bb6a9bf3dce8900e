//! OMAF projection metadata boxes.
//!
//! These are carried inside the restricted-scheme info of a visual sample
//! entry (`rinf` → `schi` → `povd`) or as siblings of it. Angles are signed
//! Q16.16 degrees on the wire.

use crate::boxes::generic::{BoxHeader, BoxIter};
use crate::{
    q16_to_f64, read_i32_be, read_u16_be, read_u32_be, read_version_and_flags, BoxError, Result,
};

/// Projection Format Box (`prfl`): 0 = equirectangular, 1 = cubemap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionFormatBox {
    pub projection_type: u8,
}

impl ProjectionFormatBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let raw = *payload.get(4).ok_or(BoxError::Truncated("prfl"))?;
        Ok((
            ProjectionFormatBox {
                projection_type: raw & 0x1f,
            },
            header.total_size,
        ))
    }
}

/// Stereo Video Box (`stvi`). The scheme/indication pair is collapsed into
/// the frame-packing arrangement the player cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StereoVideoBox {
    pub stereo_scheme: u32,
    pub stereo_indication: u8,
}

impl StereoVideoBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        // reserved+single_view_allowed u32, then scheme, length-prefixed
        // indication
        let stereo_scheme = read_u32_be(payload, 8)?;
        let length = read_u32_be(payload, 12)? as usize;
        if length == 0 || payload.len() < 16 + length {
            return Err(BoxError::Truncated("stvi"));
        }
        Ok((
            StereoVideoBox {
                stereo_scheme,
                stereo_indication: payload[16],
            },
            header.total_size,
        ))
    }

    /// CICP VideoFramePackingType values: 3 = side-by-side, 4 = top-bottom.
    pub fn is_side_by_side(&self) -> bool {
        self.stereo_indication == 3
    }

    pub fn is_top_bottom(&self) -> bool {
        self.stereo_indication == 4
    }

    pub fn is_temporal_interleaving(&self) -> bool {
        self.stereo_indication == 5
    }
}

/// Rotation Box (`rotn`): yaw/pitch/roll in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationBox {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl RotationBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        Ok((
            RotationBox {
                yaw: q16_to_f64(read_i32_be(payload, 4)?),
                pitch: q16_to_f64(read_i32_be(payload, 8)?),
                roll: q16_to_f64(read_i32_be(payload, 12)?),
            },
            header.total_size,
        ))
    }
}

/// A single region mapping of a Region-Wise Packing Box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingRegion {
    pub transform_type: u8,
    pub proj_reg_width: u32,
    pub proj_reg_height: u32,
    pub proj_reg_top: u32,
    pub proj_reg_left: u32,
    pub packed_reg_width: u16,
    pub packed_reg_height: u16,
    pub packed_reg_top: u16,
    pub packed_reg_left: u16,
}

/// Region-Wise Packing Box (`rwpk`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionWisePackingBox {
    pub constituent_picture_matching: bool,
    pub proj_picture_width: u32,
    pub proj_picture_height: u32,
    pub packed_picture_width: u16,
    pub packed_picture_height: u16,
    pub regions: Vec<PackingRegion>,
}

impl RegionWisePackingBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let constituent_picture_matching = payload
            .get(4)
            .map(|b| b & 0x80 != 0)
            .ok_or(BoxError::Truncated("rwpk"))?;
        let num_regions = *payload.get(5).ok_or(BoxError::Truncated("rwpk"))? as usize;
        let proj_picture_width = read_u32_be(payload, 6)?;
        let proj_picture_height = read_u32_be(payload, 10)?;
        let packed_picture_width = read_u16_be(payload, 14)?;
        let packed_picture_height = read_u16_be(payload, 16)?;
        let mut regions = Vec::with_capacity(num_regions);
        let mut offset = 18;
        for _ in 0..num_regions {
            let packing_type = *payload.get(offset).ok_or(BoxError::Truncated("rwpk"))? & 0x0f;
            let guard_band = *payload.get(offset).ok_or(BoxError::Truncated("rwpk"))? & 0x10 != 0;
            offset += 1;
            if packing_type != 0 {
                return Err(BoxError::Unsupported(format!(
                    "rwpk packing type {}",
                    packing_type
                )));
            }
            let region = PackingRegion {
                proj_reg_width: read_u32_be(payload, offset)?,
                proj_reg_height: read_u32_be(payload, offset + 4)?,
                proj_reg_top: read_u32_be(payload, offset + 8)?,
                proj_reg_left: read_u32_be(payload, offset + 12)?,
                transform_type: *payload
                    .get(offset + 16)
                    .ok_or(BoxError::Truncated("rwpk"))?
                    & 0x07,
                packed_reg_width: read_u16_be(payload, offset + 17)?,
                packed_reg_height: read_u16_be(payload, offset + 19)?,
                packed_reg_top: read_u16_be(payload, offset + 21)?,
                packed_reg_left: read_u16_be(payload, offset + 23)?,
            };
            offset += 25;
            if guard_band {
                // guard band struct: 4 x u8 widths + type/flag byte + reserved
                offset += 7;
            }
            regions.push(region);
        }
        Ok((
            RegionWisePackingBox {
                constituent_picture_matching,
                proj_picture_width,
                proj_picture_height,
                packed_picture_width,
                packed_picture_height,
                regions,
            },
            header.total_size,
        ))
    }
}

/// A sphere region in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereRegion {
    pub centre_azimuth: f64,
    pub centre_elevation: f64,
    pub centre_tilt: f64,
    pub azimuth_range: f64,
    pub elevation_range: f64,
}

impl SphereRegion {
    fn read(payload: &[u8], offset: usize) -> Result<(Self, usize)> {
        let region = SphereRegion {
            centre_azimuth: q16_to_f64(read_i32_be(payload, offset)?),
            centre_elevation: q16_to_f64(read_i32_be(payload, offset + 4)?),
            centre_tilt: q16_to_f64(read_i32_be(payload, offset + 8)?),
            azimuth_range: q16_to_f64(read_i32_be(payload, offset + 12)?),
            elevation_range: q16_to_f64(read_i32_be(payload, offset + 16)?),
        };
        // interpolate flag byte
        Ok((region, offset + 21))
    }
}

/// Coverage Information Box (`covi`).
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageInformationBox {
    pub coverage_shape_type: u8,
    pub regions: Vec<SphereRegion>,
}

impl CoverageInformationBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let coverage_shape_type = *payload.get(4).ok_or(BoxError::Truncated("covi"))?;
        let num_regions = *payload.get(5).ok_or(BoxError::Truncated("covi"))? as usize;
        // view_idc presence + default view idc
        let view_idc_presence = *payload.get(6).ok_or(BoxError::Truncated("covi"))? & 0x80 != 0;
        let mut regions = Vec::with_capacity(num_regions);
        let mut offset = 7;
        for _ in 0..num_regions {
            if view_idc_presence {
                offset += 1;
            }
            let (region, next) = SphereRegion::read(payload, offset)?;
            regions.push(region);
            offset = next;
        }
        Ok((
            CoverageInformationBox {
                coverage_shape_type,
                regions,
            },
            header.total_size,
        ))
    }
}

/// One ranked region of a quality-ranking box. Lower `quality_ranking` is
/// better; 0 means unspecified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityRankingRegion {
    pub quality_ranking: u8,
    pub view_idc: u8,
    /// Sphere region for `srqr`, absent for the remaining-area entry and for
    /// `2dqr` regions.
    pub sphere_region: Option<SphereRegion>,
    /// Picture-relative rect for `2dqr`.
    pub rect: Option<(u16, u16, u16, u16)>,
}

/// Sphere Region Quality Ranking Box (`srqr`) and 2D Region Quality Ranking
/// Box (`2dqr`), normalized to one shape.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityRankingBox {
    pub multiple_qualities: bool,
    pub regions: Vec<QualityRankingRegion>,
}

impl QualityRankingBox {
    pub fn read_sphere(data: &[u8]) -> Result<(Self, usize)> {
        Self::read(data, true)
    }

    pub fn read_2d(data: &[u8]) -> Result<(Self, usize)> {
        Self::read(data, false)
    }

    fn read(data: &[u8], sphere: bool) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        let payload = header.payload(data);
        read_version_and_flags(payload)?;
        let num_regions = *payload.get(4).ok_or(BoxError::Truncated("srqr"))? as usize;
        let flags = *payload.get(5).ok_or(BoxError::Truncated("srqr"))?;
        let remaining_area = flags & 0x80 != 0;
        let view_idc_presence = flags & 0x40 != 0;
        let multiple_qualities = flags & 0x20 != 0;
        let mut regions = Vec::with_capacity(num_regions);
        let mut offset = 6;
        for i in 0..num_regions {
            let quality_ranking = *payload.get(offset).ok_or(BoxError::Truncated("srqr"))?;
            offset += 1;
            let view_idc = if view_idc_presence {
                let v = *payload.get(offset).ok_or(BoxError::Truncated("srqr"))? >> 6;
                offset += 1;
                v
            } else {
                0
            };
            let last_is_remainder = remaining_area && i == num_regions - 1;
            let mut region = QualityRankingRegion {
                quality_ranking,
                view_idc,
                sphere_region: None,
                rect: None,
            };
            if !last_is_remainder {
                if sphere {
                    let (sr, next) = SphereRegion::read(payload, offset)?;
                    region.sphere_region = Some(sr);
                    offset = next;
                } else {
                    region.rect = Some((
                        read_u16_be(payload, offset)?,
                        read_u16_be(payload, offset + 2)?,
                        read_u16_be(payload, offset + 4)?,
                        read_u16_be(payload, offset + 6)?,
                    ));
                    offset += 8;
                }
            }
            regions.push(region);
        }
        Ok((
            QualityRankingBox {
                multiple_qualities,
                regions,
            },
            header.total_size,
        ))
    }
}

/// All OMAF properties found on one visual sample entry.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OmafProperties {
    pub projection: Option<ProjectionFormatBox>,
    pub stereo: Option<StereoVideoBox>,
    pub rotation: Option<RotationBox>,
    pub packing: Option<RegionWisePackingBox>,
    pub coverage: Option<CoverageInformationBox>,
    pub sphere_quality: Option<QualityRankingBox>,
    pub region_quality: Option<QualityRankingBox>,
}

impl OmafProperties {
    /// Walks a container's children, collecting OMAF boxes and recursing
    /// into the restricted-scheme containers they hide in.
    pub fn collect(&mut self, data: &[u8]) -> Result<()> {
        for entry in BoxIter::new(data) {
            let (child, bytes) = entry?;
            match &child.box_type {
                b"prfl" => self.projection = Some(ProjectionFormatBox::read_box(bytes)?.0),
                b"stvi" => self.stereo = Some(StereoVideoBox::read_box(bytes)?.0),
                b"rotn" => self.rotation = Some(RotationBox::read_box(bytes)?.0),
                b"rwpk" => self.packing = Some(RegionWisePackingBox::read_box(bytes)?.0),
                b"covi" => self.coverage = Some(CoverageInformationBox::read_box(bytes)?.0),
                b"srqr" => self.sphere_quality = Some(QualityRankingBox::read_sphere(bytes)?.0),
                b"2dqr" => self.region_quality = Some(QualityRankingBox::read_2d(bytes)?.0),
                b"rinf" | b"sinf" | b"schi" | b"povd" => {
                    self.collect(child.payload(bytes))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn any(&self) -> bool {
        self.projection.is_some()
            || self.stereo.is_some()
            || self.rotation.is_some()
            || self.packing.is_some()
            || self.coverage.is_some()
            || self.sphere_quality.is_some()
            || self.region_quality.is_some()
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

    fn q16(deg: f64) -> [u8; 4] {
        ((deg * 65536.0) as i32).to_be_bytes()
    }

    #[test]
    fn projection_type_masked() {
        let data = full_box(b"prfl", &[0xe1]);
        let (prfl, _) = ProjectionFormatBox::read_box(&data).unwrap();
        assert_eq!(prfl.projection_type, 1);
    }

    #[test]
    fn rotation_q16_degrees() {
        let mut body = Vec::new();
        body.extend_from_slice(&q16(90.0));
        body.extend_from_slice(&q16(-45.5));
        body.extend_from_slice(&q16(0.0));
        let data = full_box(b"rotn", &body);
        let (rotn, _) = RotationBox::read_box(&data).unwrap();
        assert_eq!(rotn.yaw, 90.0);
        assert_eq!(rotn.pitch, -45.5);
        assert_eq!(rotn.roll, 0.0);
    }

    #[test]
    fn rwpk_region_fields() {
        let mut body = Vec::new();
        body.push(0x00); // no constituent picture matching
        body.push(1); // one region
        body.extend_from_slice(&3840u32.to_be_bytes());
        body.extend_from_slice(&1920u32.to_be_bytes());
        body.extend_from_slice(&1920u16.to_be_bytes());
        body.extend_from_slice(&960u16.to_be_bytes());
        body.push(0); // rectangular, no guard band
        body.extend_from_slice(&1280u32.to_be_bytes()); // proj w
        body.extend_from_slice(&960u32.to_be_bytes()); // proj h
        body.extend_from_slice(&0u32.to_be_bytes()); // top
        body.extend_from_slice(&2560u32.to_be_bytes()); // left
        body.push(5); // transform: rotate 90 left
        body.extend_from_slice(&640u16.to_be_bytes());
        body.extend_from_slice(&480u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&1280u16.to_be_bytes());
        let data = full_box(b"rwpk", &body);
        let (rwpk, _) = RegionWisePackingBox::read_box(&data).unwrap();
        assert!(!rwpk.constituent_picture_matching);
        assert_eq!(rwpk.regions.len(), 1);
        let r = &rwpk.regions[0];
        assert_eq!(r.transform_type, 5);
        assert_eq!(r.proj_reg_left, 2560);
        assert_eq!(r.packed_reg_left, 1280);
    }

    #[test]
    fn collect_descends_into_scheme_info() {
        let prfl = full_box(b"prfl", &[1]);
        let mut povd_body = prfl.clone();
        let mut rotn_body = Vec::new();
        rotn_body.extend_from_slice(&q16(10.0));
        rotn_body.extend_from_slice(&q16(0.0));
        rotn_body.extend_from_slice(&q16(0.0));
        povd_body.extend_from_slice(&full_box(b"rotn", &rotn_body));
        let mut povd = Vec::new();
        povd.extend_from_slice(&((povd_body.len() as u32) + 8).to_be_bytes());
        povd.extend_from_slice(b"povd");
        povd.extend_from_slice(&povd_body);

        let mut props = OmafProperties::default();
        props.collect(&povd).unwrap();
        assert_eq!(props.projection.unwrap().projection_type, 1);
        assert_eq!(props.rotation.unwrap().yaw, 10.0);
    }
}
