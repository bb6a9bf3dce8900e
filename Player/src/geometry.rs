//! Projection source model: turns OMAF properties (from boxes or MPD) into
//! the per-stream `VideoSource` descriptors a head-tracked renderer
//! composits from. The cubemap path rewrites OMAF's on-the-wire layout
//! (LFRDBU with a rotated bottom row) into the internal LFRDBU-unrotated
//! layout.

use mp4_box::boxes::omaf::{RegionWisePackingBox, RotationBox, StereoVideoBox};

/// Projection geometry of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    EquirectPanorama,
    Equirect180,
    Cubemap,
    EquirectTiles,
    CubemapTiles,
    Identity,
}

/// How the two stereo channels are arranged across tracks/frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceDirection {
    #[default]
    Mono,
    TopBottom,
    LeftRight,
    /// One channel per track.
    DualTrack,
}

/// The eye a source feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StereoPosition {
    #[default]
    Mono,
    Left,
    Right,
    FramePacked,
}

/// Rotation applied to the whole projection, radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rotation {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl Rotation {
    pub fn from_box(rotation: &RotationBox) -> Rotation {
        Rotation {
            yaw: rotation.yaw.to_radians(),
            pitch: rotation.pitch.to_radians(),
            roll: rotation.roll.to_radians(),
        }
    }
}

/// One packed → projected rectangle mapping for equirectangular content.
/// Input rect is normalized to the packed picture; the projected side is
/// spherical (degrees, longitude grows right, latitude up).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquirectRegion {
    pub input_x: f64,
    pub input_y: f64,
    pub input_width: f64,
    pub input_height: f64,
    pub center_longitude: f64,
    pub center_latitude: f64,
    pub span_longitude: f64,
    pub span_latitude: f64,
}

/// Orientation of a cube face section, clockwise 90-degree steps with a
/// mirror bank at 4..7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceOrientation {
    NoRotation,
    Rotated90Right,
    Rotated180,
    Rotated90Left,
    MirrorNoRotation,
    MirrorRotated90Right,
    MirrorRotated180,
    MirrorRotated90Left,
}

impl FaceOrientation {
    pub fn from_index(index: u8) -> FaceOrientation {
        match index & 0x7 {
            0 => FaceOrientation::NoRotation,
            1 => FaceOrientation::Rotated90Right,
            2 => FaceOrientation::Rotated180,
            3 => FaceOrientation::Rotated90Left,
            4 => FaceOrientation::MirrorNoRotation,
            5 => FaceOrientation::MirrorRotated90Right,
            6 => FaceOrientation::MirrorRotated180,
            _ => FaceOrientation::MirrorRotated90Left,
        }
    }
}

/// A rectangular section of one cube face: where it sits in the decoded
/// picture (source) and inside the face (origin), both normalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubeFaceSection {
    pub source_x: f64,
    pub source_y: f64,
    pub source_width: f64,
    pub source_height: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub origin_width: f64,
    pub origin_height: f64,
    pub orientation: FaceOrientation,
}

/// One face of the internal cubemap. `face_index` follows the internal
/// order: 0 front, 1 left, 2 back, 3 right, 4 top, 5 bottom.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CubeFace {
    pub face_index: usize,
    pub sections: Vec<CubeFaceSection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CubemapSource {
    pub faces: [CubeFace; 6],
    pub rotation: Rotation,
    pub stereo: StereoPosition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquirectSource {
    /// Empty means the full panorama without repacking.
    pub regions: Vec<EquirectRegion>,
    pub rotation: Rotation,
    pub stereo: StereoPosition,
    /// 180 degree content spans only half the sphere.
    pub span_longitude: f64,
}

/// Per-stream projection descriptor handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoSource {
    Equirect(EquirectSource),
    Cubemap(CubemapSource),
    /// Plain 2D content.
    Identity,
}

impl VideoSource {
    pub fn source_type(&self) -> SourceType {
        match self {
            VideoSource::Equirect(source) if !source.regions.is_empty() => {
                SourceType::EquirectTiles
            }
            VideoSource::Equirect(source) if source.span_longitude <= 180.0 => {
                SourceType::Equirect180
            }
            VideoSource::Equirect(_) => SourceType::EquirectPanorama,
            VideoSource::Cubemap(source)
                if source.faces.iter().map(|f| f.sections.len()).sum::<usize>() > 6 =>
            {
                SourceType::CubemapTiles
            }
            VideoSource::Cubemap(_) => SourceType::Cubemap,
            VideoSource::Identity => SourceType::Identity,
        }
    }
}

pub fn source_direction_from_stereo(stereo: Option<&StereoVideoBox>) -> SourceDirection {
    match stereo {
        Some(s) if s.is_top_bottom() => SourceDirection::TopBottom,
        Some(s) if s.is_side_by_side() => SourceDirection::LeftRight,
        _ => SourceDirection::Mono,
    }
}

/// Maps equirect `rwpk` regions to spherical rectangles. With constituent
/// picture matching set, the region list is emitted twice with per-eye
/// offsets (top-bottom: second eye shifted down; side-by-side: right).
pub fn equirect_regions(
    rwpk: &RegionWisePackingBox,
    direction: SourceDirection,
) -> Vec<EquirectRegion> {
    let mut regions = Vec::new();
    if rwpk.constituent_picture_matching {
        let (mut width, mut height) = (rwpk.proj_picture_width, rwpk.proj_picture_height);
        let mut span_lon = 360.0;
        let mut span_lat = 180.0;
        let mut origin_lon = 180.0;
        let mut origin_lat = 90.0;
        match direction {
            SourceDirection::TopBottom => {
                height /= 2;
                span_lat = 90.0;
            }
            SourceDirection::LeftRight => {
                width /= 2;
                span_lon = 180.0;
                origin_lon = 0.0;
            }
            _ => {}
        }
        for region in &rwpk.regions {
            regions.push(map_equirect_region(
                region, rwpk, width, height, 0.0, 0.0, span_lon, span_lat, origin_lon, origin_lat,
            ));
        }
        let (offset_x, offset_y) = match direction {
            SourceDirection::TopBottom => {
                origin_lat = 0.0;
                (0.0, 0.5)
            }
            SourceDirection::LeftRight => {
                origin_lon = 180.0;
                (0.5, 0.0)
            }
            _ => (0.0, 0.0),
        };
        for region in &rwpk.regions {
            regions.push(map_equirect_region(
                region, rwpk, width, height, offset_x, offset_y, span_lon, span_lat, origin_lon,
                origin_lat,
            ));
        }
    } else {
        for region in &rwpk.regions {
            regions.push(map_equirect_region(
                region,
                rwpk,
                rwpk.proj_picture_width,
                rwpk.proj_picture_height,
                0.0,
                0.0,
                360.0,
                180.0,
                180.0,
                90.0,
            ));
        }
    }
    regions
}

#[allow(clippy::too_many_arguments)]
fn map_equirect_region(
    region: &mp4_box::boxes::omaf::PackingRegion,
    rwpk: &RegionWisePackingBox,
    proj_width: u32,
    proj_height: u32,
    offset_x: f64,
    offset_y: f64,
    span_lon: f64,
    span_lat: f64,
    origin_lon: f64,
    origin_lat: f64,
) -> EquirectRegion {
    let packed_w = rwpk.packed_picture_width.max(1) as f64;
    let packed_h = rwpk.packed_picture_height.max(1) as f64;
    let proj_w = proj_width.max(1) as f64;
    let proj_h = proj_height.max(1) as f64;
    EquirectRegion {
        input_x: region.packed_reg_left as f64 / packed_w + offset_x,
        input_y: region.packed_reg_top as f64 / packed_h + offset_y,
        input_width: region.packed_reg_width as f64 / packed_w,
        input_height: region.packed_reg_height as f64 / packed_h,
        center_longitude: ((region.proj_reg_left + region.proj_reg_width / 2) as f64 / proj_w)
            * span_lon
            - origin_lon,
        center_latitude: origin_lat
            - ((region.proj_reg_top + region.proj_reg_height / 2) as f64 / proj_h) * span_lat,
        span_longitude: region.proj_reg_width as f64 / proj_w * span_lon,
        span_latitude: region.proj_reg_height as f64 / proj_h * span_lat,
    }
}

/// OMAF face order across the 3x2 projected picture: L F R / D B U.
/// Internal face indices: 0 front, 1 left, 2 back, 3 right, 4 top,
/// 5 bottom.
const OMAF_POSITION_TO_FACE: [(char, usize); 6] = [
    ('L', 1),
    ('F', 0),
    ('R', 3),
    ('D', 5),
    ('B', 2),
    ('U', 4),
];

/// Rewrites an OMAF transform into the internal orientation for one face.
///
/// OMAF's default layout rotates the bottom row (D, B, U) relative to the
/// internal LFRDBU-unrotated layout: the bottom face picks up an extra 90
/// right, the top face sheds 90, the back face is already aligned. The
/// mirror bank (4..7) is preserved; the enum runs clockwise in 90-degree
/// steps so a rotation is one step up or down within the bank.
fn convert_transform(omaf_transform: u8, face: char) -> FaceOrientation {
    // the wire enum maps onto the internal clockwise enum with mirror kept
    let internal: u8 = match omaf_transform & 0x7 {
        1 => 4,          // mirror, no rotation
        2 => 2,          // 180
        3 => 6,          // mirror + 180
        4 => 7,          // mirror + 90 left
        5 => 3,          // 90 left
        6 => 5,          // mirror + 90 right
        7 => 1,          // 90 right
        _ => 0,
    };
    let base = if internal > 3 { 4 } else { 0 };
    let adjusted = match face {
        'D' => base + (internal - base + 1) % 4,
        'U' => base + (internal - base + 3) % 4,
        _ => internal,
    };
    FaceOrientation::from_index(adjusted)
}

/// Maps cubemap `rwpk` regions from the packed picture into the internal
/// cubemap layout.
pub fn cubemap_from_rwpk(
    rwpk: &RegionWisePackingBox,
    direction: SourceDirection,
    rotation: Rotation,
    stereo: StereoPosition,
) -> CubemapSource {
    let mut projected_width = rwpk.proj_picture_width;
    let mut projected_height = rwpk.proj_picture_height;
    // both stereo channels must share the packing; restrict to one channel
    match direction {
        SourceDirection::TopBottom => projected_height /= 2,
        SourceDirection::LeftRight => projected_width /= 2,
        _ => {}
    }
    let face_width = (rwpk.proj_picture_width as f64 / 3.0).max(1.0);
    let face_height = (rwpk.proj_picture_height as f64 / 2.0).max(1.0);

    let mut source = CubemapSource {
        rotation,
        stereo,
        ..Default::default()
    };
    for region in &rwpk.regions {
        if region.proj_reg_top >= projected_height || region.proj_reg_left >= projected_width {
            // stereo region of the other channel
            continue;
        }
        let row = (region.proj_reg_top as usize) / (projected_height as usize / 2).max(1);
        let col = (region.proj_reg_left as usize) / (projected_width as usize / 3).max(1);
        let position = (row * 3 + col).min(5);
        let (face_letter, face_index) = OMAF_POSITION_TO_FACE[position];

        let mut section = CubeFaceSection {
            source_x: region.packed_reg_left as f64 / rwpk.packed_picture_width.max(1) as f64,
            source_y: region.packed_reg_top as f64 / rwpk.packed_picture_height.max(1) as f64,
            source_width: region.packed_reg_width as f64 / rwpk.packed_picture_width.max(1) as f64,
            source_height: region.packed_reg_height as f64
                / rwpk.packed_picture_height.max(1) as f64,
            origin_x: region.proj_reg_left as f64 / face_width - col as f64,
            origin_y: region.proj_reg_top as f64 / face_height - row as f64,
            origin_width: region.proj_reg_width as f64 / face_width,
            origin_height: region.proj_reg_height as f64 / face_height,
            orientation: convert_transform(region.transform_type, face_letter),
        };
        // OMAF rotates the bottom row on the wire; partial sections of the
        // top and bottom faces must have their in-face origin rotated along
        // with the transform rewrite
        if (face_letter == 'D' || face_letter == 'U')
            && (section.origin_width < 1.0 || section.origin_height < 1.0)
        {
            rotate_section(&mut section, face_letter == 'D');
        }
        source.faces[position].face_index = face_index;
        source.faces[position].sections.push(section);
    }
    for (position, (_, face_index)) in OMAF_POSITION_TO_FACE.iter().enumerate() {
        source.faces[position].face_index = *face_index;
    }
    source
}

/// Rotates a section's in-face rectangle a quarter turn inside the unit
/// face, right when `clockwise` and left otherwise, swapping its extent.
fn rotate_section(section: &mut CubeFaceSection, clockwise: bool) {
    let (x, y, w, h) = (
        section.origin_x,
        section.origin_y,
        section.origin_width,
        section.origin_height,
    );
    if clockwise {
        section.origin_x = 1.0 - (y + h);
        section.origin_y = x;
    } else {
        section.origin_x = y;
        section.origin_y = 1.0 - (x + w);
    }
    section.origin_width = h;
    section.origin_height = w;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp4_box::boxes::omaf::PackingRegion;

    fn full_face_region(col: u32, row: u32, transform: u8) -> PackingRegion {
        PackingRegion {
            transform_type: transform,
            proj_reg_width: 960,
            proj_reg_height: 960,
            proj_reg_top: row * 960,
            proj_reg_left: col * 960,
            packed_reg_width: 640,
            packed_reg_height: 640,
            packed_reg_top: (row * 640) as u16,
            packed_reg_left: (col * 640) as u16,
        }
    }

    fn default_omaf_rwpk() -> RegionWisePackingBox {
        // OMAF default: top row unrotated, bottom row (D B U) carries the
        // wire rotation of 90 right
        let mut regions = Vec::new();
        for col in 0..3 {
            regions.push(full_face_region(col, 0, 0));
        }
        for col in 0..3 {
            regions.push(full_face_region(col, 1, 7)); // wire: rotate 90 right
        }
        RegionWisePackingBox {
            constituent_picture_matching: false,
            proj_picture_width: 2880,
            proj_picture_height: 1920,
            packed_picture_width: 1920,
            packed_picture_height: 1280,
            regions,
        }
    }

    #[test]
    fn default_layout_covers_each_face_once() {
        let source = cubemap_from_rwpk(
            &default_omaf_rwpk(),
            SourceDirection::Mono,
            Rotation::default(),
            StereoPosition::Mono,
        );
        let mut seen = [false; 6];
        for face in &source.faces {
            assert_eq!(face.sections.len(), 1);
            assert!(!seen[face.face_index]);
            seen[face.face_index] = true;
            let section = &face.sections[0];
            assert_eq!(section.origin_x, 0.0);
            assert_eq!(section.origin_y, 0.0);
            assert_eq!(section.origin_width, 1.0);
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn bottom_row_rotation_rewritten() {
        let source = cubemap_from_rwpk(
            &default_omaf_rwpk(),
            SourceDirection::Mono,
            Rotation::default(),
            StereoPosition::Mono,
        );
        // top row carried no wire transform and stays unrotated internally
        for position in 0..3 {
            assert_eq!(
                source.faces[position].sections[0].orientation,
                FaceOrientation::NoRotation
            );
        }
        // the bottom row carried the wire 90-right: D gains another step
        // (180), B keeps it, U sheds it
        assert_eq!(
            source.faces[3].sections[0].orientation,
            FaceOrientation::Rotated180
        );
        assert_eq!(
            source.faces[4].sections[0].orientation,
            FaceOrientation::Rotated90Right
        );
        assert_eq!(
            source.faces[5].sections[0].orientation,
            FaceOrientation::NoRotation
        );
    }

    #[test]
    fn equirect_full_packing_round_trip() {
        let rwpk = RegionWisePackingBox {
            constituent_picture_matching: false,
            proj_picture_width: 3840,
            proj_picture_height: 1920,
            packed_picture_width: 1920,
            packed_picture_height: 960,
            regions: vec![PackingRegion {
                transform_type: 0,
                proj_reg_width: 1920,
                proj_reg_height: 960,
                proj_reg_top: 480,
                proj_reg_left: 960,
                packed_reg_width: 960,
                packed_reg_height: 480,
                packed_reg_top: 0,
                packed_reg_left: 0,
            }],
        };
        let regions = equirect_regions(&rwpk, SourceDirection::Mono);
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        // projected center: left 960 + 960 of 3840 => half across => 0 deg
        assert_eq!(r.center_longitude, 0.0);
        assert_eq!(r.span_longitude, 180.0);
        assert_eq!(r.center_latitude, 0.0);
        assert_eq!(r.span_latitude, 90.0);
        assert_eq!(r.input_width, 0.5);
    }

    #[test]
    fn constituent_matching_duplicates_regions() {
        let mut rwpk = default_omaf_rwpk();
        rwpk.constituent_picture_matching = true;
        let regions = equirect_regions(&rwpk, SourceDirection::TopBottom);
        assert_eq!(regions.len(), 12);
        // second eye shifted down half the packed picture
        assert_eq!(regions[6].input_y, regions[0].input_y + 0.5);
    }
}
