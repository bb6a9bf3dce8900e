//! Viewport/tile intersection for tile prioritization.
//!
//! The rendered viewport is approximated as a quadrilateral with straight
//! sides; tiles are spherical rectangles. The returned score is an
//! unnormalized area used only for ordering tiles, never as a real solid
//! angle.

/// Whether a tile lives on an equirectangular panorama or a cubemap face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileType {
    Equirect,
    Cubemap,
}

/// Direction longitudes grow in the source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongitudeDirection {
    CounterClockwise,
    Clockwise,
}

/// The spherical rectangle one tile covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileViewport {
    longitude: f64,
    latitude: f64,
    hor_fov: f64,
    ver_fov: f64,
    tile_type: TileType,
}

impl TileViewport {
    pub fn new(tile_type: TileType) -> TileViewport {
        TileViewport {
            longitude: 0.0,
            latitude: 0.0,
            hor_fov: 360.0,
            ver_fov: 180.0,
            tile_type,
        }
    }

    pub fn set(
        &mut self,
        longitude: f64,
        latitude: f64,
        hor_fov: f64,
        ver_fov: f64,
        direction: LongitudeDirection,
    ) {
        self.longitude = match direction {
            LongitudeDirection::Clockwise => -longitude,
            LongitudeDirection::CounterClockwise => longitude,
        };
        self.latitude = latitude;
        self.hor_fov = hor_fov;
        self.ver_fov = ver_fov;
    }

    pub fn center_latitude(&self) -> f64 {
        self.latitude
    }

    pub fn center_longitude(&self) -> f64 {
        self.longitude
    }

    pub fn span(&self) -> (f64, f64) {
        (self.hor_fov, self.ver_fov)
    }

    pub fn tile_type(&self) -> TileType {
        self.tile_type
    }

    fn top_bottom(&self) -> (f64, f64) {
        (
            self.latitude + self.ver_fov / 2.0,
            self.latitude - self.ver_fov / 2.0,
        )
    }

    fn left_right(&self) -> (f64, f64) {
        (
            self.longitude + self.hor_fov / 2.0,
            self.longitude - self.hor_fov / 2.0,
        )
    }
}

/// The viewport reported by the renderer, with the quadrilateral
/// approximation pre-computed for intersection tests.
#[derive(Debug, Clone, Copy)]
pub struct RenderedViewport {
    longitude: f64,
    latitude: f64,
    top_y: f64,
    bottom_y: f64,
    top_left_x: f64,
    bottom_left_x: f64,
    top_right_x: f64,
    bottom_right_x: f64,
    slope_left: f64,
    shift_left: f64,
    slope_right: f64,
    shift_right: f64,
}

impl Default for RenderedViewport {
    fn default() -> Self {
        let mut viewport = RenderedViewport {
            longitude: 0.0,
            latitude: 0.0,
            top_y: 90.0,
            bottom_y: -90.0,
            top_left_x: 180.0,
            bottom_left_x: 180.0,
            top_right_x: -180.0,
            bottom_right_x: -180.0,
            slope_left: 0.0,
            shift_left: -180.0,
            slope_right: 0.0,
            shift_right: 180.0,
        };
        viewport.set_position(0.0, 0.0, 360.0, 180.0, TileType::Equirect);
        viewport
    }
}

impl RenderedViewport {
    /// Updates the viewport center and field of view. The quadrilateral
    /// widens towards the poles the way an equirect projection stretches,
    /// also when the tiles are cubemap faces.
    pub fn set_position(
        &mut self,
        longitude: f64,
        latitude: f64,
        width: f64,
        height: f64,
        tile_type: TileType,
    ) {
        self.longitude = longitude;
        self.latitude = latitude;
        self.top_y = (latitude + height / 2.0).min(90.0);
        self.bottom_y = (latitude - height / 2.0).max(-90.0);

        if latitude + height / 2.0 > 90.0 {
            // crosses the north pole: the top edge covers the full circle
            let crossing = latitude + height / 2.0 - 90.0;
            let angle = (crossing / (height / 2.0)).asin().to_degrees();
            self.top_left_x = longitude + 180.0;
            self.bottom_left_x = longitude + 90.0 + angle;
            self.top_right_x = longitude - 180.0;
            self.bottom_right_x = longitude - 90.0 - angle;
        } else if latitude - height / 2.0 < -90.0 {
            // crosses the south pole
            let crossing = latitude - height / 2.0 + 90.0;
            let angle = (crossing / (height / 2.0)).asin().to_degrees();
            self.top_left_x = longitude + 90.0 - angle;
            self.bottom_left_x = longitude + 180.0;
            self.top_right_x = longitude - 90.0 + angle;
            self.bottom_right_x = longitude - 180.0;
        } else {
            let mut stretch_top = 0.0;
            let mut stretch_bottom = 0.0;
            if latitude + height / 2.0 > 60.0 {
                stretch_top = 30.0;
            } else if latitude - height / 2.0 < -60.0 {
                stretch_bottom = 30.0;
            }
            // values may run out of the +-180 range; the wrap is handled
            // during intersection
            self.top_left_x = longitude + width / 2.0 + stretch_top;
            self.bottom_left_x = longitude + width / 2.0 + stretch_bottom;
            self.top_right_x = longitude - width / 2.0 - stretch_top;
            self.bottom_right_x = longitude - width / 2.0 - stretch_bottom;
        }

        if tile_type == TileType::Equirect {
            // side estimate x = k*y + b, used when the tile crops the
            // viewport on top or bottom
            let span_y = self.top_y - self.bottom_y;
            if span_y > 0.0 {
                self.slope_left = (self.top_left_x - self.bottom_left_x) / span_y;
                self.shift_left = self.top_left_x - self.slope_left * self.top_y;
                self.slope_right = (self.top_right_x - self.bottom_right_x) / span_y;
                self.shift_right = self.top_right_x - self.slope_right * self.top_y;
            }
        }
    }

    /// Unnormalized intersection score against a tile.
    pub fn intersect(&self, tile: &TileViewport) -> f64 {
        let (tile_left, tile_right) = tile.left_right();
        match tile.tile_type() {
            TileType::Equirect => {
                if tile_left <= 180.0 && tile_right >= -180.0 {
                    self.check_intersection(tile, false)
                } else {
                    // tile wraps across +-180: try both placements
                    let score = self.check_intersection(tile, false);
                    if score == 0.0 {
                        self.check_intersection(tile, true)
                    } else {
                        score
                    }
                }
            }
            TileType::Cubemap => {
                if tile.center_latitude() > 45.0 || tile.center_latitude() < -45.0 {
                    self.check_intersection_cube_top_bottom(tile)
                } else if tile_left <= 180.0 && tile_right >= -180.0 {
                    self.check_intersection_cube_middle(tile)
                } else {
                    0.0
                }
            }
        }
    }

    fn left_x_at(&self, limit_y: f64, tile_y: f64) -> f64 {
        if limit_y == tile_y {
            // viewport cut by the tile's edge: estimate via the slope
            self.shift_left + self.slope_left * limit_y
        } else {
            self.bottom_left_x
        }
    }

    fn right_x_at(&self, limit_y: f64, tile_y: f64) -> f64 {
        if limit_y == tile_y {
            self.shift_right + self.slope_right * limit_y
        } else {
            self.bottom_right_x
        }
    }

    fn check_intersection(&self, tile: &TileViewport, wrap_left: bool) -> f64 {
        let (tile_top, tile_bottom) = tile.top_bottom();
        let top_y = tile_top.min(self.top_y);
        let bottom_y = tile_bottom.max(self.bottom_y);
        let height = top_y - bottom_y;
        if height <= 0.0 {
            return 0.0;
        }

        let (mut tile_left, mut tile_right) = tile.left_right();
        if wrap_left {
            if tile_right > 0.0 {
                tile_left -= 360.0;
                tile_right -= 360.0;
            } else {
                tile_left += 360.0;
                tile_right += 360.0;
            }
        }

        let top_left_vp = self.left_x_at(top_y, tile_top);
        let top_right_vp = self.right_x_at(top_y, tile_top);

        if top_right_vp < -180.0 {
            // viewport passes +-180 from the -180 side
            if top_right_vp <= tile_left - 360.0 {
                if tile_right > top_left_vp {
                    tile_left -= 360.0;
                    tile_right -= 360.0;
                } else if tile_right <= -180.0 && tile_left >= 180.0 {
                    // tile covers effectively the full circle
                    tile_right -= 360.0;
                }
            }
        } else if top_left_vp > 180.0 {
            // viewport passes +-180 from the +180 side
            if top_left_vp >= tile_right + 360.0 {
                if tile_left < top_right_vp {
                    tile_left += 360.0;
                    tile_right += 360.0;
                } else if tile_right <= -180.0 && tile_left >= 180.0 {
                    tile_left += 360.0;
                }
            }
        }

        let top_left_x = if tile_left <= top_left_vp {
            tile_left
        } else if top_left_vp >= tile_right {
            top_left_vp
        } else {
            tile_right
        };
        let top_right_x = if tile_right >= top_right_vp {
            tile_right
        } else if top_right_vp <= tile_left {
            top_right_vp
        } else {
            tile_left
        };

        let bottom_left_vp = self.left_x_at(bottom_y, tile_bottom);
        let bottom_right_vp = self.right_x_at(bottom_y, tile_bottom);

        let bottom_left_x = if tile_left <= bottom_left_vp {
            tile_left
        } else if bottom_left_vp >= tile_right {
            bottom_left_vp
        } else {
            tile_right
        };
        let bottom_right_x = if tile_right >= bottom_right_vp {
            tile_right
        } else if bottom_right_vp <= tile_left {
            bottom_right_vp
        } else {
            tile_left
        };

        if top_left_x - top_right_x >= 0.0 || bottom_left_x - bottom_right_x >= 0.0 {
            // average of the left and right positions; the halving is
            // dropped since only the ordering matters
            height * ((top_left_x + bottom_left_x) - (top_right_x + bottom_right_x))
        } else {
            0.0
        }
    }

    fn intersection_width(&self, mut tile_left: f64, mut tile_right: f64) -> f64 {
        let mut left = self.top_left_x;
        let mut right = self.top_right_x;

        if right < -180.0 {
            if right <= tile_left - 360.0 {
                if tile_right > left {
                    tile_left -= 360.0;
                    tile_right -= 360.0;
                } else if tile_right <= -180.0 && tile_left >= 180.0 {
                    tile_right -= 360.0;
                }
            }
        } else if left > 180.0 {
            if left >= tile_right + 360.0 {
                if tile_left < right {
                    tile_left += 360.0;
                    tile_right += 360.0;
                } else if tile_right <= -180.0 && tile_left >= 180.0 {
                    tile_left += 360.0;
                }
            }
        }

        if tile_right >= right {
            right = tile_right;
        }
        if tile_left <= left {
            left = tile_left;
        }
        if left - right > 0.0 {
            left - right
        } else {
            0.0
        }
    }

    fn check_intersection_cube_middle(&self, tile: &TileViewport) -> f64 {
        let (tile_top, tile_bottom) = tile.top_bottom();
        let top_y = tile_top.min(self.top_y);
        let bottom_y = tile_bottom.max(self.bottom_y);
        let height = top_y - bottom_y;
        if height <= 0.0 {
            return 0.0;
        }
        let (tile_left, tile_right) = tile.left_right();
        height * self.intersection_width(tile_left, tile_right)
    }

    /// Top/bottom cube faces cover the full longitude circle, so a tile's
    /// angular width is scaled out to the share of the face it covers
    /// before the longitude test; the score is divided back by the same
    /// factor.
    fn check_intersection_cube_top_bottom(&self, tile: &TileViewport) -> f64 {
        let (tile_top, tile_bottom) = tile.top_bottom();
        let top_y = tile_top.min(self.top_y);
        let bottom_y = tile_bottom.max(self.bottom_y);
        let height = top_y - bottom_y;
        if height <= 0.0 {
            return 0.0;
        }

        let mut factor = 1.0;
        let (mut tile_left, mut tile_right) = tile.left_right();
        let width = (tile_left - tile_right).abs();

        if width > 89.0 {
            // 90 degrees wide: half a face; widen to 180
            tile_left += 45.0;
            tile_right -= 45.0;
            factor = 2.0;
            if (tile_top - tile_bottom).abs() > 45.0 {
                // a single tile covering the whole face
                tile_left = 180.0;
                tile_right = -180.0;
                factor = 4.0;
            }
        } else if width > 44.0 {
            // 45 degrees wide: four tiles per face; widen to 90
            tile_left += 22.5;
            tile_right -= 22.5;
            factor = 2.0;
            if (tile_top - tile_bottom).abs() > 45.0 {
                tile_left += 45.0;
                tile_right -= 45.0;
                factor = 4.0;
            }
        }

        height * self.intersection_width(tile_left, tile_right) / factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn equirect_tile(lon: f64, lat: f64, hor: f64, ver: f64) -> TileViewport {
        let mut tile = TileViewport::new(TileType::Equirect);
        tile.set(lon, lat, hor, ver, LongitudeDirection::CounterClockwise);
        tile
    }

    #[test]
    fn full_sphere_viewport_sees_every_tile_fully() {
        let mut viewport = RenderedViewport::default();
        viewport.set_position(0.0, 0.0, 360.0, 180.0, TileType::Equirect);
        // a 4x2 equirect tile grid
        for col in 0..4 {
            for row in 0..2 {
                let lon = -135.0 + col as f64 * 90.0;
                let lat = -45.0 + row as f64 * 90.0;
                let tile = equirect_tile(lon, lat, 90.0, 90.0);
                let score = viewport.intersect(&tile);
                // unnormalized: height * (sum of left-right spans)
                assert_relative_eq!(score, 90.0 * 180.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn tile_outside_viewport_scores_zero() {
        let mut viewport = RenderedViewport::default();
        viewport.set_position(0.0, 0.0, 90.0, 90.0, TileType::Equirect);
        let behind = equirect_tile(180.0, 0.0, 90.0, 90.0);
        assert_eq!(viewport.intersect(&behind), 0.0);
    }

    #[test]
    fn wrap_across_dateline_reaches_opposite_tile() {
        let mut viewport = RenderedViewport::default();
        viewport.set_position(170.0, 0.0, 90.0, 90.0, TileType::Equirect);
        // tile fully on the other side of the +-180 boundary
        let tile = equirect_tile(-160.0, 0.0, 40.0, 90.0);
        assert!(viewport.intersect(&tile) > 0.0);
        // a tile the wrapped extent cannot reach
        let far = equirect_tile(-60.0, 0.0, 40.0, 90.0);
        assert_eq!(viewport.intersect(&far), 0.0);
    }

    #[test]
    fn closer_tile_ranks_higher() {
        let mut viewport = RenderedViewport::default();
        viewport.set_position(10.0, 0.0, 100.0, 90.0, TileType::Equirect);
        let center = equirect_tile(0.0, 0.0, 90.0, 90.0);
        let side = equirect_tile(90.0, 0.0, 90.0, 90.0);
        assert!(viewport.intersect(&center) > viewport.intersect(&side));
    }

    #[test]
    fn pole_crossing_widens_viewport() {
        let mut viewport = RenderedViewport::default();
        viewport.set_position(0.0, 80.0, 90.0, 60.0, TileType::Equirect);
        // viewport crosses the north pole; a tile on the opposite
        // longitude near the pole still intersects
        let tile = equirect_tile(180.0, 80.0, 45.0, 20.0);
        assert!(viewport.intersect(&tile) > 0.0);
    }

    #[test]
    fn cubemap_pole_face_scaling() {
        let mut viewport = RenderedViewport::default();
        viewport.set_position(0.0, 90.0, 90.0, 90.0, TileType::Cubemap);
        let mut quarter = TileViewport::new(TileType::Cubemap);
        quarter.set(0.0, 67.5, 45.0, 45.0, LongitudeDirection::CounterClockwise);
        let mut full_face = TileViewport::new(TileType::Cubemap);
        full_face.set(0.0, 67.5, 90.0, 90.0, LongitudeDirection::CounterClockwise);
        let quarter_score = viewport.intersect(&quarter);
        let full_score = viewport.intersect(&full_face);
        assert!(quarter_score > 0.0);
        assert!(full_score > quarter_score);
    }
}
