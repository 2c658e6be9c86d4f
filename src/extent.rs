//! XYZ tile address to EPSG:3857 extent conversion.
//!
//! Tile rows grow southward while the projection's y axis grows northward,
//! so `ymin` is the geographic *top* of the tile and `ymax` the bottom.
//! Every downstream query depends on that inversion being preserved.

/// Geographic bounds of a tile, plus the buffer-expanded bounds used to
/// avoid seams between adjacent tiles.
///
/// All values are in the projection's units (meters for web mercator).
/// `b_size` is the buffer half-width rescaled by the caller's resolution
/// factor; it is passed through to geometry simplification downstream and
/// not interpreted here.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoExtent {
    pub xmin: f64,
    /// Northern edge. Larger than `ymax` by the tile-row convention.
    pub ymin: f64,
    pub xmax: f64,
    /// Southern edge.
    pub ymax: f64,
    pub b_xmin: f64,
    pub b_ymin: f64,
    pub b_xmax: f64,
    pub b_ymax: f64,
    pub b_size: f64,
}

/// Pure tile-grid geometry over a fixed tile size and world extent.
///
/// Stateless apart from the two immutable parameters, so a single value can
/// serve concurrent renders.
#[derive(Clone, Copy, Debug)]
pub struct ExtentCalculator {
    tile_size: u32,
    tile_max_geosize: f64,
}

impl ExtentCalculator {
    pub fn new(tile_size: u32, tile_max_geosize: f64) -> Self {
        Self {
            tile_size,
            tile_max_geosize,
        }
    }

    /// Ground distance covered by one pixel at the given zoom level.
    pub fn resolution(&self, zoom: u8) -> f64 {
        let full_resolution = self.tile_max_geosize / f64::from(self.tile_size);
        full_resolution / f64::powi(2.0, i32::from(zoom))
    }

    /// Computes the extent of tile `(x, y)` at `zoom`, expanded on every
    /// side by half of `buffer_pixels` converted to ground units.
    ///
    /// `resolution_factor` only scales the pass-through `b_size`; it does
    /// not affect the bounds themselves.
    pub fn extent(
        &self,
        zoom: u8,
        x: i32,
        y: i32,
        buffer_pixels: u32,
        resolution_factor: f64,
    ) -> GeoExtent {
        let initial_resolution = self.resolution(0);
        let origin_shift = (initial_resolution * f64::from(self.tile_size)) / 2.0;

        let pixres = self.resolution(zoom);
        let tile_geo_size = f64::from(self.tile_size) * pixres;

        let buffer = f64::from(buffer_pixels) / 2.0;

        let xmin = -origin_shift + f64::from(x) * tile_geo_size;
        let xmax = -origin_shift + f64::from(x + 1) * tile_geo_size;

        // y-reversed tile grid: ymin is the top of the tile
        let ymin = origin_shift - f64::from(y) * tile_geo_size;
        let ymax = origin_shift - f64::from(y + 1) * tile_geo_size;

        GeoExtent {
            xmin,
            ymin,
            xmax,
            ymax,
            b_xmin: xmin - pixres * buffer,
            b_ymin: ymin + pixres * buffer,
            b_xmax: xmax + pixres * buffer,
            b_ymax: ymax - pixres * buffer,
            b_size: buffer / resolution_factor,
        }
    }
}
