//! Export grids, CRS handling and nearest-neighbour resampling onto a grid.
use crate::error::{CompositeError, Result};
use crate::study_area::BoundingBox;
use log::debug;
use ndarray::Array2;
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

pub const WGS84: u16 = 4326;

/// Metres per degree of latitude, used to turn a metre scale into degrees for
/// geographic outputs.
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Parse `EPSG:<code>` (case-insensitive prefix).
pub fn parse_crs(crs: &str) -> Result<u16> {
    let (authority, code) = crs
        .split_once(':')
        .ok_or_else(|| CompositeError::InvalidCrs(crs.to_string()))?;
    if !authority.trim().eq_ignore_ascii_case("EPSG") {
        return Err(CompositeError::InvalidCrs(crs.to_string()));
    }
    code.trim()
        .parse::<u16>()
        .map_err(|_| CompositeError::InvalidCrs(crs.to_string()))
}

pub fn proj_string(epsg: u16) -> Result<&'static str> {
    crs_definitions::from_code(epsg)
        .map(|def| def.proj4)
        .ok_or(CompositeError::UnsupportedCrs(epsg))
}

pub fn is_geographic(epsg: u16) -> bool {
    match proj_string(epsg) {
        Ok(p) => p.contains("+proj=longlat"),
        Err(_) => epsg == WGS84 || (4000..5000).contains(&epsg),
    }
}

/// A reusable transformation between two EPSG codes. Geographic coordinates
/// are exchanged in degrees.
pub struct Projector {
    source: Proj,
    target: Proj,
    source_geographic: bool,
    target_geographic: bool,
    identity: bool,
}

impl Projector {
    pub fn new(source_epsg: u16, target_epsg: u16) -> Result<Self> {
        let source = Proj::from_proj_string(proj_string(source_epsg)?).map_err(|e| {
            CompositeError::Projection(format!("EPSG:{source_epsg}: {e:?}"))
        })?;
        let target = Proj::from_proj_string(proj_string(target_epsg)?).map_err(|e| {
            CompositeError::Projection(format!("EPSG:{target_epsg}: {e:?}"))
        })?;
        Ok(Self {
            source,
            target,
            source_geographic: is_geographic(source_epsg),
            target_geographic: is_geographic(target_epsg),
            identity: source_epsg == target_epsg,
        })
    }

    pub fn project(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        if self.identity {
            return Ok((x, y));
        }
        let mut point = if self.source_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&self.source, &self.target, &mut point)
            .map_err(|e| CompositeError::Projection(format!("{e:?}")))?;
        if self.target_geographic {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }

    /// Envelope of the projected corners of `bbox`.
    pub fn project_bounds(&self, bbox: &BoundingBox) -> Result<BoundingBox> {
        let corners = [
            (bbox.min_x, bbox.min_y),
            (bbox.min_x, bbox.max_y),
            (bbox.max_x, bbox.min_y),
            (bbox.max_x, bbox.max_y),
        ];
        let mut out = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for (x, y) in corners {
            let (px, py) = self.project(x, y)?;
            out.min_x = out.min_x.min(px);
            out.min_y = out.min_y.min(py);
            out.max_x = out.max_x.max(px);
            out.max_y = out.max_y.max(py);
        }
        Ok(out)
    }
}

/// The pixel lattice of an export: bounds in `epsg`, north-up, square or
/// rectangular pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportGrid {
    pub epsg: u16,
    pub bounds: BoundingBox,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub width: usize,
    pub height: usize,
}

impl ExportGrid {
    /// Grid covering the lon/lat `region` at `scale` metres per pixel in
    /// `epsg`. For geographic targets the scale is converted to degrees at
    /// the region's centre latitude.
    pub fn from_region(region: &BoundingBox, scale: f64, epsg: u16) -> Result<Self> {
        if !(scale > 0.0) {
            return Err(CompositeError::InvalidRaster(format!(
                "scale must be positive, got {scale}"
            )));
        }
        let (bounds, pixel_width, pixel_height) = if is_geographic(epsg) {
            let (_, center_lat) = region.center();
            let cos_lat = center_lat.to_radians().cos().max(1e-12);
            let pixel_height = scale / METRES_PER_DEGREE;
            let pixel_width = scale / (METRES_PER_DEGREE * cos_lat);
            (*region, pixel_width, pixel_height)
        } else {
            let bounds = Projector::new(WGS84, epsg)?.project_bounds(region)?;
            (bounds, scale, scale)
        };
        let width = ((bounds.width() / pixel_width).ceil() as usize).max(1);
        let height = ((bounds.height() / pixel_height).ceil() as usize).max(1);
        debug!(
            "Export grid EPSG:{} {}x{} px ({:.8} x {:.8})",
            epsg, width, height, pixel_width, pixel_height
        );
        Ok(Self {
            epsg,
            bounds,
            pixel_width,
            pixel_height,
            width,
            height,
        })
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// World coordinate of the centre of pixel `(row, col)`.
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.bounds.min_x + (col as f64 + 0.5) * self.pixel_width,
            self.bounds.max_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// GDAL-style geotransform of the grid.
    pub fn geotransform(&self) -> GeoTransform {
        GeoTransform {
            origin_x: self.bounds.min_x,
            pixel_width: self.pixel_width,
            origin_y: self.bounds.max_y,
            pixel_height: -self.pixel_height,
        }
    }
}

/// North-up affine georeferencing (no rotation terms).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    /// Negative for north-up rasters.
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Fractional `(col, row)` of a world coordinate.
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }
}

/// One decoded band with its georeferencing.
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub data: Array2<f32>,
    pub transform: GeoTransform,
    pub epsg: u16,
}

impl GeoRaster {
    /// Nearest sample at a world coordinate in this raster's CRS, or `NaN`
    /// outside its extent.
    pub fn sample(&self, x: f64, y: f64) -> f32 {
        let (col, row) = self.transform.to_pixel(x, y);
        let (rows, cols) = self.data.dim();
        if col < 0.0 || row < 0.0 {
            return f32::NAN;
        }
        let (col, row) = (col.floor() as usize, row.floor() as usize);
        if row >= rows || col >= cols {
            return f32::NAN;
        }
        self.data[[row, col]]
    }
}

/// Grid pixel centres expressed in a source CRS. Built once per scene and
/// shared by every band of that scene.
pub struct SamplePlan {
    source_epsg: u16,
    shape: (usize, usize),
    points: Vec<Option<(f64, f64)>>,
}

impl SamplePlan {
    pub fn new(grid: &ExportGrid, source_epsg: u16) -> Result<Self> {
        let projector = Projector::new(grid.epsg, source_epsg)?;
        let mut points = Vec::with_capacity(grid.width * grid.height);
        for row in 0..grid.height {
            for col in 0..grid.width {
                let (x, y) = grid.pixel_center(row, col);
                // a point that cannot be projected simply has no sample
                points.push(projector.project(x, y).ok());
            }
        }
        Ok(Self {
            source_epsg,
            shape: grid.shape(),
            points,
        })
    }

    pub fn source_epsg(&self) -> u16 {
        self.source_epsg
    }

    /// Resample `raster` onto the plan's grid.
    pub fn resample(&self, raster: &GeoRaster) -> Result<Array2<f32>> {
        if raster.epsg != self.source_epsg {
            return Err(CompositeError::Projection(format!(
                "sample plan is for EPSG:{}, raster is EPSG:{}",
                self.source_epsg, raster.epsg
            )));
        }
        let values = self
            .points
            .iter()
            .map(|p| match p {
                Some((x, y)) => raster.sample(*x, *y),
                None => f32::NAN,
            })
            .collect::<Vec<_>>();
        Array2::from_shape_vec(self.shape, values)
            .map_err(|e| CompositeError::InvalidRaster(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_parse_crs() {
        assert_eq!(parse_crs("EPSG:4326").unwrap(), 4326);
        assert_eq!(parse_crs("epsg:32635").unwrap(), 32635);
        assert!(matches!(parse_crs("4326"), Err(CompositeError::InvalidCrs(_))));
        assert!(matches!(parse_crs("ESRI:102100"), Err(CompositeError::InvalidCrs(_))));
        assert!(matches!(parse_crs("EPSG:abc"), Err(CompositeError::InvalidCrs(_))));
    }

    #[test]
    fn test_geographic_grid_uses_degrees() {
        let region = BoundingBox::new(26.0, 44.0, 26.1, 44.1);
        let grid = ExportGrid::from_region(&region, 10.0, WGS84).unwrap();
        assert_relative_eq!(grid.pixel_height, 10.0 / 111_320.0);
        assert!(grid.pixel_width > grid.pixel_height);
        assert_eq!(grid.height, (0.1_f64 / (10.0 / 111_320.0)).ceil() as usize);
        assert_eq!(grid.bounds, region);
    }

    #[test]
    fn test_projected_grid_uses_metres() {
        let region = BoundingBox::new(26.05, 44.40, 26.15, 44.45);
        let grid = ExportGrid::from_region(&region, 10.0, 32635).unwrap();
        assert_eq!(grid.pixel_width, 10.0);
        // ~0.05 deg of latitude is ~5.5 km
        assert!(grid.height > 500 && grid.height < 600, "height {}", grid.height);
    }

    #[test]
    fn test_rejects_non_positive_scale() {
        let region = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert!(ExportGrid::from_region(&region, 0.0, WGS84).is_err());
    }

    #[test]
    fn test_projector_round_trip() {
        let forward = Projector::new(WGS84, 32635).unwrap();
        let back = Projector::new(32635, WGS84).unwrap();
        let (x, y) = forward.project(26.102857, 44.427597).unwrap();
        let (lon, lat) = back.project(x, y).unwrap();
        assert_relative_eq!(lon, 26.102857, epsilon = 1e-6);
        assert_relative_eq!(lat, 44.427597, epsilon = 1e-6);
    }

    #[test]
    fn test_resample_nearest_same_crs() {
        let raster = GeoRaster {
            data: array![[1.0, 2.0], [3.0, 4.0]],
            transform: GeoTransform {
                origin_x: 0.0,
                pixel_width: 1.0,
                origin_y: 2.0,
                pixel_height: -1.0,
            },
            epsg: WGS84,
        };
        // 4x4 grid at half the pixel size, extending one source pixel east
        let grid = ExportGrid {
            epsg: WGS84,
            bounds: BoundingBox::new(0.0, 0.0, 3.0, 2.0),
            pixel_width: 0.75,
            pixel_height: 0.5,
            width: 4,
            height: 4,
        };
        let plan = SamplePlan::new(&grid, WGS84).unwrap();
        let out = plan.resample(&raster).unwrap();
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(out[[0, 1]], 2.0);
        assert_eq!(out[[3, 0]], 3.0);
        assert_eq!(out[[3, 2]], 4.0);
        assert!(out[[0, 3]].is_nan());
    }
}
