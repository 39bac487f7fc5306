use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Axis-aligned bounding box. For lon/lat boxes x is longitude and y latitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Parse a STAC `bbox` array (2D or 3D form).
    pub fn from_stac(bbox: &[f64]) -> Option<Self> {
        match bbox.len() {
            4 => Some(Self::new(bbox[0], bbox[1], bbox[2], bbox[3])),
            6 => Some(Self::new(bbox[0], bbox[1], bbox[3], bbox[4])),
            _ => None,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn to_stac(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }
}

/// A circular study area: a point buffered by a radius in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StudyArea {
    pub longitude: f64,
    pub latitude: f64,
    pub radius_m: f64,
}

impl StudyArea {
    pub fn new(longitude: f64, latitude: f64, radius_m: f64) -> Self {
        Self {
            longitude,
            latitude,
            radius_m,
        }
    }

    /// Lon/lat box enclosing the circle.
    pub fn bounds(&self) -> BoundingBox {
        let d_lat = (self.radius_m / EARTH_RADIUS_M).to_degrees();
        let cos_lat = self.latitude.to_radians().cos().max(1e-12);
        let d_lon = (self.radius_m / (EARTH_RADIUS_M * cos_lat)).to_degrees();
        BoundingBox::new(
            self.longitude - d_lon,
            (self.latitude - d_lat).max(-90.0),
            self.longitude + d_lon,
            (self.latitude + d_lat).min(90.0),
        )
    }

    /// True when any part of the lon/lat `footprint` lies within the circle.
    pub fn intersects(&self, footprint: &BoundingBox) -> bool {
        let nearest_lon = self.longitude.clamp(footprint.min_x, footprint.max_x);
        let nearest_lat = self.latitude.clamp(footprint.min_y, footprint.max_y);
        haversine_m(self.longitude, self.latitude, nearest_lon, nearest_lat) <= self.radius_m
    }
}

/// Great-circle distance in metres between two lon/lat points.
pub fn haversine_m(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bucharest() -> StudyArea {
        StudyArea::new(26.102857, 44.427597, 5_000.0)
    }

    #[test]
    fn test_bounds_contain_radius() {
        let area = bucharest();
        let bounds = area.bounds();
        let north = haversine_m(area.longitude, area.latitude, area.longitude, bounds.max_y);
        let east = haversine_m(area.longitude, area.latitude, bounds.max_x, area.latitude);
        assert_relative_eq!(north, 5_000.0, max_relative = 1e-6);
        // along a parallel the great circle is slightly shorter than the box edge
        assert!(east <= 5_000.0 + 1e-6 && east > 4_990.0);
        assert!(bounds.width() > bounds.height());
    }

    #[test]
    fn test_intersects_footprint() {
        let area = bucharest();
        let containing = BoundingBox::new(25.0, 44.0, 27.0, 45.0);
        let touching_corner = BoundingBox::new(26.15, 44.45, 27.0, 45.0);
        let far_away = BoundingBox::new(28.0, 44.0, 29.0, 45.0);
        // inside the bounding box of the circle but outside the circle itself
        let bounds = area.bounds();
        let corner_only = BoundingBox::new(
            bounds.max_x - 0.001,
            bounds.max_y - 0.001,
            bounds.max_x + 1.0,
            bounds.max_y + 1.0,
        );

        assert!(area.intersects(&containing));
        assert!(area.intersects(&touching_corner));
        assert!(!area.intersects(&far_away));
        assert!(!area.intersects(&corner_only));
    }

    #[test]
    fn test_bbox_from_stac() {
        assert_eq!(
            BoundingBox::from_stac(&[1.0, 2.0, 0.0, 3.0, 4.0, 10.0]),
            Some(BoundingBox::new(1.0, 2.0, 3.0, 4.0))
        );
        assert_eq!(BoundingBox::from_stac(&[1.0, 2.0]), None);
    }
}
